//! Background loop that keeps jobs moving.

use std::time::Duration;

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info},
};

#[cfg(feature = "metrics")]
use fleetcron_metrics::{counter, cron as cron_metrics};

use crate::{
    manager::CronManager,
    system::{SystemJobRegistry, schedule_system_jobs},
};

#[derive(Debug, Clone)]
pub struct CronWorkerConfig {
    /// Pause between scheduling passes.
    pub interval: Duration,
    /// System jobs to register disabled.
    pub disabled_system_jobs: Vec<String>,
}

impl Default for CronWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            disabled_system_jobs: Vec::new(),
        }
    }
}

/// Registers system jobs, then calls `run_once` every interval until stopped.
#[derive(Clone)]
pub struct CronWorker {
    manager: CronManager,
    registry: SystemJobRegistry,
    config: CronWorkerConfig,
    cancel: CancellationToken,
}

impl CronWorker {
    pub fn new(manager: CronManager, registry: SystemJobRegistry, config: CronWorkerConfig) -> Self {
        Self {
            manager,
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the loop to exit. It finishes the pass in progress, if any.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run().await })
    }

    pub async fn run(&self) {
        if let Err(e) = schedule_system_jobs(
            &self.manager,
            &self.registry,
            &self.config.disabled_system_jobs,
        )
        .await
        {
            error!(error = %e, "cron: failed to schedule system jobs");
            #[cfg(feature = "metrics")]
            counter!(cron_metrics::INTERNAL_ERROR).increment(1);
        }

        info!(
            holder = self.manager.holder(),
            interval_secs = self.config.interval.as_secs(),
            "cron: worker started"
        );
        while !self.cancel.is_cancelled() {
            match self.manager.run_once(None, false).await {
                Ok(report) => debug!(
                    evaluated = report.evaluated.len(),
                    started = report.started.len(),
                    "cron: worker pass done"
                ),
                Err(e) => {
                    error!(error = %e, "cron: worker pass failed");
                    #[cfg(feature = "metrics")]
                    counter!(cron_metrics::INTERNAL_ERROR).increment(1);
                },
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {},
            }
        }
        info!("cron: worker stopped");
    }
}
