//! System jobs declared in the `[[system_jobs]]` config section.

use std::{sync::Arc, time::Duration};

use {
    fleetcron_config::SystemJobEntry,
    fleetcron_cron::{Result, SystemCronJob, SystemJobRegistry, types::CronPayload},
};

pub struct ConfiguredSystemJob {
    entry: SystemJobEntry,
}

impl ConfiguredSystemJob {
    pub fn new(entry: SystemJobEntry) -> Self {
        Self { entry }
    }
}

impl SystemCronJob for ConfiguredSystemJob {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn frequency(&self) -> Duration {
        match self.entry.frequency_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn lifetime(&self) -> Option<Duration> {
        match self.entry.lifetime_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(20 * 60 * 60)),
        }
    }

    fn allow_overruns(&self) -> bool {
        self.entry.allow_overruns
    }

    fn enabled(&self) -> bool {
        self.entry.enabled
    }

    fn stateful(&self) -> bool {
        self.entry.stateful
    }

    fn description(&self) -> String {
        self.entry.description.clone()
    }

    fn payload(&self) -> CronPayload {
        let workflow = self
            .entry
            .workflow
            .clone()
            .unwrap_or_else(|| self.entry.name.clone());
        CronPayload::new(workflow).with_args(self.entry.args.clone())
    }
}

pub fn build_registry(entries: &[SystemJobEntry]) -> Result<SystemJobRegistry> {
    let mut registry = SystemJobRegistry::new();
    for entry in entries {
        registry.register(Arc::new(ConfiguredSystemJob::new(entry.clone())))?;
    }
    Ok(registry)
}
