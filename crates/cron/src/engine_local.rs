//! Engine that runs workflows as local shell commands.
//!
//! Run state lives in the shared store's run history, so any worker in the
//! fleet can poll a run started by another process. Only the process that
//! spawned a child can kill it; terminating a foreign run marks it failed.
//!
//! A child does not outlive the process that spawned it. While it runs, its
//! owner refreshes the run's heartbeat. A run whose heartbeat has gone stale
//! is reported failed by whichever worker polls it next.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        process::{Child, Command},
        sync::oneshot,
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    engine::ExecutionEngine,
    manager::default_holder,
    schedule::now_ms,
    store::CronStore,
    types::{CronPayload, CronRunRecord, RunHandle, RunState},
};

/// Environment variable carrying the job id to the workflow command.
pub const JOB_ID_ENV: &str = "FLEETCRON_JOB_ID";
/// Environment variable carrying the payload args (JSON) to the workflow command.
pub const ARGS_ENV: &str = "FLEETCRON_ARGS";
/// Environment variable carrying the run handle to the workflow command.
pub const RUN_HANDLE_ENV: &str = "FLEETCRON_RUN_HANDLE";

#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    /// How often the owner of a running workflow refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// A running run whose heartbeat is older than this is reported failed.
    pub stale_after: Duration,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(60),
        }
    }
}

struct LocalRun {
    kill: oneshot::Sender<String>,
    task: JoinHandle<()>,
}

type LocalRuns = Arc<Mutex<HashMap<RunHandle, LocalRun>>>;

fn lock_runs(runs: &LocalRuns) -> std::sync::MutexGuard<'_, HashMap<RunHandle, LocalRun>> {
    runs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct LocalEngine {
    store: Arc<dyn CronStore>,
    workflows: HashMap<String, String>,
    owner: String,
    config: LocalEngineConfig,
    runs: LocalRuns,
}

impl LocalEngine {
    /// `workflows` maps workflow names to shell commands run with `sh -c`.
    pub fn new(store: Arc<dyn CronStore>, workflows: HashMap<String, String>) -> Self {
        Self {
            store,
            workflows,
            owner: default_holder(),
            config: LocalEngineConfig::default(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: LocalEngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of children this process is supervising.
    pub fn running(&self) -> usize {
        lock_runs(&self.runs).len()
    }

    /// Wait until every workflow started by this process has exited and its
    /// outcome is recorded.
    pub async fn wait_idle(&self) {
        self.drain(None).await;
    }

    /// Kill every workflow started by this process and record them failed.
    pub async fn shutdown(&self, reason: &str) {
        self.drain(Some(reason)).await;
    }

    async fn drain(&self, kill_reason: Option<&str>) {
        let drained: Vec<(RunHandle, LocalRun)> = lock_runs(&self.runs).drain().collect();
        if !drained.is_empty() {
            info!(
                count = drained.len(),
                kill = kill_reason.is_some(),
                "waiting for local workflows"
            );
        }
        for (handle, LocalRun { kill, task }) in drained {
            if let Some(reason) = kill_reason {
                let _ = kill.send(reason.to_string());
            }
            if let Err(e) = task.await {
                warn!(handle = %handle, error = %e, "workflow supervisor failed");
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    async fn start(&self, job_id: &str, payload: &CronPayload) -> Result<RunHandle> {
        let command = self
            .workflows
            .get(&payload.workflow)
            .ok_or_else(|| Error::unknown_workflow(&payload.workflow))?;
        let handle = RunHandle(uuid::Uuid::new_v4().to_string());
        let started_at = now_ms();

        // Record the run before spawning so a child never runs untracked.
        self.store
            .insert_run(&CronRunRecord {
                owner: Some(self.owner.clone()),
                heartbeat_at_ms: Some(started_at),
                ..CronRunRecord::running(job_id, handle.clone(), started_at)
            })
            .await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env(JOB_ID_ENV, job_id)
            .env(ARGS_ENV, payload.args.to_string())
            .env(RUN_HANDLE_ENV, handle.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("failed to spawn workflow: {e}");
                if let Err(record_err) = self
                    .store
                    .finish_run(handle.as_str(), RunState::Failed, now_ms(), Some(&error))
                    .await
                {
                    warn!(handle = %handle, error = %record_err, "failed to record spawn failure");
                }
                return Err(e.into());
            },
        };

        let (kill_tx, kill_rx) = oneshot::channel::<String>();
        {
            // Held across the spawn so the supervisor cannot deregister first.
            let mut runs = lock_runs(&self.runs);
            let task = tokio::spawn(supervise(
                child,
                kill_rx,
                Arc::clone(&self.store),
                Arc::clone(&self.runs),
                handle.clone(),
                self.config.heartbeat_interval,
            ));
            runs.insert(handle.clone(), LocalRun {
                kill: kill_tx,
                task,
            });
        }

        info!(job_id, workflow = %payload.workflow, handle = %handle, "workflow started");
        Ok(handle)
    }

    async fn status(&self, handle: &RunHandle) -> Result<Option<RunState>> {
        let Some(run) = self.store.get_run(handle.as_str()).await? else {
            return Ok(None);
        };
        if run.state != RunState::Running || lock_runs(&self.runs).contains_key(handle) {
            return Ok(Some(run.state));
        }
        // Runs from engines that do not heartbeat are taken at their word.
        let Some(last_seen) = run.heartbeat_at_ms else {
            return Ok(Some(run.state));
        };

        let now = now_ms();
        let stale_after_ms = u64::try_from(self.config.stale_after.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(last_seen) <= stale_after_ms {
            return Ok(Some(RunState::Running));
        }

        let owner = run.owner.as_deref().unwrap_or("unknown");
        warn!(
            handle = %handle,
            owner,
            last_seen_ms = last_seen,
            "workflow owner stopped reporting, marking run failed"
        );
        let error = format!("run owner {owner} stopped reporting");
        self.store
            .finish_run(handle.as_str(), RunState::Failed, now, Some(&error))
            .await?;
        Ok(Some(RunState::Failed))
    }

    async fn terminate(&self, handle: &RunHandle, reason: &str) -> Result<()> {
        let local = lock_runs(&self.runs).remove(handle);
        match local {
            Some(run) => {
                // The supervisor records the outcome once the child is gone.
                let _ = run.kill.send(reason.to_string());
            },
            None => {
                self.store
                    .finish_run(
                        handle.as_str(),
                        RunState::Failed,
                        now_ms(),
                        Some(&format!("terminated: {reason}")),
                    )
                    .await?;
            },
        }
        Ok(())
    }

    async fn discard(&self, handles: &[RunHandle]) -> Result<()> {
        let mut runs = lock_runs(&self.runs);
        for handle in handles {
            runs.remove(handle);
        }
        Ok(())
    }
}

/// Wait for the child, keep its heartbeat fresh, and record how it ended.
async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<String>,
    store: Arc<dyn CronStore>,
    runs: LocalRuns,
    handle: RunHandle,
    heartbeat_interval: Duration,
) {
    let period = heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut kill_open = true;

    let (state, error) = loop {
        tokio::select! {
            exit = child.wait() => break match exit {
                Ok(status) if status.success() => (RunState::Succeeded, None),
                Ok(status) => (RunState::Failed, Some(format!("workflow exited with {status}"))),
                Err(e) => (RunState::Failed, Some(format!("failed to wait on workflow: {e}"))),
            },
            kill = &mut kill_rx, if kill_open => match kill {
                Ok(reason) => {
                    if let Err(e) = child.kill().await {
                        warn!(handle = %handle, error = %e, "failed to kill workflow");
                    }
                    break (RunState::Failed, Some(format!("terminated: {reason}")));
                },
                // Discarded: the child keeps running unsupervised by callers.
                Err(_) => kill_open = false,
            },
            _ = heartbeat.tick() => {
                if let Err(e) = store.touch_run(handle.as_str(), now_ms()).await {
                    warn!(handle = %handle, error = %e, "failed to refresh workflow heartbeat");
                }
            },
        }
    };

    if let Err(e) = store
        .finish_run(handle.as_str(), state, now_ms(), error.as_deref())
        .await
    {
        warn!(handle = %handle, error = %e, "failed to record workflow outcome");
    }
    lock_runs(&runs).remove(&handle);
    debug!(handle = %handle, state = ?state, "workflow finished");
}
