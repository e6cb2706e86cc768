//! Per-job state machine, evaluated while holding the job's lease.
//!
//! A [`LockedJob`] is the only way to drive a job: it bundles the snapshot
//! read after the lease was taken, the lease itself, and the write-set of
//! fields changed since. Nothing reaches the store until [`LockedJob::flush`].

use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use fleetcron_metrics::{counter, cron as cron_metrics, histogram, labels};

use crate::{
    Error, Result,
    engine::ExecutionEngine,
    schedule,
    store::CronStore,
    types::{CronJob, JobStateUpdate, Lease, RunHandle, RunState, RunStatus, StateMap},
};

/// What a single evaluation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// A tracked run exceeded its lifetime and was terminated.
    pub timed_out: bool,
    /// Status recorded for a run that left tracking in this evaluation.
    pub reaped: Option<RunStatus>,
    /// Handle of a run started in this evaluation.
    pub started: Option<RunHandle>,
}

#[derive(Debug)]
pub struct LockedJob {
    job: CronJob,
    lease: Lease,
    pending: JobStateUpdate,
}

impl LockedJob {
    pub fn new(job: CronJob, lease: Lease) -> Result<Self> {
        if job.id != lease.job_id {
            return Err(Error::lock_not_held(job.id));
        }
        Ok(Self {
            job,
            lease,
            pending: JobStateUpdate::default(),
        })
    }

    /// Snapshot with staged changes applied.
    pub fn job(&self) -> &CronJob {
        &self.job
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Fields changed since the lease was taken and not yet flushed.
    pub fn pending(&self) -> &JobStateUpdate {
        &self.pending
    }

    pub fn into_lease(self) -> Lease {
        self.lease
    }

    pub fn due_to_run(&self, now_ms: u64) -> bool {
        schedule::due_to_run(&self.job, now_ms)
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.pending.disabled = Some(disabled);
        self.job.state.disabled = disabled;
    }

    pub fn set_state(&mut self, state: StateMap) {
        self.pending.state = Some(state.clone());
        self.job.state.state = state;
    }

    fn set_current_run(&mut self, handle: Option<RunHandle>) {
        self.pending.current_run = Some(handle.clone());
        self.job.state.current_run = handle;
    }

    fn set_last_status(&mut self, status: RunStatus) {
        self.pending.last_status = Some(status);
        self.job.state.last_status = Some(status);
    }

    fn set_last_run_at(&mut self, at_ms: u64) {
        self.pending.last_run_at_ms = Some(at_ms);
        self.job.state.last_run_at_ms = Some(at_ms);
    }

    fn ensure_live(&self, now_ms: u64) -> Result<()> {
        if self.lease.is_live(now_ms) {
            Ok(())
        } else {
            Err(Error::lock_not_held(&self.job.id))
        }
    }

    /// Milliseconds since the tracked run started.
    fn latency_ms(&self, now_ms: u64) -> u64 {
        self.job
            .state
            .last_run_at_ms
            .map(|at| now_ms.saturating_sub(at))
            .unwrap_or(0)
    }

    /// Advance the job: reap an overrun, reap a finished run, then start a
    /// new one if the job is enabled and either `force` is set or it is due.
    ///
    /// Changes made before an error stay staged, so a later flush commits
    /// exactly what happened.
    pub async fn run(
        &mut self,
        engine: &dyn ExecutionEngine,
        force: bool,
        now_ms: u64,
    ) -> Result<RunOutcome> {
        self.ensure_live(now_ms)?;

        let mut outcome = RunOutcome::default();
        if self.kill_overrun(engine, now_ms).await? {
            outcome.timed_out = true;
            outcome.reaped = Some(RunStatus::Timeout);
        }
        if let Some(status) = self.reap_finished(engine, now_ms).await? {
            outcome.reaped = Some(status);
        }

        if !self.job.state.disabled && (force || self.due_to_run(now_ms)) {
            let handle = engine.start(&self.job.id, &self.job.spec.payload).await?;
            info!(
                job_id = %self.job.id,
                workflow = %self.job.spec.payload.workflow,
                handle = %handle,
                force,
                "cron: run started"
            );
            #[cfg(feature = "metrics")]
            counter!(cron_metrics::JOBS_STARTED, labels::JOB => self.job.id.clone()).increment(1);

            self.set_current_run(Some(handle.clone()));
            self.set_last_run_at(now_ms);
            outcome.started = Some(handle);
        }

        Ok(outcome)
    }

    async fn kill_overrun(&mut self, engine: &dyn ExecutionEngine, now_ms: u64) -> Result<bool> {
        let (Some(handle), Some(lifetime_ms), Some(last_run_at)) = (
            self.job.state.current_run.clone(),
            self.job.spec.lifetime_ms,
            self.job.state.last_run_at_ms,
        ) else {
            return Ok(false);
        };
        if now_ms.saturating_sub(last_run_at) <= lifetime_ms {
            return Ok(false);
        }
        if engine.status(&handle).await? != Some(RunState::Running) {
            return Ok(false);
        }

        let reason = format!("run exceeded lifetime of {lifetime_ms}ms");
        if let Err(e) = engine.terminate(&handle, &reason).await {
            warn!(job_id = %self.job.id, handle = %handle, error = %e, "cron: terminate request failed");
        }
        let latency_ms = self.latency_ms(now_ms);
        warn!(job_id = %self.job.id, handle = %handle, latency_ms, "cron: run timed out");
        #[cfg(feature = "metrics")]
        {
            counter!(cron_metrics::JOB_TIMEOUT, labels::JOB => self.job.id.clone()).increment(1);
            histogram!(cron_metrics::JOB_LATENCY_SECONDS, labels::JOB => self.job.id.clone())
                .record(latency_ms as f64 / 1000.0);
        }

        self.set_last_status(RunStatus::Timeout);
        self.set_current_run(None);
        Ok(true)
    }

    async fn reap_finished(
        &mut self,
        engine: &dyn ExecutionEngine,
        now_ms: u64,
    ) -> Result<Option<RunStatus>> {
        let Some(handle) = self.job.state.current_run.clone() else {
            return Ok(None);
        };

        let status = match engine.status(&handle).await? {
            Some(RunState::Running) => return Ok(None),
            Some(RunState::Succeeded) => RunStatus::Ok,
            Some(RunState::Failed) => RunStatus::Error,
            None => {
                error!(job_id = %self.job.id, handle = %handle, "cron: engine does not know tracked run, dropping it");
                self.set_current_run(None);
                return Ok(None);
            },
        };

        let latency_ms = self.latency_ms(now_ms);
        debug!(job_id = %self.job.id, handle = %handle, status = ?status, latency_ms, "cron: run finished");
        #[cfg(feature = "metrics")]
        {
            if status == RunStatus::Error {
                counter!(cron_metrics::JOB_FAILURE, labels::JOB => self.job.id.clone())
                    .increment(1);
            }
            histogram!(cron_metrics::JOB_LATENCY_SECONDS, labels::JOB => self.job.id.clone())
                .record(latency_ms as f64 / 1000.0);
        }

        self.set_last_status(status);
        self.set_current_run(None);
        Ok(Some(status))
    }

    /// Commit the write-set under the lease. A no-op when nothing changed.
    pub async fn flush(&mut self, store: &dyn CronStore, now_ms: u64) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let update = std::mem::take(&mut self.pending);
        store.write_state(&self.lease, &update, now_ms).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            engine_memory::InMemoryEngine,
            store_memory::InMemoryStore,
            types::{CronJobSpec, CronJobState, CronPayload},
        },
    };

    const MINUTE: u64 = 60_000;
    const HOUR: u64 = 60 * MINUTE;
    const NOW: u64 = 1_700_000_000_000;

    fn make_spec(lifetime_ms: Option<u64>, allow_overruns: bool) -> CronJobSpec {
        CronJobSpec {
            periodicity_ms: HOUR,
            lifetime_ms,
            allow_overruns,
            start_time_ms: 0,
            payload: CronPayload::new("cleanup"),
            description: String::new(),
        }
    }

    fn make_locked(spec: CronJobSpec, state: CronJobState) -> LockedJob {
        let job = CronJob {
            id: "job-a".into(),
            spec,
            state,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let lease = Lease {
            job_id: "job-a".into(),
            token: "tok".into(),
            holder: "test".into(),
            expires_at_ms: NOW + 10 * MINUTE,
        };
        LockedJob::new(job, lease).unwrap()
    }

    #[tokio::test]
    async fn test_first_run_starts() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState::default());

        let outcome = job.run(&engine, false, NOW).await.unwrap();
        let handle = outcome.started.unwrap();
        assert_eq!(job.job().state.current_run.as_ref(), Some(&handle));
        assert_eq!(job.job().state.last_run_at_ms, Some(NOW));
        assert_eq!(engine.started("job-a"), vec![handle]);
    }

    #[tokio::test]
    async fn test_no_second_start_while_running() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState::default());
        let first = job.run(&engine, false, NOW).await.unwrap().started.unwrap();

        // Period elapsed, run still going.
        let outcome = job.run(&engine, false, NOW + 2 * HOUR).await.unwrap();
        assert!(outcome.started.is_none());
        assert!(outcome.reaped.is_none());
        assert_eq!(job.job().state.current_run, Some(first));
        assert_eq!(engine.started("job-a").len(), 1);
    }

    #[tokio::test]
    async fn test_overrun_allowed_starts_again() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, true), CronJobState::default());
        job.run(&engine, false, NOW).await.unwrap();

        let outcome = job.run(&engine, false, NOW + 2 * HOUR).await.unwrap();
        assert!(outcome.started.is_some());
        assert_eq!(engine.started("job-a").len(), 2);
    }

    #[tokio::test]
    async fn test_lifetime_exceeded_times_out() {
        let engine = InMemoryEngine::new();
        let handle = engine
            .start("job-a", &CronPayload::new("cleanup"))
            .await
            .unwrap();
        let mut job = make_locked(make_spec(Some(10 * MINUTE), false), CronJobState {
            current_run: Some(handle.clone()),
            last_run_at_ms: Some(NOW - 15 * MINUTE),
            ..Default::default()
        });

        let outcome = job.run(&engine, false, NOW).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.reaped, Some(RunStatus::Timeout));
        assert_eq!(engine.terminated(), vec![handle]);
        assert_eq!(job.job().state.last_status, Some(RunStatus::Timeout));
        assert!(job.job().state.current_run.is_none());
        // Period has not elapsed since the timed out run started.
        assert!(outcome.started.is_none());
    }

    #[tokio::test]
    async fn test_within_lifetime_keeps_running() {
        let engine = InMemoryEngine::new();
        let handle = engine
            .start("job-a", &CronPayload::new("cleanup"))
            .await
            .unwrap();
        let mut job = make_locked(make_spec(Some(10 * MINUTE), false), CronJobState {
            current_run: Some(handle.clone()),
            last_run_at_ms: Some(NOW - 5 * MINUTE),
            ..Default::default()
        });

        let outcome = job.run(&engine, false, NOW).await.unwrap();
        assert_eq!(outcome, RunOutcome::default());
        assert!(engine.terminated().is_empty());
        assert!(job.pending().is_empty());
    }

    #[tokio::test]
    async fn test_finished_run_reaped_then_restarted() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState::default());
        let first = job.run(&engine, false, NOW).await.unwrap().started.unwrap();
        engine.complete(&first, RunState::Failed).await.unwrap();

        let outcome = job.run(&engine, false, NOW + 2 * HOUR).await.unwrap();
        assert_eq!(outcome.reaped, Some(RunStatus::Error));
        let second = outcome.started.unwrap();
        assert_ne!(first, second);
        assert_eq!(job.job().state.last_status, Some(RunStatus::Error));
        assert_eq!(job.job().state.current_run, Some(second));
    }

    #[tokio::test]
    async fn test_terminal_run_past_lifetime_is_reaped_not_timed_out() {
        let engine = InMemoryEngine::new();
        let handle = engine
            .start("job-a", &CronPayload::new("cleanup"))
            .await
            .unwrap();
        engine.complete(&handle, RunState::Succeeded).await.unwrap();
        let mut job = make_locked(make_spec(Some(MINUTE), false), CronJobState {
            current_run: Some(handle),
            last_run_at_ms: Some(NOW - 5 * MINUTE),
            ..Default::default()
        });

        let outcome = job.run(&engine, false, NOW).await.unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.reaped, Some(RunStatus::Ok));
        assert!(engine.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_handle_is_dropped() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState {
            current_run: Some(RunHandle("ghost".into())),
            last_run_at_ms: Some(NOW - MINUTE),
            last_status: Some(RunStatus::Ok),
            ..Default::default()
        });

        let outcome = job.run(&engine, false, NOW).await.unwrap();
        assert!(outcome.reaped.is_none());
        assert!(job.job().state.current_run.is_none());
        assert_eq!(job.job().state.last_status, Some(RunStatus::Ok));
        assert_eq!(job.pending().last_status, None);
    }

    #[tokio::test]
    async fn test_force_starts_before_due() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState {
            last_run_at_ms: Some(NOW - MINUTE),
            ..Default::default()
        });

        assert!(job.run(&engine, false, NOW).await.unwrap().started.is_none());
        assert!(job.run(&engine, true, NOW).await.unwrap().started.is_some());
    }

    #[tokio::test]
    async fn test_force_never_starts_disabled() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState {
            disabled: true,
            ..Default::default()
        });

        assert!(job.run(&engine, true, NOW).await.unwrap().started.is_none());
        assert!(engine.started("job-a").is_empty());
    }

    #[tokio::test]
    async fn test_lapsed_lease_rejected() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState::default());
        let err = job.run(&engine, false, NOW + HOUR).await.unwrap_err();
        assert!(matches!(err, Error::LockNotHeld { .. }));
        assert!(engine.started("job-a").is_empty());
    }

    #[tokio::test]
    async fn test_start_error_keeps_earlier_changes_staged() {
        let engine = InMemoryEngine::new();
        let mut job = make_locked(make_spec(None, false), CronJobState::default());
        let first = job.run(&engine, false, NOW).await.unwrap().started.unwrap();
        engine.complete(&first, RunState::Succeeded).await.unwrap();
        engine.refuse_starts(true);

        assert!(job.run(&engine, false, NOW + 2 * HOUR).await.is_err());
        assert_eq!(job.pending().last_status, Some(RunStatus::Ok));
        assert_eq!(job.pending().current_run, Some(None));
        assert_eq!(job.pending().last_run_at_ms, Some(NOW));
    }

    #[test]
    fn test_mismatched_lease_rejected() {
        let job = CronJob {
            id: "job-b".into(),
            spec: make_spec(None, false),
            state: CronJobState::default(),
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let lease = Lease {
            job_id: "job-a".into(),
            token: "tok".into(),
            holder: "test".into(),
            expires_at_ms: NOW,
        };
        assert!(LockedJob::new(job, lease).is_err());
    }

    #[tokio::test]
    async fn test_flush_commits_write_set() {
        let store = InMemoryStore::new();
        let now = schedule::now_ms();
        store
            .put_job("job-a", &make_spec(None, false), false, now)
            .await
            .unwrap();
        let lease = store
            .acquire_lease("job-a", "test", 10 * MINUTE, now)
            .await
            .unwrap()
            .unwrap();
        let snapshot = store.load_job("job-a").await.unwrap().unwrap();
        let engine = InMemoryEngine::new();

        let mut job = LockedJob::new(snapshot, lease).unwrap();
        let handle = job.run(&engine, false, now).await.unwrap().started.unwrap();
        job.flush(&store, now).await.unwrap();
        assert!(job.pending().is_empty());
        // Nothing staged, nothing written.
        job.flush(&store, now).await.unwrap();

        let stored = store.load_job("job-a").await.unwrap().unwrap();
        assert_eq!(stored.state.current_run, Some(handle));
        assert_eq!(stored.state.last_run_at_ms, Some(now));
    }
}
