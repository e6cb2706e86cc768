//! Management surface over the job store: create, inspect, toggle, delete,
//! prune, and run every due job once under its lease.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use fleetcron_metrics::{counter, cron as cron_metrics, labels};

use crate::{
    Error, Result,
    engine::ExecutionEngine,
    job::{LockedJob, RunOutcome},
    schedule::now_ms,
    state::CronStateAccess,
    store::CronStore,
    types::{
        CronJobCreate, CronJobRecord, CronJobSpec, CronRunRecord, JobHistory, Lease, RunHandle,
        RunOnceReport,
    },
};

/// Tunables for lease handling.
#[derive(Debug, Clone)]
pub struct CronManagerConfig {
    /// TTL of leases taken by `run_once` and management operations.
    pub lease_duration: Duration,
    /// How many times management operations try to take a contended lease.
    pub management_lease_attempts: u32,
    /// Pause between those attempts.
    pub management_lease_retry: Duration,
}

impl Default for CronManagerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(600),
            management_lease_attempts: 10,
            management_lease_retry: Duration::from_millis(200),
        }
    }
}

/// Lease holder identity for this process: `host:pid:nonce`.
pub fn default_holder() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

#[derive(Clone)]
pub struct CronManager {
    store: Arc<dyn CronStore>,
    engine: Arc<dyn ExecutionEngine>,
    holder: String,
    config: CronManagerConfig,
}

impl CronManager {
    pub fn new(
        store: Arc<dyn CronStore>,
        engine: Arc<dyn ExecutionEngine>,
        config: CronManagerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            holder: default_holder(),
            config,
        }
    }

    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn store(&self) -> &Arc<dyn CronStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn state_access(&self) -> CronStateAccess {
        CronStateAccess::new(self.clone())
    }

    fn lease_ttl_ms(&self) -> u64 {
        self.config.lease_duration.as_millis() as u64
    }

    // ── Definitions ─────────────────────────────────────────────────────

    /// Create a job, or redefine it when the id already exists.
    ///
    /// A redefinition keeps the original start time and the job's runtime
    /// state. Returns the job id.
    pub async fn create_job(&self, create: CronJobCreate) -> Result<String> {
        if create.payload.workflow.trim().is_empty() {
            return Err(Error::message("workflow must not be empty"));
        }
        if create.periodicity_ms == 0 {
            return Err(Error::message("periodicity must be > 0"));
        }
        if create.lifetime_ms == Some(0) {
            return Err(Error::message("lifetime must be > 0"));
        }

        let id = match create.id {
            Some(id) if !id.trim().is_empty() => id,
            Some(_) => return Err(Error::message("job id must not be empty")),
            None => format!(
                "{}_{}",
                create.payload.workflow,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
        };

        let now = now_ms();
        let existing = self.store.load_job(&id).await?;
        let start_time_ms = existing
            .as_ref()
            .map(|job| job.spec.start_time_ms)
            .or(create.start_time_ms)
            .unwrap_or(now);

        let spec = CronJobSpec {
            periodicity_ms: create.periodicity_ms,
            lifetime_ms: create.lifetime_ms,
            allow_overruns: create.allow_overruns,
            start_time_ms,
            payload: create.payload,
            description: create.description,
        };
        self.store.put_job(&id, &spec, !create.enabled, now).await?;

        info!(
            job_id = %id,
            workflow = %spec.payload.workflow,
            periodicity_ms = spec.periodicity_ms,
            redefined = existing.is_some(),
            "cron: job defined"
        );
        Ok(id)
    }

    pub async fn list_jobs(&self) -> Result<Vec<String>> {
        self.store.list_job_ids().await
    }

    pub async fn read_job(&self, id: &str, history: bool) -> Result<CronJobRecord> {
        let job = self
            .store
            .load_job(id)
            .await?
            .ok_or_else(|| Error::job_not_found(id))?;
        let history = if history {
            Some(self.history(id).await?)
        } else {
            None
        };
        Ok(CronJobRecord { job, history })
    }

    /// Read several jobs in one store round-trip. `None` reads all of them.
    pub async fn read_jobs(
        &self,
        ids: Option<&[String]>,
        history: bool,
    ) -> Result<Vec<CronJobRecord>> {
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.store.list_job_ids().await?,
        };
        let jobs = self.store.load_jobs(&ids).await?;
        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs {
            let history = if history {
                Some(self.history(&job.id).await?)
            } else {
                None
            };
            records.push(CronJobRecord { job, history });
        }
        Ok(records)
    }

    pub async fn read_job_runs(&self, id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        self.store.get_runs(id, limit).await
    }

    async fn history(&self, id: &str) -> Result<JobHistory> {
        Ok(JobHistory {
            fields: self.store.field_history(id).await?,
            runs: self.store.get_runs(id, usize::MAX).await?,
        })
    }

    // ── Mutations under lease ───────────────────────────────────────────

    pub async fn enable_job(&self, id: &str) -> Result<()> {
        self.set_disabled(id, false).await
    }

    pub async fn disable_job(&self, id: &str) -> Result<()> {
        self.set_disabled(id, true).await
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        let mut job = self.lock_job_with_retry(id).await?;
        job.set_disabled(disabled);
        let result = job.flush(self.store.as_ref(), now_ms()).await;
        self.release(&job.into_lease()).await;
        if result.is_ok() {
            info!(job_id = %id, disabled, "cron: job toggled");
        }
        result
    }

    /// Take the job's lease, retrying while another caller holds it.
    pub(crate) async fn lock_job_with_retry(&self, id: &str) -> Result<LockedJob> {
        let attempts = self.config.management_lease_attempts.max(1);
        for attempt in 1..=attempts {
            let lease = self
                .store
                .acquire_lease(id, &self.holder, self.lease_ttl_ms(), now_ms())
                .await?;
            if let Some(lease) = lease {
                let Some(job) = self.store.load_job(id).await? else {
                    self.release(&lease).await;
                    return Err(Error::job_not_found(id));
                };
                return LockedJob::new(job, lease);
            }
            debug!(job_id = %id, attempt, "cron: lease busy, retrying");
            if attempt < attempts {
                tokio::time::sleep(self.config.management_lease_retry).await;
            }
        }
        #[cfg(feature = "metrics")]
        counter!(cron_metrics::LEASE_CONTENDED, labels::JOB => id.to_string()).increment(1);
        Err(Error::lease_contended(id))
    }

    pub(crate) async fn release(&self, lease: &Lease) {
        if let Err(e) = self.store.release_lease(lease).await {
            warn!(job_id = %lease.job_id, error = %e, "cron: failed to release lease");
        }
    }

    /// Remove a job with its lease and history. Does not wait for the lease:
    /// a holder's next write is rejected because the lease is gone.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.store.delete_job(id).await?;
        info!(job_id = %id, "cron: job deleted");
        Ok(())
    }

    /// Delete runs of `job_id` that started strictly before `cutoff_ms`.
    /// Returns how many were removed.
    pub async fn delete_old_runs(&self, job_id: &str, cutoff_ms: u64) -> Result<usize> {
        let removed = self.store.delete_runs_before(job_id, cutoff_ms).await?;
        if !removed.is_empty() {
            let handles: Vec<RunHandle> = removed.iter().map(|r| r.handle.clone()).collect();
            self.engine.discard(&handles).await?;
        }
        info!(job_id, cutoff_ms, removed = removed.len(), "cron: run history pruned");
        Ok(removed.len())
    }

    // ── Scheduling pass ─────────────────────────────────────────────────

    /// Evaluate each named job (all jobs when `None`) once.
    ///
    /// Jobs whose lease is held elsewhere are skipped. A failure on one job
    /// is logged and counted, and the pass moves on to the next.
    pub async fn run_once(&self, names: Option<&[String]>, force: bool) -> Result<RunOnceReport> {
        let ids = match names {
            Some(names) => names.to_vec(),
            None => self.store.list_job_ids().await?,
        };

        let mut report = RunOnceReport::default();
        for id in ids {
            let lease = match self
                .store
                .acquire_lease(&id, &self.holder, self.lease_ttl_ms(), now_ms())
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(job_id = %id, "cron: lease held elsewhere, skipping");
                    #[cfg(feature = "metrics")]
                    counter!(cron_metrics::LEASE_CONTENDED, labels::JOB => id.clone())
                        .increment(1);
                    report.skipped_locked.push(id);
                    continue;
                },
                Err(e) => {
                    self.record_failure(&id, &e);
                    report.failed.push(id);
                    continue;
                },
            };

            let result = self.evaluate(&lease, force).await;
            self.release(&lease).await;
            match result {
                Ok(outcome) => {
                    if outcome.started.is_some() {
                        report.started.push(id.clone());
                    }
                    report.evaluated.push(id);
                },
                Err(e) => {
                    self.record_failure(&id, &e);
                    report.failed.push(id);
                },
            }
        }

        debug!(
            evaluated = report.evaluated.len(),
            started = report.started.len(),
            skipped = report.skipped_locked.len(),
            failed = report.failed.len(),
            "cron: pass complete"
        );
        Ok(report)
    }

    async fn evaluate(&self, lease: &Lease, force: bool) -> Result<RunOutcome> {
        let job = self
            .store
            .load_job(&lease.job_id)
            .await?
            .ok_or_else(|| Error::job_not_found(&lease.job_id))?;
        let mut locked = LockedJob::new(job, lease.clone())?;

        let outcome = locked.run(self.engine.as_ref(), force, now_ms()).await;
        let flushed = locked.flush(self.store.as_ref(), now_ms()).await;
        match (outcome, flushed) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!(job_id = %lease.job_id, error = %flush_err, "cron: failed to commit partial state");
                Err(e)
            },
        }
    }

    fn record_failure(&self, id: &str, e: &Error) {
        error!(job_id = %id, error = %e, "cron: job evaluation failed");
        #[cfg(feature = "metrics")]
        counter!(cron_metrics::INTERNAL_ERROR, labels::JOB => id.to_string()).increment(1);
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
            types::{CronPayload, JobField, JobStateUpdate, RunState, RunStatus},
        },
    };

    const MINUTE: u64 = 60_000;
    const HOUR: u64 = 60 * MINUTE;

    struct Harness {
        store: Arc<InMemoryStore>,
        engine: Arc<InMemoryEngine>,
        manager: CronManager,
    }

    fn make_harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(InMemoryEngine::with_store(store.clone()));
        let manager = CronManager::new(store.clone(), engine.clone(), CronManagerConfig {
            lease_duration: Duration::from_secs(600),
            management_lease_attempts: 2,
            management_lease_retry: Duration::from_millis(1),
        })
        .with_holder("w2");
        Harness {
            store,
            engine,
            manager,
        }
    }

    fn hourly(id: &str) -> CronJobCreate {
        CronJobCreate {
            id: Some(id.into()),
            payload: CronPayload::new("cleanup"),
            periodicity_ms: HOUR,
            lifetime_ms: None,
            allow_overruns: false,
            start_time_ms: None,
            description: String::new(),
            enabled: true,
        }
    }

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let h = make_harness();
        let mut create = hourly("x");
        create.id = None;
        let id = h.manager.create_job(create).await.unwrap();
        assert!(id.starts_with("cleanup_"));
        assert_eq!(id.len(), "cleanup_".len() + 8);
        assert_eq!(h.manager.list_jobs().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let h = make_harness();
        let mut zero = hourly("a");
        zero.periodicity_ms = 0;
        assert!(h.manager.create_job(zero).await.is_err());

        let mut no_workflow = hourly("a");
        no_workflow.payload = CronPayload::new(" ");
        assert!(h.manager.create_job(no_workflow).await.is_err());
    }

    #[tokio::test]
    async fn test_redefinition_preserves_start_time() {
        let h = make_harness();
        let mut first = hourly("a");
        first.start_time_ms = Some(1_000);
        h.manager.create_job(first).await.unwrap();

        let mut second = hourly("a");
        second.start_time_ms = Some(9_000);
        second.periodicity_ms = 2 * HOUR;
        h.manager.create_job(second).await.unwrap();

        let record = h.manager.read_job("a", true).await.unwrap();
        assert_eq!(record.job.spec.start_time_ms, 1_000);
        assert_eq!(record.job.spec.periodicity_ms, 2 * HOUR);
        let specs = record
            .history
            .unwrap()
            .fields
            .into_iter()
            .filter(|v| v.field == JobField::Spec)
            .count();
        assert_eq!(specs, 2);
    }

    #[tokio::test]
    async fn test_read_missing_job() {
        let h = make_harness();
        let err = h.manager.read_job("nope", false).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_read_jobs_bulk() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        h.manager.create_job(hourly("b")).await.unwrap();

        let all = h.manager.read_jobs(None, false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.history.is_none()));

        let some = h
            .manager
            .read_jobs(Some(&names(&["b", "missing"])), true)
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].job.id, "b");
        assert!(some[0].history.is_some());
    }

    #[tokio::test]
    async fn test_run_once_starts_then_waits_for_period() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();

        let report = h.manager.run_once(None, false).await.unwrap();
        assert_eq!(report.started, names(&["a"]));
        let handle = h.engine.started("a")[0].clone();
        let job = h.manager.read_job("a", false).await.unwrap().job;
        assert_eq!(job.state.current_run, Some(handle.clone()));

        // Finished, but the period has not elapsed.
        h.engine.complete(&handle, RunState::Succeeded).await.unwrap();
        let report = h.manager.run_once(None, false).await.unwrap();
        assert_eq!(report.evaluated, names(&["a"]));
        assert!(report.started.is_empty());
        let job = h.manager.read_job("a", false).await.unwrap().job;
        assert!(job.state.current_run.is_none());
        assert_eq!(job.state.last_status, Some(RunStatus::Ok));

        // The lease was released after each pass.
        assert!(
            h.store
                .acquire_lease("a", "other", MINUTE, now_ms())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_locked_job_is_skipped() {
        let h = make_harness();
        h.manager.create_job(hourly("A")).await.unwrap();
        h.manager.create_job(hourly("B")).await.unwrap();
        // Worker w1 holds A.
        h.store
            .acquire_lease("A", "w1", 10 * MINUTE, now_ms())
            .await
            .unwrap()
            .unwrap();

        let report = h
            .manager
            .run_once(Some(&names(&["A", "B"])), false)
            .await
            .unwrap();
        assert_eq!(report.skipped_locked, names(&["A"]));
        assert_eq!(report.started, names(&["B"]));
        assert!(h.engine.started("A").is_empty());
        let a = h.manager.read_job("A", false).await.unwrap().job;
        assert!(a.state.current_run.is_none());
    }

    #[tokio::test]
    async fn test_lifetime_exceeded_is_reaped() {
        let h = make_harness();
        let mut create = hourly("a");
        create.lifetime_ms = Some(10 * MINUTE);
        h.manager.create_job(create).await.unwrap();

        // A run started 15 minutes ago and is still going.
        let handle = h
            .engine
            .start("a", &CronPayload::new("cleanup"))
            .await
            .unwrap();
        let now = now_ms();
        let lease = h
            .store
            .acquire_lease("a", "w1", MINUTE, now)
            .await
            .unwrap()
            .unwrap();
        h.store
            .write_state(
                &lease,
                &JobStateUpdate {
                    current_run: Some(Some(handle.clone())),
                    last_run_at_ms: Some(now - 15 * MINUTE),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        h.store.release_lease(&lease).await.unwrap();

        let report = h.manager.run_once(None, false).await.unwrap();
        assert_eq!(report.evaluated, names(&["a"]));
        assert!(report.started.is_empty());
        assert_eq!(h.engine.terminated(), vec![handle]);
        let job = h.manager.read_job("a", false).await.unwrap().job;
        assert_eq!(job.state.last_status, Some(RunStatus::Timeout));
        assert!(job.state.current_run.is_none());
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        h.manager.disable_job("a").await.unwrap();

        let report = h.manager.run_once(None, true).await.unwrap();
        assert!(report.started.is_empty());
        assert!(h.manager.read_job("a", false).await.unwrap().job.state.disabled);

        h.manager.enable_job("a").await.unwrap();
        let report = h.manager.run_once(None, false).await.unwrap();
        assert_eq!(report.started, names(&["a"]));
    }

    #[tokio::test]
    async fn test_disable_contended() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        h.store
            .acquire_lease("a", "w1", 10 * MINUTE, now_ms())
            .await
            .unwrap()
            .unwrap();

        let err = h.manager.disable_job("a").await.unwrap_err();
        assert!(matches!(err, Error::LeaseContended { .. }));
        assert!(!h.manager.read_job("a", false).await.unwrap().job.state.disabled);
    }

    #[tokio::test]
    async fn test_disable_missing_job() {
        let h = make_harness();
        let err = h.manager.disable_job("nope").await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_revokes_holder() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        let now = now_ms();
        let lease = h
            .store
            .acquire_lease("a", "w1", 10 * MINUTE, now)
            .await
            .unwrap()
            .unwrap();

        h.manager.delete_job("a").await.unwrap();
        let err = h
            .store
            .write_state(
                &lease,
                &JobStateUpdate {
                    last_status: Some(RunStatus::Ok),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockNotHeld { .. }));
        assert!(h.manager.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_pass() {
        let h = make_harness();
        h.manager.create_job(hourly("b")).await.unwrap();

        let report = h
            .manager
            .run_once(Some(&names(&["missing", "b"])), false)
            .await
            .unwrap();
        assert_eq!(report.failed, names(&["missing"]));
        assert_eq!(report.started, names(&["b"]));
    }

    #[tokio::test]
    async fn test_start_failure_reported() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        h.engine.refuse_starts(true);

        let report = h.manager.run_once(None, false).await.unwrap();
        assert_eq!(report.failed, names(&["a"]));
        let job = h.manager.read_job("a", false).await.unwrap().job;
        assert!(job.state.current_run.is_none());
        assert!(job.state.last_run_at_ms.is_none());
    }

    #[tokio::test]
    async fn test_delete_old_runs_strictly_before_cutoff() {
        let h = make_harness();
        h.manager.create_job(hourly("a")).await.unwrap();
        for (handle, started) in [("r1", 1_000), ("r2", 2_000), ("r3", 3_000)] {
            h.store
                .insert_run(&CronRunRecord {
                    finished_at_ms: Some(started + 10),
                    state: RunState::Succeeded,
                    ..CronRunRecord::running("a", RunHandle(handle.into()), started)
                })
                .await
                .unwrap();
        }

        let removed = h.manager.delete_old_runs("a", 2_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(h.engine.discarded(), vec![RunHandle("r1".into())]);
        let left: Vec<_> = h
            .manager
            .read_job_runs("a", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.handle.0)
            .collect();
        assert_eq!(left, vec!["r2", "r3"]);
    }
}
