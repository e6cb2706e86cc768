//! Record store contract for cron jobs, leases and run history.

use async_trait::async_trait;

use crate::{
    Result,
    types::{CronJob, CronJobSpec, CronRunRecord, FieldVersion, JobStateUpdate, Lease, RunState},
};

/// Shared store holding one record per job.
///
/// Every worker process in the fleet talks to the same store. Writes to
/// lease-protected fields go through [`CronStore::write_state`], which must
/// reject a lease that is lapsed, released or superseded.
#[async_trait]
pub trait CronStore: Send + Sync {
    /// Ids of all jobs, sorted.
    async fn list_job_ids(&self) -> Result<Vec<String>>;

    async fn load_job(&self, id: &str) -> Result<Option<CronJob>>;

    /// Load several jobs at once. Missing ids are skipped.
    async fn load_jobs(&self, ids: &[String]) -> Result<Vec<CronJob>>;

    /// Create the record or replace its spec and `disabled` flag.
    ///
    /// Runtime state of an existing record is kept. A spec that differs from
    /// the stored one is appended to the field history.
    async fn put_job(
        &self,
        id: &str,
        spec: &CronJobSpec,
        disabled: bool,
        now_ms: u64,
    ) -> Result<()>;

    /// Remove the record, its lease, field history and run history.
    async fn delete_job(&self, id: &str) -> Result<()>;

    /// Try to take the job's lease without waiting.
    ///
    /// Returns `Ok(None)` when a live lease is held by someone else and
    /// [`crate::Error::JobNotFound`] when the record does not exist.
    async fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<Lease>>;

    /// Drop the lease. Releasing a lease that is no longer current is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Commit lease-protected fields. Fails with
    /// [`crate::Error::LockNotHeld`] unless `lease` is the job's live lease.
    async fn write_state(
        &self,
        lease: &Lease,
        update: &JobStateUpdate,
        now_ms: u64,
    ) -> Result<()>;

    /// Retained writes of versioned fields, oldest first.
    async fn field_history(&self, id: &str) -> Result<Vec<FieldVersion>>;

    async fn insert_run(&self, run: &CronRunRecord) -> Result<()>;

    /// Move a run to a new state. Unknown handles are ignored.
    async fn finish_run(
        &self,
        handle: &str,
        state: RunState,
        finished_at_ms: u64,
        error: Option<&str>,
    ) -> Result<()>;

    /// Record that the owner of a running run is still alive. Finished and
    /// unknown runs are left untouched.
    async fn touch_run(&self, handle: &str, now_ms: u64) -> Result<()>;

    async fn get_run(&self, handle: &str) -> Result<Option<CronRunRecord>>;

    /// Most recent `limit` runs of a job, oldest first.
    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>>;

    /// Delete runs that started strictly before `cutoff_ms` and return them.
    async fn delete_runs_before(&self, job_id: &str, cutoff_ms: u64)
    -> Result<Vec<CronRunRecord>>;
}
