//! In-memory store for tests and single-process deployments.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::CronStore,
    types::{
        CronJob, CronJobSpec, CronJobState, CronRunRecord, FieldVersion, JobField, JobStateUpdate,
        Lease, RunState,
    },
};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, CronJob>,
    leases: HashMap<String, Lease>,
    versions: HashMap<String, Vec<FieldVersion>>,
    runs: Vec<CronRunRecord>,
}

/// In-memory store backed by maps behind one mutex. No persistence, and
/// leases only exclude callers sharing this instance.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_version(
    versions: &mut HashMap<String, Vec<FieldVersion>>,
    job_id: &str,
    field: JobField,
    recorded_at_ms: u64,
    value: serde_json::Value,
) {
    versions
        .entry(job_id.to_string())
        .or_default()
        .push(FieldVersion {
            field,
            recorded_at_ms,
            value,
        });
}

#[async_trait]
impl CronStore for InMemoryStore {
    async fn list_job_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock().jobs.keys().cloned().collect())
    }

    async fn load_job(&self, id: &str) -> Result<Option<CronJob>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn load_jobs(&self, ids: &[String]) -> Result<Vec<CronJob>> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect())
    }

    async fn put_job(
        &self,
        id: &str,
        spec: &CronJobSpec,
        disabled: bool,
        now_ms: u64,
    ) -> Result<()> {
        let spec_value = serde_json::to_value(spec)?;
        let mut inner = self.lock();
        let Inner { jobs, versions, .. } = &mut *inner;

        match jobs.get_mut(id) {
            Some(job) => {
                if job.spec != *spec {
                    job.spec = spec.clone();
                    if JobField::Spec.is_versioned() {
                        push_version(versions, id, JobField::Spec, now_ms, spec_value);
                    }
                }
                job.state.disabled = disabled;
                job.updated_at_ms = now_ms;
            },
            None => {
                jobs.insert(id.to_string(), CronJob {
                    id: id.to_string(),
                    spec: spec.clone(),
                    state: CronJobState {
                        disabled,
                        ..Default::default()
                    },
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                });
                if JobField::Spec.is_versioned() {
                    push_version(versions, id, JobField::Spec, now_ms, spec_value);
                }
            },
        }
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.jobs.remove(id).is_none() {
            return Err(Error::job_not_found(id));
        }
        inner.leases.remove(id);
        inner.versions.remove(id);
        inner.runs.retain(|r| r.job_id != id);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<Lease>> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(id) {
            return Err(Error::job_not_found(id));
        }
        if inner.leases.get(id).is_some_and(|l| l.is_live(now_ms)) {
            return Ok(None);
        }
        let lease = Lease {
            job_id: id.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        inner.leases.insert(id.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .leases
            .get(&lease.job_id)
            .is_some_and(|l| l.token == lease.token)
        {
            inner.leases.remove(&lease.job_id);
        }
        Ok(())
    }

    async fn write_state(
        &self,
        lease: &Lease,
        update: &JobStateUpdate,
        now_ms: u64,
    ) -> Result<()> {
        let versioned = update.versioned_values()?;
        let mut inner = self.lock();
        let Inner {
            jobs,
            leases,
            versions,
            ..
        } = &mut *inner;

        let held = leases
            .get(&lease.job_id)
            .is_some_and(|l| l.token == lease.token && l.is_live(now_ms));
        if !held {
            return Err(Error::lock_not_held(&lease.job_id));
        }
        let job = jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| Error::job_not_found(&lease.job_id))?;

        update.apply_to(&mut job.state);
        job.updated_at_ms = now_ms;
        for (field, value) in versioned {
            push_version(versions, &lease.job_id, field, now_ms, value);
        }
        Ok(())
    }

    async fn field_history(&self, id: &str) -> Result<Vec<FieldVersion>> {
        Ok(self.lock().versions.get(id).cloned().unwrap_or_default())
    }

    async fn insert_run(&self, run: &CronRunRecord) -> Result<()> {
        self.lock().runs.push(run.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        handle: &str,
        state: RunState,
        finished_at_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(run) = inner.runs.iter_mut().find(|r| r.handle.as_str() == handle) {
            run.state = state;
            run.finished_at_ms = Some(finished_at_ms);
            run.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn touch_run(&self, handle: &str, now_ms: u64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(run) = inner
            .runs
            .iter_mut()
            .find(|r| r.handle.as_str() == handle && r.state == RunState::Running)
        {
            run.heartbeat_at_ms = Some(now_ms);
        }
        Ok(())
    }

    async fn get_run(&self, handle: &str) -> Result<Option<CronRunRecord>> {
        Ok(self
            .lock()
            .runs
            .iter()
            .find(|r| r.handle.as_str() == handle)
            .cloned())
    }

    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        let inner = self.lock();
        let mut records: Vec<CronRunRecord> = inner
            .runs
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at_ms);
        // Return the most recent `limit` entries.
        let start = records.len().saturating_sub(limit);
        Ok(records.split_off(start))
    }

    async fn delete_runs_before(
        &self,
        job_id: &str,
        cutoff_ms: u64,
    ) -> Result<Vec<CronRunRecord>> {
        let mut inner = self.lock();
        let (purged, kept): (Vec<_>, Vec<_>) = inner
            .runs
            .drain(..)
            .partition(|r| r.job_id == job_id && r.started_at_ms < cutoff_ms);
        inner.runs = kept;
        Ok(purged)
    }
}
