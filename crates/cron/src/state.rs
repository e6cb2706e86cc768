//! Checkpoint access for stateful jobs.

use crate::{Error, Result, manager::CronManager, schedule::now_ms, types::StateMap};

/// Reads and writes the opaque state map a stateful job carries between runs.
///
/// Errors surface as [`Error::StateRead`] / [`Error::StateWrite`] so the job's
/// own logic can tell checkpoint failures apart from its work failing.
#[derive(Clone)]
pub struct CronStateAccess {
    manager: CronManager,
}

impl CronStateAccess {
    pub fn new(manager: CronManager) -> Self {
        Self { manager }
    }

    /// Read without a lease. The value may be stale.
    pub async fn read_cron_state(&self, job_id: &str) -> Result<StateMap> {
        match self.manager.store().load_job(job_id).await {
            Ok(Some(job)) => Ok(job.state.state),
            Ok(None) => Err(Error::state_read(job_id, "job not found")),
            Err(e) => Err(Error::state_read(job_id, e)),
        }
    }

    /// Replace the job's state map under its lease. Empty maps are ignored.
    pub async fn write_cron_state(&self, job_id: &str, state: StateMap) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        let mut job = self
            .manager
            .lock_job_with_retry(job_id)
            .await
            .map_err(|e| Error::state_write(job_id, e))?;
        job.set_state(state);
        let result = job.flush(self.manager.store().as_ref(), now_ms()).await;
        self.manager.release(&job.into_lease()).await;
        result.map_err(|e| Error::state_write(job_id, e))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            engine_memory::InMemoryEngine,
            manager::CronManagerConfig,
            store::CronStore,
            store_memory::InMemoryStore,
            types::{CronJobCreate, CronPayload},
        },
        serde_json::json,
        std::{sync::Arc, time::Duration},
    };

    async fn make_access() -> (Arc<InMemoryStore>, CronStateAccess) {
        let store = Arc::new(InMemoryStore::new());
        let manager = CronManager::new(
            store.clone(),
            Arc::new(InMemoryEngine::new()),
            CronManagerConfig {
                management_lease_attempts: 1,
                management_lease_retry: Duration::from_millis(1),
                ..Default::default()
            },
        );
        manager
            .create_job(CronJobCreate {
                id: Some("sweep".into()),
                payload: CronPayload::new("sweep"),
                periodicity_ms: 60_000,
                lifetime_ms: None,
                allow_overruns: false,
                start_time_ms: None,
                description: String::new(),
                enabled: true,
            })
            .await
            .unwrap();
        (store, manager.state_access())
    }

    fn watermark(v: u64) -> StateMap {
        let mut map = StateMap::new();
        map.insert("watermark".into(), json!(v));
        map
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_store, access) = make_access().await;
        assert!(access.read_cron_state("sweep").await.unwrap().is_empty());

        access.write_cron_state("sweep", watermark(42)).await.unwrap();
        let state = access.read_cron_state("sweep").await.unwrap();
        assert_eq!(state["watermark"], 42);
    }

    #[tokio::test]
    async fn test_empty_write_is_noop() {
        let (_store, access) = make_access().await;
        access.write_cron_state("sweep", watermark(1)).await.unwrap();
        access
            .write_cron_state("sweep", StateMap::new())
            .await
            .unwrap();
        assert_eq!(access.read_cron_state("sweep").await.unwrap()["watermark"], 1);
        // Never touches the store, so even a missing job is fine.
        access
            .write_cron_state("missing", StateMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_job() {
        let (_store, access) = make_access().await;
        let err = access.read_cron_state("missing").await.unwrap_err();
        assert!(matches!(err, Error::StateRead { .. }));
    }

    #[tokio::test]
    async fn test_write_contended() {
        let (store, access) = make_access().await;
        store
            .acquire_lease("sweep", "other", 60_000, now_ms())
            .await
            .unwrap()
            .unwrap();
        let err = access
            .write_cron_state("sweep", watermark(7))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateWrite { .. }));
    }
}
