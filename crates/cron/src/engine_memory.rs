//! In-process engine whose runs only finish when told to. For tests and
//! embedding, where the caller drives run completion itself.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    Error, Result,
    engine::ExecutionEngine,
    schedule::now_ms,
    store::CronStore,
    types::{CronPayload, CronRunRecord, RunHandle, RunState},
};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunHandle, RunState>,
    started: Vec<(String, RunHandle)>,
    terminated: Vec<RunHandle>,
    discarded: Vec<RunHandle>,
    refuse_starts: bool,
}

/// Engine keeping run states in memory. When given a store, it also writes
/// run history there like a real engine would.
#[derive(Default)]
pub struct InMemoryEngine {
    store: Option<Arc<dyn CronStore>>,
    inner: Mutex<Inner>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn CronStore>) -> Self {
        Self {
            store: Some(store),
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move a run to `state`, as if its workflow had progressed.
    pub async fn complete(&self, handle: &RunHandle, state: RunState) -> Result<()> {
        self.lock().runs.insert(handle.clone(), state);
        if let Some(ref store) = self.store
            && state.is_terminal()
        {
            store
                .finish_run(handle.as_str(), state, now_ms(), None)
                .await?;
        }
        Ok(())
    }

    /// Drop a handle so `status` no longer recognises it.
    pub fn forget(&self, handle: &RunHandle) {
        self.lock().runs.remove(handle);
    }

    /// Make subsequent `start` calls fail.
    pub fn refuse_starts(&self, refuse: bool) {
        self.lock().refuse_starts = refuse;
    }

    /// Handles started for `job_id`, oldest first.
    pub fn started(&self, job_id: &str) -> Vec<RunHandle> {
        self.lock()
            .started
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub fn terminated(&self) -> Vec<RunHandle> {
        self.lock().terminated.clone()
    }

    pub fn discarded(&self) -> Vec<RunHandle> {
        self.lock().discarded.clone()
    }
}

#[async_trait]
impl ExecutionEngine for InMemoryEngine {
    async fn start(&self, job_id: &str, payload: &CronPayload) -> Result<RunHandle> {
        let handle = RunHandle(uuid::Uuid::new_v4().to_string());
        {
            let mut inner = self.lock();
            if inner.refuse_starts {
                return Err(Error::message(format!(
                    "engine refused to start workflow {}",
                    payload.workflow
                )));
            }
            inner.runs.insert(handle.clone(), RunState::Running);
            inner.started.push((job_id.to_string(), handle.clone()));
        }
        if let Some(ref store) = self.store {
            store
                .insert_run(&CronRunRecord::running(job_id, handle.clone(), now_ms()))
                .await?;
        }
        Ok(handle)
    }

    async fn status(&self, handle: &RunHandle) -> Result<Option<RunState>> {
        Ok(self.lock().runs.get(handle).copied())
    }

    async fn terminate(&self, handle: &RunHandle, reason: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.runs.insert(handle.clone(), RunState::Failed);
            inner.terminated.push(handle.clone());
        }
        if let Some(ref store) = self.store {
            store
                .finish_run(handle.as_str(), RunState::Failed, now_ms(), Some(reason))
                .await?;
        }
        Ok(())
    }

    async fn discard(&self, handles: &[RunHandle]) -> Result<()> {
        let mut inner = self.lock();
        for handle in handles {
            inner.runs.remove(handle);
            inner.discarded.push(handle.clone());
        }
        Ok(())
    }
}
