//! Execution engine contract: starts payloads and reports their outcome.

use async_trait::async_trait;

use crate::{
    Result,
    types::{CronPayload, RunHandle, RunState},
};

/// Runs job payloads asynchronously, independently of the scheduler.
///
/// The scheduler only starts runs, polls them, and asks for termination. It
/// never waits for a run to finish.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Start `payload` for `job_id` and return a handle to the new run.
    async fn start(&self, job_id: &str, payload: &CronPayload) -> Result<RunHandle>;

    /// Current state of a run, or `None` if the engine does not know the handle.
    async fn status(&self, handle: &RunHandle) -> Result<Option<RunState>>;

    /// Request termination. Returns without waiting for the run to stop.
    async fn terminate(&self, handle: &RunHandle, reason: &str) -> Result<()>;

    /// Forget any bookkeeping tied to runs whose history was purged.
    async fn discard(&self, handles: &[RunHandle]) -> Result<()>;
}
