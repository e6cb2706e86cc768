//! Due-time computation for periodic jobs.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::CronJob;

/// Current wall-clock time in epoch millis.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Instant at which a run started at `last_run_at_ms` stops blocking the next one.
pub fn expiry(last_run_at_ms: u64, periodicity_ms: u64) -> u64 {
    last_run_at_ms.saturating_add(periodicity_ms)
}

/// Whether `job` should start a new run at `now_ms`.
///
/// Never true for a disabled job or before `start_time_ms`. A job that has
/// never run is due as soon as its start time has passed. Otherwise the
/// period must have elapsed and, unless overruns are allowed, no run may be
/// tracked.
pub fn due_to_run(job: &CronJob, now_ms: u64) -> bool {
    if job.state.disabled {
        return false;
    }
    if now_ms < job.spec.start_time_ms {
        return false;
    }
    let Some(last_run_at) = job.state.last_run_at_ms else {
        return true;
    };
    if now_ms <= expiry(last_run_at, job.spec.periodicity_ms) {
        return false;
    }
    job.spec.allow_overruns || job.state.current_run.is_none()
}
