//! Metric name and label definitions.
//!
//! Every metric fleetcron emits is named here, so dashboards and alerts have
//! one place to look.

/// Scheduler metrics
pub mod cron {
    /// Per-job evaluation failures (an alert should fire on any increase)
    pub const INTERNAL_ERROR: &str = "cron_internal_error";
    /// Runs terminated for exceeding their lifetime
    pub const JOB_TIMEOUT: &str = "cron_job_timeout";
    /// Runs that finished in a failed state
    pub const JOB_FAILURE: &str = "cron_job_failure";
    /// Time from run start until it was reaped, in seconds
    pub const JOB_LATENCY_SECONDS: &str = "cron_job_latency";
    /// Runs started by the scheduler
    pub const JOBS_STARTED: &str = "cron_jobs_started";
    /// Lease acquisitions that found the lease held elsewhere
    pub const LEASE_CONTENDED: &str = "cron_lease_contended";
}

/// Common label keys used across metrics
pub mod labels {
    pub const JOB: &str = "job";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Job latency buckets (in seconds)
    /// Covers 1s to 2 days
    pub static JOB_LATENCY: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0, 43200.0, 86400.0,
            172800.0,
        ]
    });
}
