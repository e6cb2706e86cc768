//! Config schema types (scheduler, store, metrics, workflows, system jobs).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetcronConfig {
    pub cron: CronConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    /// Workflow name -> shell command run by the local engine.
    pub workflows: HashMap<String, String>,
    /// Recurring jobs every worker registers at startup.
    pub system_jobs: Vec<SystemJobEntry>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Whether `fleetcron worker` schedules anything at all.
    pub active: bool,
    /// Seconds between scheduling passes.
    pub worker_interval_secs: u64,
    /// TTL of the per-job lease.
    pub lease_duration_secs: u64,
    /// Attempts for management operations that need a contended lease.
    pub management_lease_attempts: u32,
    /// Pause between those attempts.
    pub management_lease_retry_ms: u64,
    /// How often a process refreshes the heartbeat of workflows it runs.
    pub run_heartbeat_secs: u64,
    /// A running workflow whose heartbeat is older than this is marked failed.
    pub run_stale_after_secs: u64,
    /// System jobs to register disabled.
    pub disabled_system_jobs: Vec<String>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            active: true,
            worker_interval_secs: 300,
            lease_duration_secs: 600,
            management_lease_attempts: 10,
            management_lease_retry_ms: 200,
            run_heartbeat_secs: 15,
            run_stale_after_secs: 60,
            disabled_system_jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on exit. Only useful for a single process.
    Memory,
    #[default]
    Sqlite,
}

/// Where jobs, leases and run history live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite URL. Defaults to `fleetcron.db` in the data directory.
    pub database_url: Option<String>,
}

/// Metrics and observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
    /// Address of the Prometheus scrape endpoint, e.g. `127.0.0.1:9464`.
    pub listen: Option<String>,
    /// Additional labels to add to all metrics.
    pub labels: HashMap<String, String>,
}

/// A system job declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemJobEntry {
    /// Job id, and workflow name unless `workflow` is set.
    pub name: String,
    #[serde(default)]
    pub workflow: Option<String>,
    /// Defaults to one day.
    #[serde(default)]
    pub frequency_secs: Option<u64>,
    /// Defaults to 20 hours. `0` means no lifetime limit.
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    #[serde(default)]
    pub allow_overruns: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub description: String,
    /// Passed to the workflow as JSON.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

fn default_true() -> bool {
    true
}
