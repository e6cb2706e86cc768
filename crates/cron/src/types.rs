//! Core data types for the distributed cron scheduler.

use serde::{Deserialize, Serialize};

/// Opaque key/value map a job may carry between iterations (e.g. a watermark).
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// What the execution engine is asked to run when a job fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronPayload {
    /// Workflow name understood by the execution engine.
    pub workflow: String,
    /// Workflow arguments, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

impl CronPayload {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            args: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// Immutable definition of a job. Redefinition replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    pub periodicity_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime_ms: Option<u64>,
    #[serde(default)]
    pub allow_overruns: bool,
    /// The job is never due before this instant.
    pub start_time_ms: u64,
    pub payload: CronPayload,
    #[serde(default)]
    pub description: String,
}

/// Opaque reference to a run owned by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RunHandle(pub String);

impl RunHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of the most recently completed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
}

/// State of a run as reported by the execution engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Mutable runtime state of a job. Only the lease holder writes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(default)]
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_run: Option<RunHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state: StateMap,
}

/// A scheduled job: its spec plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub spec: CronJobSpec,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Run-history entry written by the execution engine for each run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub job_id: String,
    pub handle: RunHandle,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Process that owns the run, if the engine tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Last time the owner reported the run alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at_ms: Option<u64>,
}

impl CronRunRecord {
    /// A freshly started run.
    pub fn running(job_id: impl Into<String>, handle: RunHandle, started_at_ms: u64) -> Self {
        Self {
            job_id: job_id.into(),
            handle,
            started_at_ms,
            finished_at_ms: None,
            state: RunState::Running,
            error: None,
            owner: None,
            heartbeat_at_ms: None,
        }
    }
}

/// Fields of a persisted job record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum JobField {
    Spec,
    Disabled,
    CurrentRun,
    LastRunAt,
    LastStatus,
    State,
}

/// How a store retains successive writes of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Every write is kept and can be queried by time.
    Versioned,
    /// Only the latest value is kept.
    Overwrite,
}

impl JobField {
    #[must_use]
    pub fn retention(self) -> Retention {
        match self {
            Self::Spec | Self::LastStatus => Retention::Versioned,
            Self::Disabled | Self::CurrentRun | Self::LastRunAt | Self::State => {
                Retention::Overwrite
            },
        }
    }

    #[must_use]
    pub fn is_versioned(self) -> bool {
        self.retention() == Retention::Versioned
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Disabled => "disabled",
            Self::CurrentRun => "currentRun",
            Self::LastRunAt => "lastRunAt",
            Self::LastStatus => "lastStatus",
            Self::State => "state",
        }
    }
}

impl std::str::FromStr for JobField {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "spec" => Ok(Self::Spec),
            "disabled" => Ok(Self::Disabled),
            "currentRun" => Ok(Self::CurrentRun),
            "lastRunAt" => Ok(Self::LastRunAt),
            "lastStatus" => Ok(Self::LastStatus),
            "state" => Ok(Self::State),
            other => Err(crate::Error::message(format!("unknown job field: {other}"))),
        }
    }
}

/// One retained write of a versioned field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldVersion {
    pub field: JobField,
    pub recorded_at_ms: u64,
    pub value: serde_json::Value,
}

/// Lease-protected fields explicitly set by a lease holder, committed together.
///
/// `None` leaves a field untouched; `current_run: Some(None)` clears the handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStateUpdate {
    pub disabled: Option<bool>,
    pub current_run: Option<Option<RunHandle>>,
    pub last_run_at_ms: Option<u64>,
    pub last_status: Option<RunStatus>,
    pub state: Option<StateMap>,
}

impl JobStateUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disabled.is_none()
            && self.current_run.is_none()
            && self.last_run_at_ms.is_none()
            && self.last_status.is_none()
            && self.state.is_none()
    }

    /// Fields this update touches, in commit order.
    #[must_use]
    pub fn fields(&self) -> Vec<JobField> {
        let mut fields = Vec::new();
        if self.disabled.is_some() {
            fields.push(JobField::Disabled);
        }
        if self.current_run.is_some() {
            fields.push(JobField::CurrentRun);
        }
        if self.last_run_at_ms.is_some() {
            fields.push(JobField::LastRunAt);
        }
        if self.last_status.is_some() {
            fields.push(JobField::LastStatus);
        }
        if self.state.is_some() {
            fields.push(JobField::State);
        }
        fields
    }

    /// Values to append to the field history for this update: one per
    /// touched field whose retention is [`Retention::Versioned`].
    pub fn versioned_values(&self) -> crate::Result<Vec<(JobField, serde_json::Value)>> {
        self.fields()
            .into_iter()
            .filter(|field| field.is_versioned())
            .map(|field| Ok((field, self.value_of(field)?)))
            .collect()
    }

    fn value_of(&self, field: JobField) -> crate::Result<serde_json::Value> {
        let value = match field {
            JobField::Spec => serde_json::Value::Null,
            JobField::Disabled => serde_json::to_value(self.disabled)?,
            JobField::CurrentRun => serde_json::to_value(self.current_run.clone().flatten())?,
            JobField::LastRunAt => serde_json::to_value(self.last_run_at_ms)?,
            JobField::LastStatus => serde_json::to_value(self.last_status)?,
            JobField::State => serde_json::to_value(&self.state)?,
        };
        Ok(value)
    }

    /// Apply the update to an in-memory state snapshot.
    pub fn apply_to(&self, state: &mut CronJobState) {
        if let Some(disabled) = self.disabled {
            state.disabled = disabled;
        }
        if let Some(ref current_run) = self.current_run {
            state.current_run = current_run.clone();
        }
        if let Some(at) = self.last_run_at_ms {
            state.last_run_at_ms = Some(at);
        }
        if let Some(status) = self.last_status {
            state.last_status = Some(status);
        }
        if let Some(ref map) = self.state {
            state.state = map.clone();
        }
    }
}

/// Exclusive, time-bounded claim on one job's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub token: String,
    pub holder: String,
    pub expires_at_ms: u64,
}

impl Lease {
    #[must_use]
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Input for creating (or redefining) a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobCreate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: CronPayload,
    pub periodicity_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_ms: Option<u64>,
    #[serde(default)]
    pub allow_overruns: bool,
    /// Defaults to the creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Past activity of a job, returned when history is requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobHistory {
    pub fields: Vec<FieldVersion>,
    pub runs: Vec<CronRunRecord>,
}

/// A job as returned by read operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJobRecord {
    pub job: CronJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<JobHistory>,
}

/// Outcome of one `run_once` pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOnceReport {
    /// Jobs whose lease was acquired and state machine evaluated.
    pub evaluated: Vec<String>,
    /// Jobs for which a new run was started in this pass.
    pub started: Vec<String>,
    /// Jobs skipped because another caller held the lease.
    pub skipped_locked: Vec<String>,
    /// Jobs whose evaluation raised an error.
    pub failed: Vec<String>,
}
