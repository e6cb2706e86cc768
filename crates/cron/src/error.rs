use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    ChronoParse(#[from] chrono::ParseError),

    #[error("lease not held for job: {job_id}")]
    LockNotHeld { job_id: String },

    #[error("lease for job {job_id} is held by another caller")]
    LeaseContended { job_id: String },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("unknown workflow: {workflow}")]
    UnknownWorkflow { workflow: String },

    #[error("cannot read state of job {job_id}: {reason}")]
    StateRead { job_id: String, reason: String },

    #[error("cannot write state of job {job_id}: {reason}")]
    StateWrite { job_id: String, reason: String },

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn lock_not_held(job_id: impl Into<String>) -> Self {
        Self::LockNotHeld {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn lease_contended(job_id: impl Into<String>) -> Self {
        Self::LeaseContended {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn unknown_workflow(workflow: impl Into<String>) -> Self {
        Self::UnknownWorkflow {
            workflow: workflow.into(),
        }
    }

    #[must_use]
    pub fn state_read(job_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StateRead {
            job_id: job_id.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn state_write(job_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StateWrite {
            job_id: job_id.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
