//! Built-in recurring jobs registered by every worker at startup.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    Error, Result,
    manager::CronManager,
    types::{CronJobCreate, CronPayload},
};

/// Key added to a stateful job's payload args so its workflow can find its
/// own checkpoint.
pub const CRON_JOB_ID_ARG: &str = "cronJobId";

/// A job the process always wants scheduled, keyed by its name.
pub trait SystemCronJob: Send + Sync {
    fn name(&self) -> &str;

    fn frequency(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    fn lifetime(&self) -> Option<Duration> {
        Some(Duration::from_secs(20 * 60 * 60))
    }

    fn allow_overruns(&self) -> bool {
        false
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Stateful jobs get their job id in the payload args.
    fn stateful(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        String::new()
    }

    fn payload(&self) -> CronPayload {
        CronPayload::new(self.name())
    }
}

#[derive(Default, Clone)]
pub struct SystemJobRegistry {
    jobs: Vec<Arc<dyn SystemCronJob>>,
}

impl SystemJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn SystemCronJob>) -> Result<()> {
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(Error::message(format!(
                "system cron job registered twice: {}",
                job.name()
            )));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SystemCronJob>> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn create_request(job: &dyn SystemCronJob, enabled: bool) -> CronJobCreate {
    let mut payload = job.payload();
    if job.stateful() {
        if payload.args.is_null() {
            payload.args = serde_json::Value::Object(serde_json::Map::new());
        }
        match payload.args {
            serde_json::Value::Object(ref mut map) => {
                map.insert(CRON_JOB_ID_ARG.into(), job.name().into());
            },
            _ => {
                warn!(job = job.name(), "cron: stateful job args are not an object, job id not added");
            },
        }
    }
    CronJobCreate {
        id: Some(job.name().to_string()),
        payload,
        periodicity_ms: job.frequency().as_millis() as u64,
        lifetime_ms: job.lifetime().map(|d| d.as_millis() as u64),
        allow_overruns: job.allow_overruns(),
        start_time_ms: None,
        description: job.description(),
        enabled,
    }
}

/// Create or redefine every registered job, keyed by its name.
///
/// Names in `disabled` are registered disabled. Unknown names there are an
/// error, reported only after all jobs have been registered.
pub async fn schedule_system_jobs(
    manager: &CronManager,
    registry: &SystemJobRegistry,
    disabled: &[String],
) -> Result<()> {
    let known: HashSet<&str> = registry.iter().map(|j| j.name()).collect();
    let unknown: Vec<&str> = disabled
        .iter()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();

    for job in registry.iter() {
        let enabled = job.enabled() && !disabled.iter().any(|d| d == job.name());
        manager
            .create_job(create_request(job.as_ref(), enabled))
            .await?;
    }
    info!(count = registry.len(), "cron: system jobs scheduled");

    if !unknown.is_empty() {
        return Err(Error::message(format!(
            "unknown system cron jobs cannot be disabled: {}",
            unknown.join(", ")
        )));
    }
    Ok(())
}
