use std::time::Duration;

use {
    anyhow::{Context, Result},
    clap::{Args, Subcommand},
    tracing::info,
};

use {
    fleetcron_config::FleetcronConfig,
    fleetcron_cron::{
        CronManager, CronWorker, CronWorkerConfig,
        engine_local::LocalEngine,
        parse::{format_time_ms, parse_absolute_time_ms, parse_duration_ms, parse_time_or_ago_ms},
        schedule::now_ms,
        types::{CronJob, CronJobCreate, CronPayload, CronRunRecord, RunStatus, StateMap},
    },
};

use crate::system_jobs::build_registry;

#[derive(Args)]
pub struct CreateArgs {
    /// Job id. Generated from the workflow name when omitted.
    #[arg(long)]
    id: Option<String>,
    /// Workflow to run (a key of `[workflows]`).
    #[arg(long)]
    workflow: String,
    /// Workflow arguments as JSON.
    #[arg(long)]
    args: Option<String>,
    /// How often to run, e.g. `30m`, `6h`, `1d`.
    #[arg(long)]
    every: String,
    /// Terminate runs that take longer than this.
    #[arg(long)]
    lifetime: Option<String>,
    /// Start new runs even while one is still going.
    #[arg(long)]
    allow_overruns: bool,
    /// ISO 8601 time before which the job never runs. Defaults to now.
    #[arg(long)]
    start_time: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    /// Create the job disabled.
    #[arg(long)]
    disabled: bool,
}

#[derive(Subcommand)]
pub enum StateAction {
    /// Print the job's checkpoint as JSON.
    Get { id: String },
    /// Replace the job's checkpoint with a JSON object.
    Set { id: String, json: String },
}

pub async fn create(manager: &CronManager, args: CreateArgs) -> Result<()> {
    let payload_args = match args.args {
        Some(ref raw) => serde_json::from_str(raw).context("--args must be valid JSON")?,
        None => serde_json::Value::Null,
    };
    let create = CronJobCreate {
        id: args.id,
        payload: CronPayload::new(args.workflow).with_args(payload_args),
        periodicity_ms: parse_duration_ms(&args.every)?,
        lifetime_ms: args.lifetime.as_deref().map(parse_duration_ms).transpose()?,
        allow_overruns: args.allow_overruns,
        start_time_ms: args
            .start_time
            .as_deref()
            .map(parse_absolute_time_ms)
            .transpose()?,
        description: args.description,
        enabled: !args.disabled,
    };
    let id = manager.create_job(create).await?;
    println!("{id}");
    Ok(())
}

pub async fn list(manager: &CronManager, json: bool) -> Result<()> {
    let records = manager.read_jobs(None, false).await?;
    if json {
        let jobs: Vec<&CronJob> = records.iter().map(|r| &r.job).collect();
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<32} {:<20} {:>8} {:<9} {:<8} LAST RUN",
        "ID", "WORKFLOW", "EVERY", "STATE", "STATUS"
    );
    for record in &records {
        let job = &record.job;
        println!(
            "{:<32} {:<20} {:>8} {:<9} {:<8} {}",
            job.id,
            job.spec.payload.workflow,
            format_duration_ms(job.spec.periodicity_ms),
            job_state_label(job),
            job.state.last_status.map(status_label).unwrap_or("-"),
            job.state
                .last_run_at_ms
                .map(format_time_ms)
                .unwrap_or_else(|| "never".into()),
        );
    }
    Ok(())
}

pub async fn show(manager: &CronManager, id: &str, history: bool) -> Result<()> {
    let record = manager.read_job(id, history).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// The `limit` most recent runs of a job, newest first.
async fn recent_runs(manager: &CronManager, id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
    let mut runs = manager.read_job_runs(id, limit).await?;
    runs.reverse();
    Ok(runs)
}

pub async fn runs(manager: &CronManager, id: &str, limit: usize) -> Result<()> {
    let runs = recent_runs(manager, id, limit).await?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for run in &runs {
        let finished = run
            .finished_at_ms
            .map(format_time_ms)
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:?}  started {}  finished {}{}",
            run.handle,
            run.state,
            format_time_ms(run.started_at_ms),
            finished,
            run.error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// One scheduling pass. Workflows it starts are children of this process, so
/// it waits for them before returning.
pub async fn run(
    manager: &CronManager,
    engine: &LocalEngine,
    names: Vec<String>,
    force: bool,
) -> Result<()> {
    let names = (!names.is_empty()).then_some(names);
    let report = manager.run_once(names.as_deref(), force).await?;
    if !report.started.is_empty() {
        info!(started = report.started.len(), "waiting for started workflows to exit");
        engine.wait_idle().await;
    }
    println!("evaluated: {}", report.evaluated.join(", "));
    println!("started:   {}", report.started.join(", "));
    if !report.skipped_locked.is_empty() {
        println!("locked:    {}", report.skipped_locked.join(", "));
    }
    if !report.failed.is_empty() {
        anyhow::bail!("evaluation failed for: {}", report.failed.join(", "));
    }
    Ok(())
}

pub async fn prune(manager: &CronManager, id: &str, before: &str) -> Result<()> {
    let cutoff = parse_time_or_ago_ms(before, now_ms())?;
    let removed = manager.delete_old_runs(id, cutoff).await?;
    println!(
        "Removed {removed} run(s) started before {}.",
        format_time_ms(cutoff)
    );
    Ok(())
}

pub async fn state(manager: &CronManager, action: StateAction) -> Result<()> {
    let access = manager.state_access();
    match action {
        StateAction::Get { id } => {
            let state = access.read_cron_state(&id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        },
        StateAction::Set { id, json } => {
            let state: StateMap =
                serde_json::from_str(&json).context("state must be a JSON object")?;
            access.write_cron_state(&id, state).await?;
        },
    }
    Ok(())
}

/// Run a worker until Ctrl-C. Workflows still running at that point are
/// killed and recorded as failed.
pub async fn worker(
    manager: CronManager,
    engine: &LocalEngine,
    config: &FleetcronConfig,
) -> Result<()> {
    if !config.cron.active {
        info!("cron is not active, worker not started");
        return Ok(());
    }

    let registry = build_registry(&config.system_jobs)?;
    let worker = CronWorker::new(manager, registry, CronWorkerConfig {
        interval: Duration::from_secs(config.cron.worker_interval_secs),
        disabled_system_jobs: config.cron.disabled_system_jobs.clone(),
    });
    let handle = worker.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping worker");
    worker.stop();
    handle.await?;
    engine.shutdown("worker stopped").await;
    Ok(())
}

fn job_state_label(job: &CronJob) -> &'static str {
    if job.state.disabled {
        "disabled"
    } else if job.state.current_run.is_some() {
        "running"
    } else {
        "idle"
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Ok => "ok",
        RunStatus::Error => "error",
        RunStatus::Timeout => "timeout",
    }
}

/// Render millis with the largest units that divide them, e.g. `1h30m`.
fn format_duration_ms(ms: u64) -> String {
    const UNITS: &[(u64, &str)] = &[
        (604_800_000, "w"),
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let mut rest = ms;
    let mut out = String::new();
    for &(unit, suffix) in UNITS {
        if rest >= unit {
            out.push_str(&format!("{}{suffix}", rest / unit));
            rest %= unit;
        }
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_ms(500), "500ms");
        assert_eq!(format_duration_ms(30_000), "30s");
        assert_eq!(format_duration_ms(5_400_000), "1h30m");
        assert_eq!(format_duration_ms(86_400_000), "1d");
        assert_eq!(format_duration_ms(691_200_000), "1w1d");
    }

    #[test]
    fn duration_format_parses_back() {
        for ms in [60_000, 5_400_000, 90_000_000] {
            assert_eq!(parse_duration_ms(&format_duration_ms(ms)).unwrap(), ms);
        }
    }

    async fn memory_manager(workflows: &[(&str, &str)]) -> (CronManager, std::sync::Arc<LocalEngine>) {
        let mut config = FleetcronConfig::default();
        config.store.backend = fleetcron_config::StoreBackend::Memory;
        config.workflows = workflows
            .iter()
            .map(|(name, cmd)| (name.to_string(), cmd.to_string()))
            .collect();
        crate::build_manager(&config).await.unwrap()
    }

    fn hourly(id: &str, workflow: &str) -> CronJobCreate {
        CronJobCreate {
            id: Some(id.into()),
            payload: CronPayload::new(workflow),
            periodicity_ms: 3_600_000,
            lifetime_ms: None,
            allow_overruns: false,
            start_time_ms: None,
            description: String::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn run_waits_for_started_workflows() {
        let (manager, engine) = memory_manager(&[("nap", "sleep 0.2")]).await;
        manager.create_job(hourly("nap", "nap")).await.unwrap();

        run(&manager, &engine, vec![], false).await.unwrap();
        assert_eq!(engine.running(), 0);
        let runs = manager.read_job_runs("nap", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, fleetcron_cron::types::RunState::Succeeded);
    }

    #[tokio::test]
    async fn recent_runs_are_newest_first() {
        let (manager, engine) = memory_manager(&[("ok", "exit 0")]).await;
        manager.create_job(hourly("ok", "ok")).await.unwrap();
        for _ in 0..3 {
            run(&manager, &engine, vec!["ok".into()], true).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let runs = recent_runs(&manager, "ok", 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].started_at_ms >= runs[1].started_at_ms);
        assert!(runs[1].started_at_ms >= runs[2].started_at_ms);
        assert!(runs[0].started_at_ms > runs[2].started_at_ms);
    }
}
