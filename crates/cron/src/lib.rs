//! Distributed periodic job scheduler.
//!
//! Jobs live in a shared store. Any number of worker processes poll it, and a
//! per-job lease guarantees only one of them advances a given job at a time.
//! Runs execute in a separate engine; the scheduler only starts, polls and
//! terminates them.

pub mod engine;
pub mod engine_local;
pub mod engine_memory;
pub mod error;
pub mod job;
pub mod manager;
pub mod parse;
pub mod schedule;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod system;
pub mod types;
pub mod worker;

pub use {
    engine::ExecutionEngine,
    error::{Error, Result},
    manager::{CronManager, CronManagerConfig},
    state::CronStateAccess,
    store::CronStore,
    system::{SystemCronJob, SystemJobRegistry},
    worker::{CronWorker, CronWorkerConfig},
};

/// Run database migrations for the cron crate.
///
/// Creates the job, lease, field-history and run tables. Called by
/// [`store_sqlite::SqliteStore::new`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
