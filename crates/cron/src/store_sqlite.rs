//! SQLite-backed cron store using sqlx.
//!
//! Several worker processes may open the same database file; leases are
//! rows in `cron_leases` claimed with a conditional upsert.

use {
    async_trait::async_trait,
    sqlx::{
        QueryBuilder, Row, Sqlite, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    Error, Result,
    store::CronStore,
    types::{
        CronJob, CronJobSpec, CronJobState, CronRunRecord, FieldVersion, JobField, JobStateUpdate,
        Lease, RunHandle, RunState,
    },
};

const JOB_COLUMNS: &str = "id, spec, disabled, current_run, last_run_at_ms, last_status, state, \
                           created_at_ms, updated_at_ms";

const RUN_COLUMNS: &str =
    "handle, job_id, started_at_ms, finished_at_ms, state, error, owner, heartbeat_at_ms";

/// SQLite-backed persistence for cron jobs, leases and run history.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with its own connection pool and run migrations.
    ///
    /// Use this for standalone cron databases. For shared pools, use
    /// [`SqliteStore::with_pool`] after calling [`crate::run_migrations`].
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| Error::external("failed to connect to SQLite", e))?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<CronJob> {
    let spec: String = row.get("spec");
    let last_status: Option<String> = row.get("last_status");
    let state: Option<String> = row.get("state");
    Ok(CronJob {
        id: row.get("id"),
        spec: serde_json::from_str(&spec)?,
        state: CronJobState {
            disabled: row.get("disabled"),
            current_run: row.get::<Option<String>, _>("current_run").map(RunHandle),
            last_run_at_ms: row.get::<Option<i64>, _>("last_run_at_ms").map(|v| v as u64),
            last_status: last_status.as_deref().map(serde_json::from_str).transpose()?,
            state: state
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
        },
        created_at_ms: row.get::<i64, _>("created_at_ms") as u64,
        updated_at_ms: row.get::<i64, _>("updated_at_ms") as u64,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<CronRunRecord> {
    let state: String = row.get("state");
    Ok(CronRunRecord {
        job_id: row.get("job_id"),
        handle: RunHandle(row.get("handle")),
        started_at_ms: row.get::<i64, _>("started_at_ms") as u64,
        finished_at_ms: row
            .get::<Option<i64>, _>("finished_at_ms")
            .map(|v| v as u64),
        state: serde_json::from_str(&state)?,
        error: row.get("error"),
        owner: row.get("owner"),
        heartbeat_at_ms: row
            .get::<Option<i64>, _>("heartbeat_at_ms")
            .map(|v| v as u64),
    })
}

#[async_trait]
impl CronStore for SqliteStore {
    async fn list_job_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM cron_jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn load_job(&self, id: &str) -> Result<Option<CronJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM cron_jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn load_jobs(&self, ids: &[String]) -> Result<Vec<CronJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM cron_jobs WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn put_job(
        &self,
        id: &str,
        spec: &CronJobSpec,
        disabled: bool,
        now_ms: u64,
    ) -> Result<()> {
        let spec_json = serde_json::to_string(spec)?;
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            "INSERT INTO cron_jobs (id, spec, disabled, created_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(&spec_json)
        .bind(disabled)
        .bind(now_ms as i64)
        .bind(now_ms as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let spec_changed = created
            || sqlx::query("UPDATE cron_jobs SET spec = ? WHERE id = ? AND spec <> ?")
                .bind(&spec_json)
                .bind(id)
                .bind(&spec_json)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;

        if !created {
            sqlx::query("UPDATE cron_jobs SET disabled = ?, updated_at_ms = ? WHERE id = ?")
                .bind(disabled)
                .bind(now_ms as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        if spec_changed && JobField::Spec.is_versioned() {
            sqlx::query(
                "INSERT INTO cron_field_versions (job_id, field, recorded_at_ms, value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(JobField::Spec.as_str())
            .bind(now_ms as i64)
            .bind(&spec_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::job_not_found(id));
        }
        for table in ["cron_leases", "cron_field_versions", "cron_runs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE job_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<Lease>> {
        let exists = sqlx::query("SELECT 1 FROM cron_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(Error::job_not_found(id));
        }

        let lease = Lease {
            job_id: id.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        // Takes over the row only if the current lease has expired.
        let result = sqlx::query(
            "INSERT INTO cron_leases (job_id, token, holder, expires_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET
                 token = excluded.token,
                 holder = excluded.holder,
                 expires_at_ms = excluded.expires_at_ms
             WHERE cron_leases.expires_at_ms <= ?",
        )
        .bind(&lease.job_id)
        .bind(&lease.token)
        .bind(&lease.holder)
        .bind(lease.expires_at_ms as i64)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        sqlx::query("DELETE FROM cron_leases WHERE job_id = ? AND token = ?")
            .bind(&lease.job_id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_state(
        &self,
        lease: &Lease,
        update: &JobStateUpdate,
        now_ms: u64,
    ) -> Result<()> {
        let status_json = update.last_status.map(|s| serde_json::to_string(&s)).transpose()?;
        let versioned = update.versioned_values()?;
        let state_json = update.state.as_ref().map(serde_json::to_string).transpose()?;

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE cron_jobs SET updated_at_ms = ");
        builder.push_bind(now_ms as i64);
        if let Some(disabled) = update.disabled {
            builder.push(", disabled = ").push_bind(disabled);
        }
        if let Some(ref current_run) = update.current_run {
            builder
                .push(", current_run = ")
                .push_bind(current_run.as_ref().map(|h| h.0.clone()));
        }
        if let Some(at) = update.last_run_at_ms {
            builder.push(", last_run_at_ms = ").push_bind(at as i64);
        }
        if let Some(ref status) = status_json {
            builder.push(", last_status = ").push_bind(status.clone());
        }
        if let Some(ref state) = state_json {
            builder.push(", state = ").push_bind(state.clone());
        }
        builder
            .push(" WHERE id = ")
            .push_bind(lease.job_id.clone())
            .push(
                " AND EXISTS (SELECT 1 FROM cron_leases WHERE cron_leases.job_id = cron_jobs.id \
                 AND token = ",
            )
            .push_bind(lease.token.clone())
            .push(" AND expires_at_ms > ")
            .push_bind(now_ms as i64)
            .push(")");

        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(Error::lock_not_held(&lease.job_id));
        }
        for (field, value) in versioned {
            sqlx::query(
                "INSERT INTO cron_field_versions (job_id, field, recorded_at_ms, value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&lease.job_id)
            .bind(field.as_str())
            .bind(now_ms as i64)
            .bind(serde_json::to_string(&value)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn field_history(&self, id: &str) -> Result<Vec<FieldVersion>> {
        let rows = sqlx::query(
            "SELECT field, recorded_at_ms, value FROM cron_field_versions
             WHERE job_id = ?
             ORDER BY recorded_at_ms, rowid",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut versions = Vec::with_capacity(rows.len());
        for row in rows {
            let field: String = row.get("field");
            let value: String = row.get("value");
            versions.push(FieldVersion {
                field: field.parse()?,
                recorded_at_ms: row.get::<i64, _>("recorded_at_ms") as u64,
                value: serde_json::from_str(&value)?,
            });
        }
        Ok(versions)
    }

    async fn insert_run(&self, run: &CronRunRecord) -> Result<()> {
        let state = serde_json::to_string(&run.state)?;
        sqlx::query(
            "INSERT INTO cron_runs
                 (handle, job_id, started_at_ms, finished_at_ms, state, error, owner, heartbeat_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.handle.as_str())
        .bind(&run.job_id)
        .bind(run.started_at_ms as i64)
        .bind(run.finished_at_ms.map(|v| v as i64))
        .bind(&state)
        .bind(&run.error)
        .bind(&run.owner)
        .bind(run.heartbeat_at_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        handle: &str,
        state: RunState,
        finished_at_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let state = serde_json::to_string(&state)?;
        sqlx::query(
            "UPDATE cron_runs SET state = ?, finished_at_ms = ?, error = ? WHERE handle = ?",
        )
        .bind(&state)
        .bind(finished_at_ms as i64)
        .bind(error)
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_run(&self, handle: &str, now_ms: u64) -> Result<()> {
        let running = serde_json::to_string(&RunState::Running)?;
        sqlx::query("UPDATE cron_runs SET heartbeat_at_ms = ? WHERE handle = ? AND state = ?")
            .bind(now_ms as i64)
            .bind(handle)
            .bind(&running)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_run(&self, handle: &str) -> Result<Option<CronRunRecord>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM cron_runs WHERE handle = ?"))
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM cron_runs
             WHERE job_id = ?
             ORDER BY started_at_ms DESC
             LIMIT ?"
        ))
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut runs = rows.iter().map(run_from_row).collect::<Result<Vec<_>>>()?;
        // Reverse so oldest first (consistent with other stores).
        runs.reverse();
        Ok(runs)
    }

    async fn delete_runs_before(
        &self,
        job_id: &str,
        cutoff_ms: u64,
    ) -> Result<Vec<CronRunRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM cron_runs
             WHERE job_id = ? AND started_at_ms < ?
             ORDER BY started_at_ms"
        ))
        .bind(job_id)
        .bind(cutoff_ms as i64)
        .fetch_all(&mut *tx)
        .await?;
        let purged = rows.iter().map(run_from_row).collect::<Result<Vec<_>>>()?;

        sqlx::query("DELETE FROM cron_runs WHERE job_id = ? AND started_at_ms < ?")
            .bind(job_id)
            .bind(cutoff_ms as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(purged)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::*};

    async fn make_store(dir: &tempfile::TempDir) -> SqliteStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cron.db").display());
        SqliteStore::new(&url).await.unwrap()
    }

    fn make_spec(periodicity_ms: u64) -> CronJobSpec {
        CronJobSpec {
            periodicity_ms,
            lifetime_ms: Some(600_000),
            allow_overruns: false,
            start_time_ms: 1000,
            payload: CronPayload::new("noop").with_args(serde_json::json!({ "n": 1 })),
            description: "test job".into(),
        }
    }

    fn make_run(job_id: &str, handle: &str, started_at_ms: u64) -> CronRunRecord {
        CronRunRecord::running(job_id, RunHandle(handle.into()), started_at_ms)
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        store.put_job("1", &make_spec(60_000), false, 10).await.unwrap();
        store.put_job("2", &make_spec(60_000), true, 10).await.unwrap();

        assert_eq!(store.list_job_ids().await.unwrap(), vec!["1", "2"]);
        let job = store.load_job("1").await.unwrap().unwrap();
        assert_eq!(job.spec, make_spec(60_000));
        assert!(!job.state.disabled);
        assert!(store.load_job("3").await.unwrap().is_none());

        let jobs = store
            .load_jobs(&["2".to_string(), "3".to_string(), "1".to_string()])
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[1].state.disabled);
    }

    #[tokio::test]
    async fn test_sqlite_spec_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        store.put_job("a", &make_spec(60_000), false, 10).await.unwrap();
        store.put_job("a", &make_spec(60_000), true, 20).await.unwrap();
        store.put_job("a", &make_spec(120_000), true, 30).await.unwrap();

        let history = store.field_history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.field == JobField::Spec));
        assert_eq!(history[1].value["periodicityMs"], 120_000);
        assert!(store.load_job("a").await.unwrap().unwrap().state.disabled);
    }

    #[tokio::test]
    async fn test_sqlite_lease_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let first = make_store(&dir).await;
        let second = make_store(&dir).await;
        first.put_job("a", &make_spec(60_000), false, 0).await.unwrap();

        let lease = first.acquire_lease("a", "w1", 100, 0).await.unwrap().unwrap();
        assert!(second.acquire_lease("a", "w2", 100, 50).await.unwrap().is_none());

        second.release_lease(&lease).await.unwrap();
        assert!(second.acquire_lease("a", "w2", 100, 60).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_expired_lease_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        store.put_job("a", &make_spec(60_000), false, 0).await.unwrap();

        let stale = store.acquire_lease("a", "w1", 100, 0).await.unwrap().unwrap();
        let fresh = store.acquire_lease("a", "w2", 100, 150).await.unwrap().unwrap();
        assert_ne!(stale.token, fresh.token);

        let update = JobStateUpdate {
            last_run_at_ms: Some(150),
            ..Default::default()
        };
        assert!(matches!(
            store.write_state(&stale, &update, 160).await.unwrap_err(),
            Error::LockNotHeld { .. }
        ));
        store.write_state(&fresh, &update, 160).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_write_state_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        store.put_job("a", &make_spec(60_000), false, 0).await.unwrap();
        let lease = store.acquire_lease("a", "w", 1000, 0).await.unwrap().unwrap();

        let mut checkpoint = StateMap::new();
        checkpoint.insert("watermark".into(), serde_json::json!(42));
        store
            .write_state(
                &lease,
                &JobStateUpdate {
                    current_run: Some(Some(RunHandle("h1".into()))),
                    last_run_at_ms: Some(5),
                    state: Some(checkpoint.clone()),
                    ..Default::default()
                },
                5,
            )
            .await
            .unwrap();
        store
            .write_state(
                &lease,
                &JobStateUpdate {
                    current_run: Some(None),
                    last_status: Some(RunStatus::Timeout),
                    ..Default::default()
                },
                6,
            )
            .await
            .unwrap();

        let job = store.load_job("a").await.unwrap().unwrap();
        assert!(job.state.current_run.is_none());
        assert_eq!(job.state.last_run_at_ms, Some(5));
        assert_eq!(job.state.last_status, Some(RunStatus::Timeout));
        assert_eq!(job.state.state, checkpoint);

        let history = store.field_history("a").await.unwrap();
        assert!(history.iter().all(|v| v.field.retention() == Retention::Versioned));
        let statuses: Vec<_> = history
            .into_iter()
            .filter(|v| v.field == JobField::LastStatus)
            .collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].value, serde_json::json!("timeout"));
    }

    #[tokio::test]
    async fn test_sqlite_delete_revokes_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        store.put_job("a", &make_spec(60_000), false, 0).await.unwrap();
        let lease = store.acquire_lease("a", "w", 1000, 0).await.unwrap().unwrap();
        store.insert_run(&make_run("a", "h1", 1)).await.unwrap();

        store.delete_job("a").await.unwrap();
        assert!(matches!(
            store
                .write_state(&lease, &JobStateUpdate::default(), 2)
                .await
                .unwrap_err(),
            Error::LockNotHeld { .. }
        ));
        assert!(store.get_run("h1").await.unwrap().is_none());
        assert!(matches!(
            store.delete_job("a").await.unwrap_err(),
            Error::JobNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_sqlite_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;

        for i in 0..5 {
            store
                .insert_run(&make_run("j1", &format!("h{i}"), i * 1000))
                .await
                .unwrap();
        }

        let runs = store.get_runs("j1", 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        // Should be the last 3, in chronological order
        assert_eq!(runs[0].started_at_ms, 2000);
        assert_eq!(runs[2].started_at_ms, 4000);

        store
            .finish_run("h2", RunState::Succeeded, 2500, None)
            .await
            .unwrap();
        let run = store.get_run("h2").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.finished_at_ms, Some(2500));

        let purged = store.delete_runs_before("j1", 2000).await.unwrap();
        assert_eq!(purged.len(), 2);
        assert_eq!(store.get_runs("j1", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sqlite_runs_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        assert!(store.get_runs("none", 10).await.unwrap().is_empty());
        assert!(store.load_jobs(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(&dir).await;
        let mut run = make_run("j1", "h1", 1000);
        run.owner = Some("host:1:abcd".into());
        run.heartbeat_at_ms = Some(1000);
        store.insert_run(&run).await.unwrap();

        store.touch_run("h1", 1500).await.unwrap();
        let stored = store.get_run("h1").await.unwrap().unwrap();
        assert_eq!(stored.owner.as_deref(), Some("host:1:abcd"));
        assert_eq!(stored.heartbeat_at_ms, Some(1500));

        store
            .finish_run("h1", RunState::Failed, 1600, Some("boom"))
            .await
            .unwrap();
        store.touch_run("h1", 1700).await.unwrap();
        assert_eq!(
            store.get_run("h1").await.unwrap().unwrap().heartbeat_at_ms,
            Some(1500)
        );
    }
}
