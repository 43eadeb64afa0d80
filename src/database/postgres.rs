//! PostgreSQL [`MigrationStore`] backed by SQLx.
//!
//! Queries are built at runtime with `query_as`, so the crate compiles
//! without a live database. Status columns hold the integer encodings of
//! [`MigrationState`] and [`JobState`].

use super::{JobStatusCounts, MigrationStore};
use crate::error::{MigrationError, Result};
use crate::models::{
    BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration,
    Tracked,
};
use crate::state_machine::{JobState, MigrationState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const MIGRATIONS_TABLE: &str = "batched_background_migrations";
const JOBS_TABLE: &str = "batched_background_migration_jobs";

const MIGRATION_COLUMNS: &str = r#"
    id, job_class_name, batch_class_name, table_name, column_name, job_arguments,
    schema_name, min_value, max_value, batch_size, sub_batch_size, max_batch_size,
    pause_ms, "interval", status, total_tuple_count, started_at, on_hold_until,
    created_at, updated_at
"#;

const JOB_COLUMNS: &str = r#"
    id, batched_background_migration_id, min_value, max_value, batch_size,
    sub_batch_size, pause_ms, attempts, status, started_at, finished_at, metrics,
    last_error, created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct MigrationRow {
    id: i64,
    job_class_name: String,
    batch_class_name: String,
    table_name: String,
    column_name: String,
    job_arguments: Value,
    schema_name: String,
    min_value: i64,
    max_value: i64,
    batch_size: i32,
    sub_batch_size: i32,
    max_batch_size: Option<i32>,
    pause_ms: i32,
    interval: i32,
    status: i16,
    total_tuple_count: Option<i64>,
    started_at: Option<DateTime<Utc>>,
    on_hold_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MigrationRow> for BatchedMigration {
    type Error = MigrationError;

    fn try_from(row: MigrationRow) -> Result<Self> {
        let status = MigrationState::from_i16(row.status).ok_or_else(|| {
            MigrationError::InvalidState(format!(
                "batched migration {} has unknown status {}",
                row.id, row.status
            ))
        })?;

        Ok(BatchedMigration {
            id: row.id,
            job_class_name: row.job_class_name,
            batch_class_name: row.batch_class_name,
            table_name: row.table_name,
            column_name: row.column_name,
            job_arguments: row.job_arguments,
            schema_name: row.schema_name,
            min_value: row.min_value,
            max_value: row.max_value,
            sub_batch_size: row.sub_batch_size,
            max_batch_size: row.max_batch_size,
            pause_ms: row.pause_ms,
            interval: row.interval,
            total_tuple_count: row.total_tuple_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
            batch_size: Tracked::new(row.batch_size),
            status: Tracked::new(status),
            started_at: Tracked::new(row.started_at),
            on_hold_until: Tracked::new(row.on_hold_until),
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    batched_background_migration_id: i64,
    min_value: i64,
    max_value: i64,
    batch_size: i32,
    sub_batch_size: i32,
    pause_ms: i32,
    attempts: i32,
    status: i16,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    metrics: Value,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for BatchedJob {
    type Error = MigrationError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = JobState::from_i16(row.status).ok_or_else(|| {
            MigrationError::InvalidState(format!(
                "batched job {} has unknown status {}",
                row.id, row.status
            ))
        })?;

        Ok(BatchedJob {
            id: row.id,
            batched_migration_id: row.batched_background_migration_id,
            min_value: row.min_value,
            max_value: row.max_value,
            batch_size: row.batch_size,
            sub_batch_size: row.sub_batch_size,
            pause_ms: row.pause_ms,
            attempts: row.attempts,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            metrics: row.metrics,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn migrations_from(rows: Vec<MigrationRow>) -> Result<Vec<BatchedMigration>> {
    rows.into_iter().map(BatchedMigration::try_from).collect()
}

fn jobs_from(rows: Vec<JobRow>) -> Result<Vec<BatchedJob>> {
    rows.into_iter().map(BatchedJob::try_from).collect()
}

fn migration_states(states: &[MigrationState]) -> Vec<i16> {
    states.iter().map(MigrationState::as_i16).collect()
}

fn job_states(states: &[JobState]) -> Vec<i16> {
    states.iter().map(JobState::as_i16).collect()
}

fn limit_of(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Raw status of a row, used to tell a missing row from a lost race
    async fn stored_status(&self, table: &str, id: i64) -> Result<Option<i16>> {
        Ok(
            sqlx::query_scalar::<_, i16>(&format!("SELECT status FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn recent_jobs_in(
        &self,
        migration_id: i64,
        statuses: &[JobState],
        limit: usize,
    ) -> Result<Vec<BatchedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = $1
               AND status = ANY($2)
               AND finished_at IS NOT NULL
             ORDER BY finished_at DESC, id DESC
             LIMIT $3"
        ))
        .bind(migration_id)
        .bind(job_states(statuses))
        .bind(limit_of(limit))
        .fetch_all(&self.pool)
        .await?;

        jobs_from(rows)
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn create_migration(&self, new: NewBatchedMigration) -> Result<BatchedMigration> {
        new.validate()?;
        let configuration = new.configuration();

        let result = sqlx::query_as::<_, MigrationRow>(&format!(
            r#"INSERT INTO batched_background_migrations
               (job_class_name, batch_class_name, table_name, column_name, job_arguments,
                schema_name, min_value, max_value, batch_size, sub_batch_size, max_batch_size,
                pause_ms, "interval", status, total_tuple_count, started_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
               RETURNING {MIGRATION_COLUMNS}"#
        ))
        .bind(&new.job_class_name)
        .bind(&new.batch_class_name)
        .bind(&new.table_name)
        .bind(&new.column_name)
        .bind(&new.job_arguments)
        .bind(&new.schema_name)
        .bind(new.min_value)
        .bind(new.max_value)
        .bind(new.batch_size)
        .bind(new.sub_batch_size)
        .bind(new.max_batch_size)
        .bind(new.pause_ms)
        .bind(new.interval)
        .bind(new.status.as_i16())
        .bind(new.total_tuple_count)
        .bind(new.started_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => BatchedMigration::try_from(row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                MigrationError::DuplicateConfiguration(configuration.to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(BatchedMigration::try_from)
        .transpose()
    }

    async fn find_migration_by_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>> {
        sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations
             WHERE job_class_name = $1
               AND table_name = $2
               AND column_name = $3
               AND job_arguments = $4"
        ))
        .bind(&configuration.job_class_name)
        .bind(&configuration.table_name)
        .bind(&configuration.column_name)
        .bind(&configuration.job_arguments)
        .fetch_optional(&self.pool)
        .await?
        .map(BatchedMigration::try_from)
        .transpose()
    }

    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()> {
        let status = migration.tracked_status();
        let batch_size = migration.tracked_batch_size();

        let result = sqlx::query(
            r#"UPDATE batched_background_migrations
               SET status = CASE WHEN $2 THEN $3 ELSE status END,
                   batch_size = CASE WHEN $4 THEN $5 ELSE batch_size END,
                   started_at = CASE WHEN $6 THEN $7 ELSE started_at END,
                   on_hold_until = CASE WHEN $8 THEN $9 ELSE on_hold_until END,
                   updated_at = $10
               WHERE id = $1
                 AND (NOT $2 OR status = $11)"#,
        )
        .bind(migration.id)
        .bind(status.is_changed())
        .bind(status.get().as_i16())
        .bind(batch_size.is_changed())
        .bind(*batch_size.get())
        .bind(migration.started_at.is_changed())
        .bind(migration.started_at())
        .bind(migration.on_hold_until.is_changed())
        .bind(migration.on_hold_until())
        .bind(migration.updated_at)
        .bind(status.was().as_i16())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.stored_status(MIGRATIONS_TABLE, migration.id).await? {
                None => Err(MigrationError::not_found("BatchedMigration", migration.id)),
                Some(found) => Err(MigrationError::conflict(
                    "BatchedMigration",
                    migration.id,
                    format!(
                        "expected status {} before moving to {}, found {}",
                        status.was(),
                        status.get(),
                        MigrationState::from_i16(found).map_or_else(|| found.to_string(), |s| s.to_string())
                    ),
                )),
            };
        }

        debug!(migration_id = migration.id, status = %migration.status(), "Saved batched migration");
        Ok(())
    }

    async fn list_migrations(&self, schema_name: Option<&str>) -> Result<Vec<BatchedMigration>> {
        let rows = sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations
             WHERE ($1::TEXT IS NULL OR schema_name = $1)
             ORDER BY id"
        ))
        .bind(schema_name)
        .fetch_all(&self.pool)
        .await?;

        migrations_from(rows)
    }

    async fn next_executable_migration(
        &self,
        schema_name: &str,
        statuses: &[MigrationState],
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations
             WHERE schema_name = $1
               AND status = ANY($2)
               AND (on_hold_until IS NULL OR on_hold_until <= $3)
             ORDER BY id
             LIMIT 1"
        ))
        .bind(schema_name)
        .bind(migration_states(statuses))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(BatchedMigration::try_from)
        .transpose()
    }

    async fn create_job(&self, new: NewBatchedJob) -> Result<BatchedJob> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "INSERT INTO batched_background_migration_jobs
             (batched_background_migration_id, min_value, max_value, batch_size,
              sub_batch_size, pause_ms)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new.batched_migration_id)
        .bind(new.min_value)
        .bind(new.max_value)
        .bind(new.batch_size)
        .bind(new.sub_batch_size)
        .bind(new.pause_ms)
        .fetch_one(&self.pool)
        .await?;

        BatchedJob::try_from(row)
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(BatchedJob::try_from)
        .transpose()
    }

    async fn save_job(&self, job: &BatchedJob, expected_status: JobState) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batched_background_migration_jobs
             SET attempts = $2,
                 status = $3,
                 started_at = $4,
                 finished_at = $5,
                 metrics = $6,
                 last_error = $7,
                 updated_at = $8
             WHERE id = $1
               AND status = $9",
        )
        .bind(job.id)
        .bind(job.attempts)
        .bind(job.status.as_i16())
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.metrics)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .bind(expected_status.as_i16())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.stored_status(JOBS_TABLE, job.id).await? {
                None => Err(MigrationError::not_found("BatchedJob", job.id)),
                Some(found) => Err(MigrationError::conflict(
                    "BatchedJob",
                    job.id,
                    format!(
                        "expected status {expected_status}, found {}",
                        JobState::from_i16(found).map_or_else(|| found.to_string(), |s| s.to_string())
                    ),
                )),
            };
        }
        Ok(())
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = $1
             ORDER BY max_value DESC, id DESC
             LIMIT 1"
        ))
        .bind(migration_id)
        .fetch_optional(&self.pool)
        .await?
        .map(BatchedJob::try_from)
        .transpose()
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = $1
             ORDER BY min_value, id"
        ))
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await?;

        jobs_from(rows)
    }

    async fn jobs_with_status(
        &self,
        migration_id: i64,
        statuses: &[JobState],
        limit: Option<i64>,
    ) -> Result<Vec<BatchedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = $1
               AND status = ANY($2)
             ORDER BY id
             LIMIT $3"
        ))
        .bind(migration_id)
        .bind(job_states(statuses))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        jobs_from(rows)
    }

    async fn job_status_counts(
        &self,
        migration_id: i64,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<JobStatusCounts> {
        let rows: Vec<(i16, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*)::BIGINT
             FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = $1
               AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
             GROUP BY status",
        )
        .bind(migration_id)
        .bind(created_since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobStatusCounts::default();
        for (status, count) in rows {
            let state = JobState::from_i16(status).ok_or_else(|| {
                MigrationError::InvalidState(format!("unknown batched job status {status}"))
            })?;
            counts.record(state, count);
        }

        Ok(counts)
    }

    async fn recent_successful_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>> {
        self.recent_jobs_in(migration_id, &[JobState::Succeeded], limit)
            .await
    }

    async fn recent_finished_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>> {
        self.recent_jobs_in(migration_id, &[JobState::Succeeded, JobState::Failed], limit)
            .await
    }

    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT batched_background_migration_id, SUM(batch_size)::BIGINT
             FROM batched_background_migration_jobs
             WHERE batched_background_migration_id = ANY($1)
               AND status = $2
             GROUP BY batched_background_migration_id",
        )
        .bind(migration_ids)
        .bind(JobState::Succeeded.as_i16())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MigrationError::ValidationError(format!("invalid lease ttl: {e}")))?;

        let acquired: Option<(String,)> = sqlx::query_as(
            "INSERT INTO batched_migration_leases (lease_key, owner, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (lease_key) DO UPDATE
               SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
               WHERE batched_migration_leases.owner = EXCLUDED.owner
                  OR batched_migration_leases.expires_at <= $4
             RETURNING owner",
        )
        .bind(key)
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM batched_migration_leases WHERE lease_key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
