//! # Database Operations
//!
//! Persistence for batched migrations, their jobs, and coordinator leases.
//!
//! ## Overview
//!
//! Everything above this module talks to a [`MigrationStore`]. Two
//! implementations ship with the crate:
//!
//! - [`PgMigrationStore`] - PostgreSQL via SQLx, used in production
//! - [`InMemoryMigrationStore`] - process-local maps, used by tests and
//!   dry runs
//!
//! ## Key Components
//!
//! - [`connection`] - pool construction and schema migrations
//! - [`memory`] - the in-memory store
//! - [`postgres`] - the PostgreSQL store
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use batched_migrations::config::DatabaseConfig;
//! use batched_migrations::database::{connection, MigrationStore, PgMigrationStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connection::connect(&DatabaseConfig::default()).await?;
//! let store = PgMigrationStore::new(pool);
//! let migrations = store.list_migrations(Some("main")).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::models::{BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration};
use crate::state_machine::{JobState, MigrationState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use memory::InMemoryMigrationStore;
pub use postgres::PgMigrationStore;

/// Per-status job counts for one migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub succeeded: i64,
}

impl JobStatusCounts {
    pub fn record(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::Running => self.running += count,
            JobState::Failed => self.failed += count,
            JobState::Succeeded => self.succeeded += count,
        }
    }

    /// Jobs that have finished executing, successfully or not
    pub fn run_count(&self) -> i64 {
        self.failed + self.succeeded
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.failed + self.succeeded
    }
}

/// Storage for migrations, jobs, and coordinator leases.
///
/// Writes of a single row are atomic. Implementations must reject a second
/// migration with the same [`MigrationConfiguration`].
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn create_migration(&self, new: NewBatchedMigration) -> Result<BatchedMigration>;

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>>;

    async fn find_migration_by_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>>;

    /// Write the tracked columns that changed since the migration was loaded.
    ///
    /// Columns that did not change keep whatever the store holds. A status
    /// change only applies while the stored status still equals the tracked
    /// old value; otherwise the write is rejected with `Conflict`. Errors
    /// with `NotFound` for unknown ids.
    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()>;

    /// Migrations ordered by id, optionally restricted to one schema
    async fn list_migrations(&self, schema_name: Option<&str>) -> Result<Vec<BatchedMigration>>;

    /// Lowest-id migration of `schema_name` in one of `statuses` that is not on hold at `now`
    async fn next_executable_migration(
        &self,
        schema_name: &str,
        statuses: &[MigrationState],
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>>;

    async fn create_job(&self, new: NewBatchedJob) -> Result<BatchedJob>;

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>>;

    /// Write the job row if its stored status is still `expected_status`.
    ///
    /// Errors with `Conflict` when another writer moved the job first, which
    /// makes claiming a pending job (pending to running) exclusive.
    async fn save_job(&self, job: &BatchedJob, expected_status: JobState) -> Result<()>;

    /// The job with the highest `max_value`
    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>>;

    /// All jobs of a migration ordered by `min_value`
    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>>;

    /// Jobs in any of `statuses`, ordered by id
    async fn jobs_with_status(
        &self,
        migration_id: i64,
        statuses: &[JobState],
        limit: Option<i64>,
    ) -> Result<Vec<BatchedJob>>;

    /// Counts per status, restricted to jobs created at or after `created_since`
    async fn job_status_counts(
        &self,
        migration_id: i64,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<JobStatusCounts>;

    /// Succeeded jobs with a `finished_at`, most recently finished first
    async fn recent_successful_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>>;

    /// Succeeded or failed jobs, most recently finished first
    async fn recent_finished_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>>;

    /// Σ `batch_size` of succeeded jobs per migration id
    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>>;

    /// Take or renew the lease `key` for `owner`. Returns false while another owner holds it.
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()>;
}
