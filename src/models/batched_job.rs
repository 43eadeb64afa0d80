//! # Batched Job Model
//!
//! One contiguous slice `[min_value, max_value]` of a batched migration's key
//! range. The batch configuration (`batch_size`, `sub_batch_size`,
//! `pause_ms`) is copied from the migration when the job is created, so a
//! job can be reproduced even after the optimizer retunes the migration.
//!
//! ## Database Schema
//!
//! Maps to `batched_background_migration_jobs`:
//! - `batched_background_migration_id`: owning migration (BIGINT)
//! - `min_value` / `max_value`: inclusive key bounds (BIGINT)
//! - `status`: pending 0, running 1, failed 2, succeeded 3 (SMALLINT)
//! - `metrics`: per-execution sub-batch timings (JSONB)

use crate::database::MigrationStore;
use crate::error::{MigrationError, Result};
use crate::state_machine::{JobEvent, JobState, JobStateMachine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedJob {
    pub id: i64,
    pub batched_migration_id: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub pause_ms: i32,
    pub attempts: i32,
    pub status: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New job for creation (without generated fields)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatchedJob {
    pub batched_migration_id: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub pause_ms: i32,
}

/// Inclusive key range handed to the job class for one sub-batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBatchRange {
    pub start_id: i64,
    pub end_id: i64,
}

impl BatchedJob {
    /// Split the job range into consecutive sub-batches of `sub_batch_size` keys
    pub fn sub_batches(&self) -> impl Iterator<Item = SubBatchRange> + '_ {
        let step = i64::from(self.sub_batch_size.max(1));
        let max_value = self.max_value;
        let mut next = Some(self.min_value);

        std::iter::from_fn(move || {
            let start_id = next.filter(|start| *start <= max_value)?;
            let end_id = start_id.saturating_add(step - 1).min(max_value);
            next = end_id.checked_add(1);
            Some(SubBatchRange { start_id, end_id })
        })
    }

    /// Execution duration relative to the migration interval.
    ///
    /// Values below 1.0 mean the job finished inside the interval. Only
    /// succeeded jobs with both timestamps have an efficiency.
    pub fn time_efficiency(&self, interval_seconds: i32) -> Option<f64> {
        if self.status != JobState::Succeeded || interval_seconds <= 0 {
            return None;
        }

        let (started_at, finished_at) = (self.started_at?, self.finished_at?);
        let duration = (finished_at - started_at).num_milliseconds() as f64 / 1_000.0;

        Some(duration / f64::from(interval_seconds))
    }

    /// Execution duration, when the job has both timestamps
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub async fn reload(&mut self, store: &dyn MigrationStore) -> Result<()> {
        *self = store
            .find_job(self.id)
            .await?
            .ok_or_else(|| MigrationError::not_found("BatchedJob", self.id))?;
        Ok(())
    }

    /// Apply a state machine event and persist the result
    pub async fn transition(&mut self, store: &dyn MigrationStore, event: JobEvent) -> Result<JobState> {
        Ok(JobStateMachine::new(self, store).transition(event).await?)
    }

    pub async fn run(&mut self, store: &dyn MigrationStore) -> Result<JobState> {
        self.transition(store, JobEvent::Run).await
    }

    pub async fn succeed(&mut self, store: &dyn MigrationStore) -> Result<JobState> {
        self.transition(store, JobEvent::Succeed).await
    }

    pub async fn fail(&mut self, store: &dyn MigrationStore, error: impl Into<String>) -> Result<JobState> {
        self.transition(store, JobEvent::fail_with_error(error)).await
    }

    pub async fn retry(&mut self, store: &dyn MigrationStore) -> Result<JobState> {
        self.transition(store, JobEvent::Retry).await
    }
}

impl std::fmt::Display for BatchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BatchedJob[id: {}, range: {}..={}]",
            self.id, self.min_value, self.max_value
        )
    }
}
