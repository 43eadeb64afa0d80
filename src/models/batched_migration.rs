//! # Batched Migration Model
//!
//! The aggregate that owns a table-wide key range and slices it into
//! [`BatchedJob`]s over time.
//!
//! ## Overview
//!
//! A batched migration is identified by `(job_class_name, table_name,
//! column_name, job_arguments)`. It carries the batch configuration the
//! coordinator hands to each new job, the pacing `interval`, and its
//! lifecycle status. Status changes go through
//! [`MigrationStateMachine`](crate::state_machine::MigrationStateMachine);
//! the mutable columns are wrapped in [`Tracked`] so callers can inspect
//! pending changes before they are persisted.
//!
//! ## Database Schema
//!
//! Maps to `batched_background_migrations`:
//! - `id`: queue order (BIGSERIAL)
//! - `min_value` / `max_value`: inclusive key bounds (BIGINT)
//! - `batch_size`, `sub_batch_size`, `max_batch_size`, `pause_ms`, `interval` (INTEGER)
//! - `status`: paused 0, active 1, finished 3, failed 4, finalizing 5 (SMALLINT)
//! - `on_hold_until`: hold deadline (TIMESTAMPTZ, nullable)
//! - `schema_name`: shard the migration targets (TEXT)

use super::batched_job::{BatchedJob, NewBatchedJob};
use super::tracked::Tracked;
use crate::config::{CircuitBreakerConfig, MigrationDefaultsConfig};
use crate::constants;
use crate::database::{JobStatusCounts, MigrationStore};
use crate::error::{MigrationError, Result};
use crate::health::HealthContext;
use crate::orchestration::batch_optimizer::{BatchOptimizer, BatchSizeChange};
use crate::state_machine::{JobState, MigrationEvent, MigrationState, MigrationStateMachine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Failed jobs are reset in chunks of this size
const RETRY_CHUNK_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedMigration {
    pub id: i64,
    pub job_class_name: String,
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
    pub schema_name: String,
    pub min_value: i64,
    pub max_value: i64,
    pub sub_batch_size: i32,
    pub max_batch_size: Option<i32>,
    pub pause_ms: i32,
    /// Minimum seconds between job creations
    pub interval: i32,
    pub total_tuple_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub(crate) batch_size: Tracked<i32>,
    pub(crate) status: Tracked<MigrationState>,
    pub(crate) started_at: Tracked<Option<DateTime<Utc>>>,
    pub(crate) on_hold_until: Tracked<Option<DateTime<Utc>>>,
}

/// The identifying tuple of a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfiguration {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
}

impl MigrationConfiguration {
    pub fn new(
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Value,
    ) -> Self {
        Self {
            job_class_name: normalize_class_name(job_class_name.as_ref()),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }
}

impl fmt::Display for MigrationConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job_class_name: {}, table_name: {}, column_name: {}, job_arguments: {}",
            self.job_class_name, self.table_name, self.column_name, self.job_arguments
        )
    }
}

/// Labels attached to every metric and log line about a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationLabels {
    pub migration_id: i64,
    pub migration_identifier: String,
}

/// New migration for creation (without generated fields)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatchedMigration {
    pub job_class_name: String,
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
    pub schema_name: String,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub max_batch_size: Option<i32>,
    pub pause_ms: i32,
    pub interval: i32,
    pub total_tuple_count: Option<i64>,
    pub status: MigrationState,
    pub started_at: Option<DateTime<Utc>>,
}

impl NewBatchedMigration {
    pub fn new(
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self::with_defaults(
            &MigrationDefaultsConfig::default(),
            job_class_name,
            table_name,
            column_name,
        )
    }

    pub fn with_defaults(
        defaults: &MigrationDefaultsConfig,
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self {
            job_class_name: normalize_class_name(job_class_name.as_ref()),
            batch_class_name: normalize_class_name(&defaults.batch_class_name),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments: json!([]),
            schema_name: constants::DEFAULT_SCHEMA_NAME.to_string(),
            min_value: defaults.batch_min_value,
            max_value: defaults.batch_min_value,
            batch_size: defaults.batch_size,
            sub_batch_size: defaults.sub_batch_size,
            max_batch_size: None,
            pause_ms: defaults.pause_ms,
            interval: defaults.interval_seconds,
            total_tuple_count: None,
            status: MigrationState::Paused,
            started_at: None,
        }
    }

    pub fn job_arguments(mut self, job_arguments: Value) -> Self {
        self.job_arguments = job_arguments;
        self
    }

    pub fn schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn batch_class_name(mut self, batch_class_name: impl AsRef<str>) -> Self {
        self.batch_class_name = normalize_class_name(batch_class_name.as_ref());
        self
    }

    pub fn bounds(mut self, min_value: i64, max_value: i64) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn sub_batch_size(mut self, sub_batch_size: i32) -> Self {
        self.sub_batch_size = sub_batch_size;
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: Option<i32>) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn pause_ms(mut self, pause_ms: i32) -> Self {
        self.pause_ms = pause_ms;
        self
    }

    pub fn interval_seconds(mut self, interval: i32) -> Self {
        self.interval = interval;
        self
    }

    pub fn total_tuple_count(mut self, total_tuple_count: Option<i64>) -> Self {
        self.total_tuple_count = total_tuple_count;
        self
    }

    /// Initial status. Creating a migration `active` stamps `started_at`.
    pub fn status(mut self, status: MigrationState) -> Self {
        self.status = status;
        self.started_at = (status == MigrationState::Active).then(Utc::now);
        self
    }

    pub fn configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration::new(
            &self.job_class_name,
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_class_name.is_empty() || self.table_name.is_empty() || self.column_name.is_empty()
        {
            return Err(MigrationError::ValidationError(
                "job_class_name, table_name and column_name are required".to_string(),
            ));
        }
        if self.min_value > self.max_value {
            return Err(MigrationError::ValidationError(format!(
                "min_value ({}) must not exceed max_value ({})",
                self.min_value, self.max_value
            )));
        }
        if self.batch_size < 1 || self.sub_batch_size < 1 {
            return Err(MigrationError::ValidationError(format!(
                "batch_size ({}) and sub_batch_size ({}) must be positive",
                self.batch_size, self.sub_batch_size
            )));
        }
        if let Some(max_batch_size) = self.max_batch_size {
            if max_batch_size < 1 {
                return Err(MigrationError::ValidationError(format!(
                    "max_batch_size ({max_batch_size}) must be positive"
                )));
            }
        }
        if self.pause_ms < 0 || self.interval < 0 {
            return Err(MigrationError::ValidationError(
                "pause_ms and interval must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl BatchedMigration {
    /// Build a migration from its creation request; used by stores
    pub(crate) fn from_new(id: i64, new: NewBatchedMigration, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_class_name: new.job_class_name,
            batch_class_name: new.batch_class_name,
            table_name: new.table_name,
            column_name: new.column_name,
            job_arguments: new.job_arguments,
            schema_name: new.schema_name,
            min_value: new.min_value,
            max_value: new.max_value,
            sub_batch_size: new.sub_batch_size,
            max_batch_size: new.max_batch_size,
            pause_ms: new.pause_ms,
            interval: new.interval,
            total_tuple_count: new.total_tuple_count,
            created_at: now,
            updated_at: now,
            batch_size: Tracked::new(new.batch_size),
            status: Tracked::new(new.status),
            started_at: Tracked::new(new.started_at),
            on_hold_until: Tracked::new(None),
        }
    }

    pub fn valid_statuses() -> [MigrationState; 5] {
        MigrationState::ALL
    }

    pub fn status(&self) -> MigrationState {
        self.status.value()
    }

    pub fn batch_size(&self) -> i32 {
        self.batch_size.value()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.value()
    }

    pub fn on_hold_until(&self) -> Option<DateTime<Utc>> {
        self.on_hold_until.value()
    }

    pub fn tracked_status(&self) -> &Tracked<MigrationState> {
        &self.status
    }

    pub fn tracked_batch_size(&self) -> &Tracked<i32> {
        &self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: i32) {
        self.batch_size.set(batch_size);
    }

    pub(crate) fn set_status(&mut self, status: MigrationState) {
        self.status.set(status);
    }

    pub(crate) fn set_started_at(&mut self, started_at: Option<DateTime<Utc>>) {
        self.started_at.set(started_at);
    }

    pub(crate) fn set_on_hold_until(&mut self, on_hold_until: Option<DateTime<Utc>>) {
        self.on_hold_until.set(on_hold_until);
    }

    pub fn has_changes(&self) -> bool {
        self.batch_size.is_changed()
            || self.status.is_changed()
            || self.started_at.is_changed()
            || self.on_hold_until.is_changed()
    }

    pub fn commit_changes(&mut self) {
        self.batch_size.commit();
        self.status.commit();
        self.started_at.commit();
        self.on_hold_until.commit();
    }

    pub fn revert_changes(&mut self) {
        self.batch_size.revert();
        self.status.revert();
        self.started_at.revert();
        self.on_hold_until.revert();
    }

    pub fn is_active(&self) -> bool {
        self.status() == MigrationState::Active
    }

    pub fn is_paused(&self) -> bool {
        self.status() == MigrationState::Paused
    }

    pub fn is_finished(&self) -> bool {
        self.status() == MigrationState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.status() == MigrationState::Failed
    }

    pub fn is_finalizing(&self) -> bool {
        self.status() == MigrationState::Finalizing
    }

    /// True while `on_hold_until` lies in the future
    pub fn on_hold(&self, now: DateTime<Utc>) -> bool {
        self.on_hold_until().is_some_and(|until| until > now)
    }

    pub fn configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration::new(
            &self.job_class_name,
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }

    /// `JobClass/table.column`
    pub fn migration_identifier(&self) -> String {
        format!(
            "{}/{}.{}",
            self.job_class_name, self.table_name, self.column_name
        )
    }

    pub fn metric_labels(&self) -> MigrationLabels {
        MigrationLabels {
            migration_id: self.id,
            migration_identifier: self.migration_identifier(),
        }
    }

    /// Tables whose live health gates this migration
    pub fn health_context(&self) -> HealthContext {
        HealthContext::new(self.id, self.schema_name.clone(), vec![self.table_name.clone()])
    }

    /// Persist tracked changes. A failed write leaves the changes pending.
    pub async fn save(&mut self, store: &dyn MigrationStore) -> Result<()> {
        if !self.has_changes() {
            return Ok(());
        }
        self.updated_at = Utc::now();
        store.save_migration(self).await?;
        self.commit_changes();
        Ok(())
    }

    pub async fn reload(&mut self, store: &dyn MigrationStore) -> Result<()> {
        *self = store
            .find_migration(self.id)
            .await?
            .ok_or_else(|| MigrationError::not_found("BatchedMigration", self.id))?;
        Ok(())
    }

    /// The job with the highest `max_value`
    pub async fn last_job(&self, store: &dyn MigrationStore) -> Result<Option<BatchedJob>> {
        store.last_job(self.id).await
    }

    /// First key not covered by any created job.
    ///
    /// `None` when the last job already ends at `i64::MAX`, so no key is left.
    pub async fn next_min_value(&self, store: &dyn MigrationStore) -> Result<Option<i64>> {
        Ok(match self.last_job(store).await? {
            Some(job) => job.max_value.checked_add(1),
            None => Some(self.min_value),
        })
    }

    /// Persist a job for `[min, max]`, snapshotting the current batch configuration
    pub async fn create_batched_job(
        &self,
        store: &dyn MigrationStore,
        min: i64,
        max: i64,
    ) -> Result<BatchedJob> {
        if min > max {
            return Err(MigrationError::ValidationError(format!(
                "job range {min}..={max} is empty"
            )));
        }
        if min < self.min_value || max > self.max_value {
            return Err(MigrationError::ValidationError(format!(
                "job range {min}..={max} lies outside {self} bounds {}..={}",
                self.min_value, self.max_value
            )));
        }

        store
            .create_job(NewBatchedJob {
                batched_migration_id: self.id,
                min_value: min,
                max_value: max,
                batch_size: self.batch_size(),
                sub_batch_size: self.sub_batch_size,
                pause_ms: self.pause_ms,
            })
            .await
    }

    /// Whether enough time has passed since the last job was created
    pub async fn interval_elapsed(
        &self,
        store: &dyn MigrationStore,
        now: DateTime<Utc>,
        variance: Duration,
    ) -> Result<bool> {
        let last_created_at = self.last_job(store).await?.map(|job| job.created_at);
        Ok(self.interval_elapsed_since(last_created_at, now, variance))
    }

    pub fn interval_elapsed_since(
        &self,
        last_job_created_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        variance: Duration,
    ) -> bool {
        let Some(created_at) = last_job_created_at else {
            return true;
        };

        let variance = chrono::Duration::from_std(variance).unwrap_or_else(|_| chrono::Duration::zero());
        let interval_with_variance = chrono::Duration::seconds(i64::from(self.interval)) - variance;

        created_at <= now - interval_with_variance
    }

    /// Failure-ratio circuit breaker over the jobs run since `started_at`
    pub async fn should_stop(
        &self,
        store: &dyn MigrationStore,
        breaker: &CircuitBreakerConfig,
    ) -> Result<bool> {
        let Some(started_at) = self.started_at() else {
            return Ok(false);
        };

        let counts = store.job_status_counts(self.id, Some(started_at)).await?;
        Ok(Self::should_stop_with(&counts, breaker))
    }

    pub fn should_stop_with(counts: &JobStatusCounts, breaker: &CircuitBreakerConfig) -> bool {
        let run_jobs = counts.run_count();
        if run_jobs == 0 || run_jobs < breaker.minimum_jobs {
            return false;
        }

        counts.failed as f64 / run_jobs as f64 > breaker.maximum_failed_ratio
    }

    /// Reset every failed job to pending with zero attempts and activate the migration.
    ///
    /// Returns the number of jobs reset.
    pub async fn retry_failed_jobs(&mut self, store: &dyn MigrationStore) -> Result<usize> {
        let mut reset = 0;

        loop {
            let failed = store
                .jobs_with_status(self.id, &[JobState::Failed], Some(RETRY_CHUNK_SIZE))
                .await?;
            if failed.is_empty() {
                break;
            }

            for mut job in failed {
                job.retry(store).await?;
                reset += 1;
            }
        }

        self.execute(store).await?;

        info!(
            migration_id = self.id,
            job_class_name = %self.job_class_name,
            reset_jobs = reset,
            "Retried failed batched jobs"
        );

        Ok(reset)
    }

    /// Exponentially weighted efficiency of the most recent successful jobs.
    ///
    /// `None` until `number_of_jobs` successful jobs exist.
    pub async fn smoothed_time_efficiency(
        &self,
        store: &dyn MigrationStore,
        number_of_jobs: usize,
        alpha: f64,
    ) -> Result<Option<f64>> {
        let jobs = store
            .recent_successful_jobs(self.id, number_of_jobs)
            .await?;

        if jobs.len() < number_of_jobs {
            return Ok(None);
        }

        let efficiencies: Vec<f64> = jobs
            .iter()
            .filter_map(|job| job.time_efficiency(self.interval))
            .collect();

        Ok(smoothed_efficiency(&efficiencies, alpha))
    }

    /// Let the optimizer retune `batch_size`
    pub async fn optimize(
        &mut self,
        store: &dyn MigrationStore,
        optimizer: &BatchOptimizer,
    ) -> Result<Option<BatchSizeChange>> {
        optimizer.optimize(self, store).await
    }

    /// Keep the coordinator from picking this migration until `until_time`
    pub async fn hold(&mut self, store: &dyn MigrationStore, until_time: DateTime<Utc>) -> Result<()> {
        let duration_s = (until_time - Utc::now()).num_seconds();
        info!(
            migration_id = self.id,
            job_class_name = %self.job_class_name,
            duration_s = duration_s,
            "{self} put on hold until {until_time}"
        );

        self.set_on_hold_until(Some(until_time));
        self.save(store).await
    }

    pub async fn hold_for(&mut self, store: &dyn MigrationStore, duration: Duration) -> Result<()> {
        let duration = chrono::Duration::from_std(duration)
            .map_err(|e| MigrationError::ValidationError(format!("invalid hold duration: {e}")))?;
        self.hold(store, Utc::now() + duration).await
    }

    /// Σ batch_size over succeeded jobs
    pub async fn migrated_tuple_count(&self, store: &dyn MigrationStore) -> Result<i64> {
        Ok(store
            .successful_rows_counts(&[self.id])
            .await?
            .get(&self.id)
            .copied()
            .unwrap_or(0))
    }

    /// Apply a state machine event and persist the result
    pub async fn transition(
        &mut self,
        store: &dyn MigrationStore,
        event: MigrationEvent,
    ) -> Result<MigrationState> {
        Ok(MigrationStateMachine::new(self, store)
            .transition(event)
            .await?)
    }

    pub async fn pause(&mut self, store: &dyn MigrationStore) -> Result<MigrationState> {
        self.transition(store, MigrationEvent::Pause).await
    }

    pub async fn execute(&mut self, store: &dyn MigrationStore) -> Result<MigrationState> {
        self.transition(store, MigrationEvent::Execute).await
    }

    /// Rejected unless every job succeeded
    pub async fn finish(&mut self, store: &dyn MigrationStore) -> Result<MigrationState> {
        self.transition(store, MigrationEvent::Finish).await
    }

    pub async fn failure(&mut self, store: &dyn MigrationStore) -> Result<MigrationState> {
        self.transition(store, MigrationEvent::Failure).await
    }

    pub async fn finalize(&mut self, store: &dyn MigrationStore) -> Result<MigrationState> {
        self.transition(store, MigrationEvent::Finalize).await
    }
}

impl fmt::Display for BatchedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchedMigration[id: {}]", self.id)
    }
}

/// Strip the leading `::` some callers pass with fully qualified names
pub fn normalize_class_name(class_name: &str) -> String {
    class_name.trim_start_matches("::").to_string()
}

/// Exponentially weighted mean of `efficiencies`, newest first.
///
/// Entry `i` carries weight `(1 - alpha)^i`, so a sustained run of similar
/// recent values moves the result further than one outlier. Rounded to two
/// decimals; `None` for an empty slice.
pub fn smoothed_efficiency(efficiencies: &[f64], alpha: f64) -> Option<f64> {
    let decay = 1.0 - alpha;

    let (dividend, divisor) = efficiencies
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(dividend, divisor), (i, efficiency)| {
            let weight = decay.powi(i as i32);
            (dividend + efficiency * weight, divisor + weight)
        });

    if divisor == 0.0 {
        return None;
    }

    Some(((dividend / divisor) * 100.0).round() / 100.0)
}
