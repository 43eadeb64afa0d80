//! Shared fixtures for integration tests over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use batched_migrations::batching::BatchingStrategyRegistry;
use batched_migrations::config::MigrationsConfig;
use batched_migrations::database::{InMemoryMigrationStore, MigrationStore};
use batched_migrations::execution::{JobClass, JobClassRegistry, JobExecutor, NoopJobClass, SubBatch};
use batched_migrations::health::{HealthContext, HealthIndicator, HealthIndicatorError, HealthStatus, Signal};
use batched_migrations::models::{BatchedJob, BatchedMigration, NewBatchedMigration};
use batched_migrations::orchestration::BatchedMigrationRunner;
use batched_migrations::state_machine::{JobState, MigrationState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Builder for migrations used across tests
pub struct MigrationBuilder {
    new: NewBatchedMigration,
}

impl MigrationBuilder {
    pub fn new(table_name: &str) -> Self {
        Self {
            new: NewBatchedMigration::new("NoopJob", table_name, "id")
                .batch_class_name("DenseRangeBatchingStrategy")
                .bounds(1, 100)
                .batch_size(10)
                .sub_batch_size(5)
                .pause_ms(0)
                .interval_seconds(120),
        }
    }

    pub fn job_class(mut self, job_class_name: &str) -> Self {
        self.new.job_class_name = job_class_name.to_string();
        self
    }

    pub fn bounds(mut self, min_value: i64, max_value: i64) -> Self {
        self.new = self.new.bounds(min_value, max_value);
        self
    }

    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.new = self.new.batch_size(batch_size);
        self
    }

    pub fn interval_seconds(mut self, interval: i32) -> Self {
        self.new = self.new.interval_seconds(interval);
        self
    }

    pub fn status(mut self, status: MigrationState) -> Self {
        self.new = self.new.status(status);
        self
    }

    pub async fn create(self, store: &InMemoryMigrationStore) -> BatchedMigration {
        store
            .create_migration(self.new)
            .await
            .expect("Failed to create test migration")
    }
}

/// Plant jobs with the given final statuses directly after the migration's last job
pub async fn seed_jobs(
    store: &InMemoryMigrationStore,
    migration: &BatchedMigration,
    statuses: &[JobState],
) -> Vec<BatchedJob> {
    let mut jobs = Vec::with_capacity(statuses.len());
    for status in statuses {
        let min_value = migration
            .next_min_value(store)
            .await
            .unwrap()
            .expect("migration range has no keys left");
        let max_value = (min_value + i64::from(migration.batch_size()) - 1).min(migration.max_value);
        let job = migration
            .create_batched_job(store, min_value, max_value)
            .await
            .expect("Failed to create test job");

        let now = Utc::now();
        let job = store
            .update_job_with(job.id, |job| {
                job.status = *status;
                if matches!(status, JobState::Succeeded | JobState::Failed) {
                    job.attempts = 1;
                    job.started_at = Some(now);
                    job.finished_at = Some(now);
                }
            })
            .unwrap();
        jobs.push(job);
    }
    jobs
}

/// Move a job's creation time back
pub fn backdate_job(store: &InMemoryMigrationStore, job_id: i64, created_at: DateTime<Utc>) {
    store
        .update_job_with(job_id, |job| job.created_at = created_at)
        .unwrap();
}

/// Job class that fails every sub-batch touching a key above the threshold
pub struct FailAboveJobClass(pub i64);

#[async_trait]
impl JobClass for FailAboveJobClass {
    fn name(&self) -> &'static str {
        "FailAboveJob"
    }

    async fn process_sub_batch(&self, sub_batch: &SubBatch<'_>) -> anyhow::Result<()> {
        if sub_batch.end_id > self.0 {
            anyhow::bail!("key {} rejected", sub_batch.end_id);
        }
        Ok(())
    }
}

/// Job class recording every sub-batch range it sees
#[derive(Default)]
pub struct RecordingJobClass {
    pub ranges: Mutex<Vec<(i64, i64)>>,
}

#[async_trait]
impl JobClass for RecordingJobClass {
    fn name(&self) -> &'static str {
        "RecordingJob"
    }

    async fn process_sub_batch(&self, sub_batch: &SubBatch<'_>) -> anyhow::Result<()> {
        self.ranges.lock().push((sub_batch.start_id, sub_batch.end_id));
        Ok(())
    }
}

/// Indicator returning a fixed signal
pub struct FixedIndicator(pub Signal);

#[async_trait]
impl HealthIndicator for FixedIndicator {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn evaluate(&self, _context: &HealthContext) -> Result<Signal, HealthIndicatorError> {
        Ok(self.0.clone())
    }
}

/// Indicator that always errors
pub struct BrokenIndicator;

#[async_trait]
impl HealthIndicator for BrokenIndicator {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn evaluate(&self, _context: &HealthContext) -> Result<Signal, HealthIndicatorError> {
        Err(HealthIndicatorError::Probe("probe unavailable".to_string()))
    }
}

pub fn job_classes() -> Arc<JobClassRegistry> {
    let registry = JobClassRegistry::new();
    registry.register(Arc::new(NoopJobClass));
    registry.register(Arc::new(FailAboveJobClass(50)));
    Arc::new(registry)
}

pub fn runner_with(
    store: Arc<InMemoryMigrationStore>,
    job_classes: Arc<JobClassRegistry>,
    health: HealthStatus,
    config: &MigrationsConfig,
) -> BatchedMigrationRunner {
    BatchedMigrationRunner::new(
        store.clone(),
        Arc::new(BatchingStrategyRegistry::with_defaults(None)),
        JobExecutor::new(store, job_classes),
        health,
        config,
    )
}

pub fn runner(store: Arc<InMemoryMigrationStore>) -> BatchedMigrationRunner {
    runner_with(
        store,
        job_classes(),
        HealthStatus::default(),
        &MigrationsConfig::default(),
    )
}
