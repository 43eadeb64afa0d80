use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::database::{JobStatusCounts, MigrationStore};
use crate::error::{MigrationError, Result};
use crate::models::BatchedMigration;
use crate::orchestration::BatchedMigrationRunner;
use crate::state_machine::MigrationState;

/// Operator-facing actions on a single migration, addressed by id
///
/// Each action maps onto one migration operation:
/// - `pause` / `resume` drive the paused and active states
/// - `retry` resets failed jobs and reactivates the migration
/// - `finalize` drains the remaining range synchronously
#[derive(Clone)]
pub struct MigrationControls {
    store: Arc<dyn MigrationStore>,
    runner: Arc<BatchedMigrationRunner>,
}

/// Snapshot of a migration and its job counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatusReport {
    pub id: i64,
    pub migration_identifier: String,
    pub status: MigrationState,
    pub batch_size: i32,
    pub min_value: i64,
    pub max_value: i64,
    pub jobs: JobStatusCounts,
    pub migrated_tuple_count: i64,
    pub total_tuple_count: Option<i64>,
    /// Percentage of `total_tuple_count` covered by succeeded jobs
    pub progress: Option<f64>,
    pub on_hold_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl MigrationControls {
    pub fn new(store: Arc<dyn MigrationStore>, runner: Arc<BatchedMigrationRunner>) -> Self {
        Self { store, runner }
    }

    async fn load(&self, migration_id: i64) -> Result<BatchedMigration> {
        self.store
            .find_migration(migration_id)
            .await?
            .ok_or_else(|| MigrationError::not_found("BatchedMigration", migration_id))
    }

    pub async fn pause(&self, migration_id: i64) -> Result<BatchedMigration> {
        let mut migration = self.load(migration_id).await?;
        migration.pause(self.store.as_ref()).await?;
        info!(migration_id = migration_id, "⏸️ Paused {migration}");
        Ok(migration)
    }

    pub async fn resume(&self, migration_id: i64) -> Result<BatchedMigration> {
        let mut migration = self.load(migration_id).await?;
        migration.execute(self.store.as_ref()).await?;
        info!(migration_id = migration_id, "▶️ Resumed {migration}");
        Ok(migration)
    }

    /// Returns the migration and the number of jobs reset
    pub async fn retry(&self, migration_id: i64) -> Result<(BatchedMigration, usize)> {
        let mut migration = self.load(migration_id).await?;
        let reset = migration.retry_failed_jobs(self.store.as_ref()).await?;
        Ok((migration, reset))
    }

    pub async fn finalize(&self, migration_id: i64) -> Result<BatchedMigration> {
        let migration = self.load(migration_id).await?;
        let finalized = self.runner.finalize(&migration.configuration()).await?;
        Ok(finalized.unwrap_or(migration))
    }

    pub async fn status(&self, migration_id: i64) -> Result<MigrationStatusReport> {
        let migration = self.load(migration_id).await?;
        let store = self.store.as_ref();

        let jobs = store.job_status_counts(migration.id, None).await?;
        let migrated_tuple_count = migration.migrated_tuple_count(store).await?;
        let progress = migration
            .total_tuple_count
            .filter(|total| *total > 0)
            .map(|total| {
                let percent = migrated_tuple_count as f64 / total as f64 * 100.0;
                (percent.min(100.0) * 100.0).round() / 100.0
            });

        Ok(MigrationStatusReport {
            id: migration.id,
            migration_identifier: migration.migration_identifier(),
            status: migration.status(),
            batch_size: migration.batch_size(),
            min_value: migration.min_value,
            max_value: migration.max_value,
            jobs,
            migrated_tuple_count,
            total_tuple_count: migration.total_tuple_count,
            progress,
            on_hold_until: migration.on_hold_until(),
        })
    }

    /// Status reports for every migration, optionally limited to one schema
    pub async fn list(&self, schema_name: Option<&str>) -> Result<Vec<MigrationStatusReport>> {
        let mut reports = Vec::new();
        for migration in self.store.list_migrations(schema_name).await? {
            reports.push(self.status(migration.id).await?);
        }
        Ok(reports)
    }
}

impl std::fmt::Debug for MigrationControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationControls")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::BatchingStrategyRegistry;
    use crate::config::MigrationsConfig;
    use crate::database::InMemoryMigrationStore;
    use crate::execution::{JobClassRegistry, JobExecutor, NoopJobClass};
    use crate::health::HealthStatus;
    use crate::models::NewBatchedMigration;
    use crate::state_machine::JobState;

    fn controls(store: Arc<InMemoryMigrationStore>) -> MigrationControls {
        let job_classes = Arc::new(JobClassRegistry::new());
        job_classes.register(Arc::new(NoopJobClass));
        let runner = BatchedMigrationRunner::new(
            store.clone(),
            Arc::new(BatchingStrategyRegistry::with_defaults(None)),
            JobExecutor::new(store.clone(), job_classes),
            HealthStatus::default(),
            &MigrationsConfig::default(),
        );
        MigrationControls::new(store, Arc::new(runner))
    }

    async fn seed(store: &InMemoryMigrationStore) -> BatchedMigration {
        store
            .create_migration(
                NewBatchedMigration::new("NoopJob", "events", "id")
                    .batch_class_name("DenseRangeBatchingStrategy")
                    .bounds(1, 40)
                    .batch_size(10)
                    .sub_batch_size(10)
                    .pause_ms(0)
                    .total_tuple_count(Some(40))
                    .status(MigrationState::Active),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let controls = controls(store.clone());
        let migration = seed(&store).await;

        assert_eq!(controls.pause(migration.id).await.unwrap().status(), MigrationState::Paused);
        assert_eq!(controls.resume(migration.id).await.unwrap().status(), MigrationState::Active);
    }

    #[tokio::test]
    async fn test_retry_resets_failed_jobs() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let controls = controls(store.clone());
        let mut migration = seed(&store).await;
        let job = migration.create_batched_job(store.as_ref(), 1, 10).await.unwrap();
        store
            .update_job_with(job.id, |job| {
                job.status = JobState::Failed;
                job.attempts = 3;
            })
            .unwrap();
        migration.failure(store.as_ref()).await.unwrap();

        let (migration, reset) = controls.retry(migration.id).await.unwrap();

        assert_eq!(reset, 1);
        assert_eq!(migration.status(), MigrationState::Active);
        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobState::Pending, 0));
    }

    #[tokio::test]
    async fn test_finalize_and_status() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let controls = controls(store.clone());
        let migration = seed(&store).await;

        let finalized = controls.finalize(migration.id).await.unwrap();
        assert_eq!(finalized.status(), MigrationState::Finished);

        let report = controls.status(migration.id).await.unwrap();
        assert_eq!(report.jobs.succeeded, 4);
        assert_eq!(report.migrated_tuple_count, 40);
        assert_eq!(report.progress, Some(100.0));
        assert_eq!(report.migration_identifier, "NoopJob/events.id");
    }

    #[tokio::test]
    async fn test_finished_migrations_and_jobs_are_retained() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let controls = controls(store.clone());
        let migration = seed(&store).await;

        controls.finalize(migration.id).await.unwrap();

        let reports = controls.list(None).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, migration.id);
        assert_eq!(reports[0].status, MigrationState::Finished);
        assert_eq!(store.jobs_for_migration(migration.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_migration() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let controls = controls(store);

        assert_eq!(
            controls.pause(42).await.unwrap_err(),
            MigrationError::not_found("BatchedMigration", 42)
        );
    }
}
