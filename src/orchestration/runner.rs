//! # Batched Migration Runner
//!
//! Executes jobs for one migration and reacts to their completion: trips the
//! failure-ratio circuit breaker, holds the migration on a stop signal,
//! retunes the batch size and finishes the migration once its range is
//! covered.
//!
//! The runner is also the [`JobHandler`] behind the worker pool, and drives
//! the synchronous finalize path that drains a migration without interval
//! or health pacing.

use crate::batching::{BatchBounds, BatchRequest, BatchingStrategyRegistry};
use crate::config::{CircuitBreakerConfig, HoldConfig, MigrationsConfig};
use crate::database::MigrationStore;
use crate::error::{MigrationError, Result};
use crate::execution::{JobDispatch, JobExecutor, JobHandler, JobOutcome};
use crate::health::HealthStatus;
use crate::models::{BatchedJob, BatchedMigration, MigrationConfiguration};
use crate::orchestration::batch_optimizer::BatchOptimizer;
use crate::state_machine::{JobState, MigrationState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a single `run_migration_job` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// A job was executed
    Executed { job_id: i64, outcome: JobOutcome },
    /// No work remained and the migration moved to `status`
    Completed { status: MigrationState },
    /// Another worker claimed the job first; nothing was executed
    Skipped { job_id: i64 },
    /// No work could be started; jobs are still running elsewhere
    Idle,
}

pub struct BatchedMigrationRunner {
    store: Arc<dyn MigrationStore>,
    strategies: Arc<BatchingStrategyRegistry>,
    executor: JobExecutor,
    health: HealthStatus,
    optimizer: BatchOptimizer,
    breaker: CircuitBreakerConfig,
    hold: HoldConfig,
}

impl BatchedMigrationRunner {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        strategies: Arc<BatchingStrategyRegistry>,
        executor: JobExecutor,
        health: HealthStatus,
        config: &MigrationsConfig,
    ) -> Self {
        Self {
            store,
            strategies,
            executor,
            health,
            optimizer: BatchOptimizer::new(config.optimizer.clone()),
            breaker: config.circuit_breaker.clone(),
            hold: config.hold.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    pub fn health(&self) -> &HealthStatus {
        &self.health
    }

    /// Next range to cover, clamped to the migration's `max_value`.
    ///
    /// `None` once the strategy finds no further keys.
    pub async fn next_batch_range(&self, migration: &BatchedMigration) -> Result<Option<BatchBounds>> {
        let store = self.store.as_ref();
        let Some(batch_min_value) = migration.next_min_value(store).await? else {
            return Ok(None);
        };
        let request = BatchRequest::for_migration(migration, batch_min_value);

        if request.is_exhausted() {
            return Ok(None);
        }
        request.validate()?;

        let strategy = self.strategies.resolve(&migration.batch_class_name)?;
        let bounds = strategy.next_batch(&request).await?;

        Ok(bounds
            .map(|bounds| bounds.clamp_to(migration.max_value))
            .filter(|bounds| bounds.min_value <= bounds.max_value))
    }

    /// Execute the next unit of work for `migration`.
    ///
    /// Creates a job for the next range when one exists; otherwise picks up
    /// the oldest pending job; otherwise tries to finish the migration.
    #[instrument(skip_all, fields(migration_id = migration.id))]
    pub async fn run_migration_job(&self, migration: &mut BatchedMigration) -> Result<RunOutcome> {
        let store = self.store.as_ref();

        if let Some(bounds) = self.next_batch_range(migration).await? {
            let job = migration
                .create_batched_job(store, bounds.min_value, bounds.max_value)
                .await?;
            return self.execute_job(migration, job).await;
        }

        let pending = store
            .jobs_with_status(migration.id, &[JobState::Pending], Some(1))
            .await?;
        if let Some(job) = pending.into_iter().next() {
            return self.execute_job(migration, job).await;
        }

        let before = migration.status();
        let status = self.finish_or_fail(migration).await?;
        if status == before {
            Ok(RunOutcome::Idle)
        } else {
            Ok(RunOutcome::Completed { status })
        }
    }

    /// Run `job` and then react to its outcome.
    ///
    /// A job that another worker moved out of pending first is skipped.
    pub async fn execute_job(
        &self,
        migration: &mut BatchedMigration,
        mut job: BatchedJob,
    ) -> Result<RunOutcome> {
        let outcome = match self.executor.execute(migration, &mut job).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() && job.status == JobState::Pending => {
                debug!(
                    migration_id = migration.id,
                    job_id = job.id,
                    error = %e,
                    "Batched job was claimed by another worker, skipping"
                );
                return Ok(RunOutcome::Skipped { job_id: job.id });
            }
            Err(e) => return Err(e),
        };
        self.after_job_completed(migration, &job, &outcome).await?;

        Ok(RunOutcome::Executed {
            job_id: job.id,
            outcome,
        })
    }

    /// Post-job bookkeeping for the owning migration
    #[instrument(skip_all, fields(migration_id = migration.id, job_id = job.id))]
    pub async fn after_job_completed(
        &self,
        migration: &mut BatchedMigration,
        job: &BatchedJob,
        outcome: &JobOutcome,
    ) -> Result<()> {
        let store = self.store.as_ref();
        migration.reload(store).await?;

        if !outcome.is_success()
            && is_progressing(migration.status())
            && migration.should_stop(store, &self.breaker).await?
        {
            warn!(
                migration_id = migration.id,
                job_class_name = %migration.job_class_name,
                minimum_jobs = self.breaker.minimum_jobs,
                maximum_failed_ratio = self.breaker.maximum_failed_ratio,
                "🛑 Failure ratio exceeded, marking {migration} as failed"
            );
            migration.failure(store).await?;
            return Ok(());
        }

        if migration.is_active() {
            self.adjust_migration(migration).await?;
        }

        let range_covered = migration
            .next_min_value(store)
            .await?
            .map_or(true, |next_min_value| next_min_value > migration.max_value);
        if range_covered {
            self.finish_or_fail(migration).await?;
        }

        Ok(())
    }

    /// Hold on a stop signal, otherwise let the optimizer retune the batch size
    async fn adjust_migration(&self, migration: &mut BatchedMigration) -> Result<()> {
        let store = self.store.as_ref();
        let signal = self.health.evaluate_worst(&migration.health_context()).await;

        if signal.is_stop() {
            migration.hold_for(store, self.hold.default_hold()).await?;
        } else {
            migration.optimize(store, &self.optimizer).await?;
        }

        Ok(())
    }

    /// Finish when every job succeeded, fail when any failed, and leave the
    /// migration alone while jobs are still pending or running.
    pub async fn finish_or_fail(&self, migration: &mut BatchedMigration) -> Result<MigrationState> {
        let store = self.store.as_ref();

        if !is_progressing(migration.status()) {
            return Ok(migration.status());
        }

        let counts = store.job_status_counts(migration.id, None).await?;
        if counts.pending > 0 || counts.running > 0 {
            debug!(
                migration_id = migration.id,
                pending = counts.pending,
                running = counts.running,
                "Jobs still outstanding, not finishing yet"
            );
            return Ok(migration.status());
        }

        let status = if counts.failed > 0 {
            migration.failure(store).await?
        } else {
            migration.finish(store).await?
        };

        info!(
            migration_id = migration.id,
            job_class_name = %migration.job_class_name,
            status = %status,
            succeeded_jobs = counts.succeeded,
            failed_jobs = counts.failed,
            "🏁 {migration} completed its range"
        );

        Ok(status)
    }

    /// Synchronously drain the migration for `configuration`.
    ///
    /// Missing and already finished migrations are logged and left alone.
    /// Anything that does not end `finished` raises `FailedToFinalize`.
    #[instrument(skip(self), fields(configuration = %configuration))]
    pub async fn finalize(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>> {
        let store = self.store.as_ref();

        let Some(mut migration) = store.find_migration_by_configuration(configuration).await? else {
            warn!(
                job_class_name = %configuration.job_class_name,
                table_name = %configuration.table_name,
                column_name = %configuration.column_name,
                "Could not find batched background migration for the given configuration"
            );
            return Ok(None);
        };

        if migration.is_finished() {
            info!(
                migration_id = migration.id,
                job_class_name = %migration.job_class_name,
                "{migration} is already finished"
            );
            return Ok(Some(migration));
        }

        migration.finalize(store).await?;
        info!(
            migration_id = migration.id,
            job_class_name = %migration.job_class_name,
            "⏩ Finalizing {migration}"
        );

        for job in store
            .jobs_with_status(migration.id, &[JobState::Pending], None)
            .await?
        {
            self.execute_job(&mut migration, job).await?;
        }

        self.run_migration_while(&mut migration, MigrationState::Finalizing)
            .await?;

        if !migration.is_finished() {
            return Err(MigrationError::FailedToFinalize {
                migration_id: migration.id,
                job_class_name: migration.job_class_name.clone(),
            });
        }

        Ok(Some(migration))
    }

    /// Run jobs back to back while the migration stays active.
    ///
    /// Ignores interval and health pacing; meant for development and tests.
    pub async fn run_entire_migration(&self, migration: &mut BatchedMigration) -> Result<()> {
        self.run_migration_while(migration, MigrationState::Active).await
    }

    async fn run_migration_while(
        &self,
        migration: &mut BatchedMigration,
        status: MigrationState,
    ) -> Result<()> {
        while migration.status() == status {
            if self.run_migration_job(migration).await? == RunOutcome::Idle {
                break;
            }
            migration.reload(self.store.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for BatchedMigrationRunner {
    async fn handle(&self, dispatch: JobDispatch) -> Result<()> {
        let store = self.store.as_ref();

        let mut migration = store
            .find_migration(dispatch.migration_id)
            .await?
            .ok_or_else(|| MigrationError::not_found("BatchedMigration", dispatch.migration_id))?;
        let job = store
            .find_job(dispatch.job_id)
            .await?
            .ok_or_else(|| MigrationError::not_found("BatchedJob", dispatch.job_id))?;

        if job.status != JobState::Pending {
            debug!(
                migration_id = migration.id,
                job_id = job.id,
                status = %job.status,
                "Skipping dispatched job that is no longer pending"
            );
            return Ok(());
        }

        self.execute_job(&mut migration, job).await.map(|_| ())
    }
}

impl std::fmt::Debug for BatchedMigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedMigrationRunner")
            .field("health", &self.health)
            .field("optimizer", &self.optimizer)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

fn is_progressing(status: MigrationState) -> bool {
    matches!(status, MigrationState::Active | MigrationState::Finalizing)
}
