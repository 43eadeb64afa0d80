use super::errors::{business_rule_violation, GuardResult};
use crate::database::MigrationStore;
use crate::models::{BatchedJob, BatchedMigration};
use async_trait::async_trait;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T: Sync> {
    /// Check if a transition is allowed
    async fn check(&self, entity: &T, store: &dyn MigrationStore) -> GuardResult<bool>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// A migration may only finish once every one of its jobs succeeded
pub struct AllJobsSucceededGuard;

#[async_trait]
impl StateGuard<BatchedMigration> for AllJobsSucceededGuard {
    async fn check(
        &self,
        migration: &BatchedMigration,
        store: &dyn MigrationStore,
    ) -> GuardResult<bool> {
        let counts = store.job_status_counts(migration.id, None).await?;
        let unfinished = counts.total() - counts.succeeded;

        if unfinished > 0 {
            return Err(business_rule_violation(format!(
                "all jobs need to be succeeded: {migration} has {unfinished} jobs that did not succeed"
            )));
        }

        Ok(true)
    }

    fn description(&self) -> &'static str {
        "All batched jobs must be succeeded"
    }
}

/// Only jobs of a migration that has not finished may be run
pub struct MigrationNotFinishedGuard;

#[async_trait]
impl StateGuard<BatchedJob> for MigrationNotFinishedGuard {
    async fn check(&self, job: &BatchedJob, store: &dyn MigrationStore) -> GuardResult<bool> {
        let finished = store
            .find_migration(job.batched_migration_id)
            .await?
            .is_some_and(|migration| migration.is_finished());

        if finished {
            return Err(business_rule_violation(format!(
                "{job} belongs to a finished migration"
            )));
        }

        Ok(true)
    }

    fn description(&self) -> &'static str {
        "Owning migration must not be finished"
    }
}
