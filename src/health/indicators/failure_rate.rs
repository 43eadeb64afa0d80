use crate::config::FailureRateIndicatorConfig;
use crate::database::MigrationStore;
use crate::health::{HealthContext, HealthIndicator, HealthIndicatorError, Signal};
use crate::state_machine::JobState;
use async_trait::async_trait;
use std::sync::Arc;

/// Stops a migration whose most recent jobs are mostly failing.
///
/// Looks at the last `window` finished jobs; with fewer than that the
/// signal is always normal.
pub struct FailureRateIndicator {
    store: Arc<dyn MigrationStore>,
    config: FailureRateIndicatorConfig,
}

impl FailureRateIndicator {
    pub fn new(store: Arc<dyn MigrationStore>, config: FailureRateIndicatorConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl HealthIndicator for FailureRateIndicator {
    fn name(&self) -> &'static str {
        "failure_rate"
    }

    async fn evaluate(&self, context: &HealthContext) -> Result<Signal, HealthIndicatorError> {
        if !self.config.enabled || self.config.window == 0 {
            return Ok(Signal::normal(self.name()));
        }

        let recent = self
            .store
            .recent_finished_jobs(context.migration_id, self.config.window)
            .await?;

        if recent.len() < self.config.window {
            return Ok(Signal::normal(self.name()));
        }

        let failed = recent
            .iter()
            .filter(|job| job.status == JobState::Failed)
            .count();
        let ratio = failed as f64 / recent.len() as f64;

        if ratio >= self.config.stop_ratio {
            return Ok(Signal::stop(
                self.name(),
                format!("{failed} of the last {} jobs failed", recent.len()),
            ));
        }

        Ok(Signal::normal(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryMigrationStore;
    use crate::models::{NewBatchedJob, NewBatchedMigration};
    use chrono::{Duration, Utc};

    async fn seed(store: &InMemoryMigrationStore, outcomes: &[JobState]) -> i64 {
        let migration = store
            .create_migration(NewBatchedMigration::new("Job", "events", "id").bounds(1, 1_000))
            .await
            .unwrap();

        let now = Utc::now();
        for (i, status) in outcomes.iter().enumerate() {
            let min_value = i as i64 * 10 + 1;
            let job = store
                .create_job(NewBatchedJob {
                    batched_migration_id: migration.id,
                    min_value,
                    max_value: min_value + 9,
                    batch_size: 10,
                    sub_batch_size: 5,
                    pause_ms: 0,
                })
                .await
                .unwrap();
            store
                .update_job_with(job.id, |job| {
                    job.status = *status;
                    job.finished_at = Some(now + Duration::seconds(i as i64));
                })
                .unwrap();
        }

        migration.id
    }

    fn indicator(store: Arc<InMemoryMigrationStore>, window: usize) -> FailureRateIndicator {
        FailureRateIndicator::new(
            store,
            FailureRateIndicatorConfig {
                enabled: true,
                window,
                stop_ratio: 0.8,
            },
        )
    }

    #[tokio::test]
    async fn test_stops_on_mostly_failing_window() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let mut outcomes = vec![JobState::Succeeded; 3];
        outcomes.extend([JobState::Failed; 4]);
        let migration_id = seed(&store, &outcomes).await;

        let signal = indicator(store, 5)
            .evaluate(&HealthContext::new(migration_id, "main", vec![]))
            .await
            .unwrap();

        assert!(signal.is_stop());
        assert_eq!(signal.reason(), Some("4 of the last 5 jobs failed"));
    }

    #[tokio::test]
    async fn test_short_history_is_normal() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let migration_id = seed(&store, &[JobState::Failed; 3]).await;

        let signal = indicator(store, 5)
            .evaluate(&HealthContext::new(migration_id, "main", vec![]))
            .await
            .unwrap();

        assert!(!signal.is_interesting());
    }
}
