//! # Job Executor
//!
//! The execution wrapper around a job class: marks the job running, walks
//! its range in `sub_batch_size` steps with a `pause_ms` sleep between
//! sub-batches, records timings in the job's `metrics`, then marks the job
//! succeeded or failed.
//!
//! A failing job class never surfaces as an `Err`; it becomes a failed job.
//! Only store failures propagate.

use super::job_class::{JobClassRegistry, SubBatch};
use super::metrics::JobMetrics;
use crate::database::MigrationStore;
use crate::error::Result;
use crate::models::{BatchedJob, BatchedMigration};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How a job execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded,
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn MigrationStore>,
    job_classes: Arc<JobClassRegistry>,
    metrics: JobMetrics,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn MigrationStore>, job_classes: Arc<JobClassRegistry>) -> Self {
        Self {
            store,
            job_classes,
            metrics: JobMetrics::new(),
        }
    }

    pub fn job_classes(&self) -> &Arc<JobClassRegistry> {
        &self.job_classes
    }

    /// Run `job` to completion for `migration`
    #[instrument(skip_all, fields(migration_id = migration.id, job_id = job.id))]
    pub async fn execute(&self, migration: &BatchedMigration, job: &mut BatchedJob) -> Result<JobOutcome> {
        let store = self.store.as_ref();
        let labels = migration.metric_labels();

        job.run(store).await?;
        let started = Instant::now();

        let job_class = match self.job_classes.resolve(&migration.job_class_name) {
            Ok(job_class) => job_class,
            Err(e) => {
                let error = e.to_string();
                job.fail(store, error.clone()).await?;
                self.metrics
                    .record_job(&labels, false, started.elapsed(), job.batch_size);
                warn!(job_class_name = %migration.job_class_name, error = %error, "Job class could not be resolved");
                return Ok(JobOutcome::Failed { error });
            }
        };

        let pause = Duration::from_millis(u64::try_from(job.pause_ms).unwrap_or(0));
        let ranges: Vec<_> = job.sub_batches().collect();
        let mut timings = Vec::with_capacity(ranges.len());
        let mut failure = None;

        for (index, range) in ranges.iter().enumerate() {
            if index > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let sub_batch = SubBatch {
                migration_id: migration.id,
                job_id: job.id,
                table_name: &migration.table_name,
                column_name: &migration.column_name,
                start_id: range.start_id,
                end_id: range.end_id,
                sub_batch_size: job.sub_batch_size,
                job_arguments: &migration.job_arguments,
            };

            let sub_started = Instant::now();
            let result = job_class.process_sub_batch(&sub_batch).await;
            let elapsed = sub_started.elapsed();

            timings.push(elapsed.as_secs_f64());
            self.metrics.record_sub_batch(&labels, elapsed);

            if let Err(e) = result {
                failure = Some(format!(
                    "sub-batch {}..={} failed: {e:#}",
                    range.start_id, range.end_id
                ));
                break;
            }

            debug!(
                start_id = range.start_id,
                end_id = range.end_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Sub-batch processed"
            );
        }

        job.metrics = json!({
            "timings": { "sub_batch": timings },
            "sub_batches": timings.len(),
        });

        let elapsed = started.elapsed();
        let outcome = match failure {
            None => {
                job.succeed(store).await?;
                info!(
                    job_class_name = %migration.job_class_name,
                    min_value = job.min_value,
                    max_value = job.max_value,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "✅ Batched job succeeded"
                );
                JobOutcome::Succeeded
            }
            Some(error) => {
                job.fail(store, error.clone()).await?;
                warn!(
                    job_class_name = %migration.job_class_name,
                    min_value = job.min_value,
                    max_value = job.max_value,
                    attempts = job.attempts,
                    error = %error,
                    "❌ Batched job failed"
                );
                JobOutcome::Failed { error }
            }
        };

        self.metrics
            .record_job(&labels, outcome.is_success(), elapsed, job.batch_size);

        Ok(outcome)
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("job_classes", &self.job_classes)
            .finish_non_exhaustive()
    }
}
