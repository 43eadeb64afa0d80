//! # Job Metrics
//!
//! OpenTelemetry instruments for batched job execution:
//! - Job and sub-batch duration histograms
//! - Job outcome and migrated tuple counters
//! - Batch size gauge
//!
//! Every recording carries the migration's `migration_id` and
//! `migration_identifier` labels. No exporter is installed here; without a
//! global meter provider the instruments are no-ops.

use crate::constants::METER_NAME;
use crate::models::MigrationLabels;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Duration;

static MIGRATION_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    MIGRATION_METER.get_or_init(|| opentelemetry::global::meter(METER_NAME))
}

/// Job execution duration in seconds
pub fn job_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("batched_migrations.job.duration")
        .with_description("Batched job execution duration in seconds")
        .with_unit("s")
        .build()
}

/// Sub-batch duration in seconds
pub fn sub_batch_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("batched_migrations.sub_batch.duration")
        .with_description("Sub-batch execution duration in seconds")
        .with_unit("s")
        .build()
}

/// Jobs executed, labelled with `outcome` (succeeded, failed)
pub fn jobs_total() -> Counter<u64> {
    meter()
        .u64_counter("batched_migrations.jobs.total")
        .with_description("Total number of batched jobs executed")
        .build()
}

/// Keys covered by succeeded jobs
pub fn migrated_tuples_total() -> Counter<u64> {
    meter()
        .u64_counter("batched_migrations.tuples.migrated.total")
        .with_description("Total number of tuples covered by succeeded batched jobs")
        .build()
}

/// Batch size of the most recently executed job
pub fn batch_size() -> Gauge<u64> {
    meter()
        .u64_gauge("batched_migrations.job.batch_size")
        .with_description("Batch size of the most recently executed job")
        .build()
}

/// Instruments bundled for the executor
#[derive(Clone)]
pub struct JobMetrics {
    job_duration: Histogram<f64>,
    sub_batch_duration: Histogram<f64>,
    jobs_total: Counter<u64>,
    migrated_tuples_total: Counter<u64>,
    batch_size: Gauge<u64>,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            job_duration: job_duration(),
            sub_batch_duration: sub_batch_duration(),
            jobs_total: jobs_total(),
            migrated_tuples_total: migrated_tuples_total(),
            batch_size: batch_size(),
        }
    }

    pub fn record_sub_batch(&self, labels: &MigrationLabels, elapsed: Duration) {
        self.sub_batch_duration
            .record(elapsed.as_secs_f64(), &label_set(labels));
    }

    pub fn record_job(
        &self,
        labels: &MigrationLabels,
        succeeded: bool,
        elapsed: Duration,
        batch_size: i32,
    ) {
        let mut attributes = label_set(labels);
        self.batch_size
            .record(u64::try_from(batch_size).unwrap_or(0), &attributes);

        if succeeded {
            self.migrated_tuples_total
                .add(u64::try_from(batch_size).unwrap_or(0), &attributes);
        }

        attributes.push(KeyValue::new(
            "outcome",
            if succeeded { "succeeded" } else { "failed" },
        ));
        self.job_duration.record(elapsed.as_secs_f64(), &attributes);
        self.jobs_total.add(1, &attributes);
    }
}

impl std::fmt::Debug for JobMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMetrics").finish_non_exhaustive()
    }
}

fn label_set(labels: &MigrationLabels) -> Vec<KeyValue> {
    vec![
        KeyValue::new("migration_id", labels.migration_id),
        KeyValue::new("migration_identifier", labels.migration_identifier.clone()),
    ]
}
