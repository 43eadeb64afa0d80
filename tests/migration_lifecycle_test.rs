//! Lifecycle behavior of a batched migration over the in-memory store:
//! circuit breaker, retry, finishing guard, interval throttling, smoothing
//! and end-to-end range coverage.

mod common;

use batched_migrations::batching::{BatchRequest, BatchingStrategyRegistry};
use batched_migrations::config::CircuitBreakerConfig;
use batched_migrations::database::{InMemoryMigrationStore, MigrationStore};
use batched_migrations::error::MigrationError;
use batched_migrations::state_machine::{JobState, MigrationState};
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn breaker(minimum_jobs: i64, maximum_failed_ratio: f64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        minimum_jobs,
        maximum_failed_ratio,
    }
}

#[tokio::test]
async fn test_should_stop_ignores_small_samples() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(
        &store,
        &migration,
        &[JobState::Succeeded, JobState::Succeeded, JobState::Succeeded, JobState::Failed],
    )
    .await;

    assert!(!migration.should_stop(&store, &breaker(10, 0.70)).await.unwrap());
}

#[tokio::test]
async fn test_should_stop_trips_above_ratio() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(
        &store,
        &migration,
        &[JobState::Succeeded, JobState::Failed, JobState::Failed, JobState::Failed],
    )
    .await;

    assert!(migration.should_stop(&store, &breaker(4, 0.70)).await.unwrap());
}

#[tokio::test]
async fn test_should_stop_stays_false_without_failures() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(&store, &migration, &[JobState::Succeeded, JobState::Succeeded]).await;

    assert!(!migration.should_stop(&store, &breaker(2, 0.70)).await.unwrap());
}

#[tokio::test]
async fn test_should_stop_only_counts_jobs_since_start() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    let jobs = seed_jobs(&store, &migration, &[JobState::Failed, JobState::Failed]).await;

    let before_start = migration.started_at().unwrap() - ChronoDuration::hours(1);
    for job in &jobs {
        backdate_job(&store, job.id, before_start);
    }

    assert!(!migration.should_stop(&store, &breaker(1, 0.5)).await.unwrap());
}

#[tokio::test]
async fn test_retry_failed_jobs_resets_attempts_and_activates() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    let jobs = seed_jobs(
        &store,
        &migration,
        &[JobState::Failed, JobState::Succeeded, JobState::Failed],
    )
    .await;
    migration.failure(&store).await.unwrap();

    let reset = migration.retry_failed_jobs(&store).await.unwrap();

    assert_eq!(reset, 2);
    assert_eq!(migration.status(), MigrationState::Active);
    for job in [&jobs[0], &jobs[2]] {
        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
    }
    let untouched = store.find_job(jobs[1].id).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobState::Succeeded);
}

#[tokio::test]
async fn test_retry_without_failed_jobs_still_activates() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events").create(&store).await;
    assert_eq!(migration.status(), MigrationState::Paused);

    assert_eq!(migration.retry_failed_jobs(&store).await.unwrap(), 0);

    let persisted = store.find_migration(migration.id).await.unwrap().unwrap();
    assert_eq!(persisted.status(), MigrationState::Active);
    assert!(persisted.started_at().is_some());
}

#[tokio::test]
async fn test_finish_rejected_with_failed_jobs() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(&store, &migration, &[JobState::Succeeded, JobState::Failed]).await;

    let err = migration.finish(&store).await.unwrap_err();

    assert!(err.is_invalid_transition(), "unexpected error: {err}");
    assert_eq!(migration.status(), MigrationState::Active);
    let persisted = store.find_migration(migration.id).await.unwrap().unwrap();
    assert_eq!(persisted.status(), MigrationState::Active);
}

#[tokio::test]
async fn test_finish_rejected_with_pending_jobs() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(&store, &migration, &[JobState::Succeeded, JobState::Pending]).await;

    assert!(migration.finish(&store).await.unwrap_err().is_invalid_transition());
}

#[tokio::test]
async fn test_finish_succeeds_when_all_jobs_succeeded() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(&store, &migration, &[JobState::Succeeded, JobState::Succeeded]).await;

    assert_eq!(migration.finish(&store).await.unwrap(), MigrationState::Finished);
}

#[tokio::test]
async fn test_interval_elapsed() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .interval_seconds(120)
        .status(MigrationState::Active)
        .create(&store)
        .await;

    assert!(migration
        .interval_elapsed(&store, Utc::now(), Duration::ZERO)
        .await
        .unwrap());

    let job = migration.create_batched_job(&store, 1, 10).await.unwrap();
    assert!(!migration
        .interval_elapsed(&store, Utc::now(), Duration::ZERO)
        .await
        .unwrap());

    let now = Utc::now();
    backdate_job(&store, job.id, now - ChronoDuration::seconds(118));
    assert!(!migration.interval_elapsed(&store, now, Duration::ZERO).await.unwrap());
    assert!(migration
        .interval_elapsed(&store, now, Duration::from_secs(5))
        .await
        .unwrap());

    backdate_job(&store, job.id, now - ChronoDuration::seconds(120));
    assert!(migration.interval_elapsed(&store, now, Duration::ZERO).await.unwrap());
}

#[tokio::test]
async fn test_next_min_value_after_succeeded_job() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .bounds(5, 100)
        .status(MigrationState::Active)
        .create(&store)
        .await;
    assert_eq!(migration.next_min_value(&store).await.unwrap(), Some(5));

    let mut job = migration.create_batched_job(&store, 5, 14).await.unwrap();
    job.run(&store).await.unwrap();
    job.succeed(&store).await.unwrap();

    assert_eq!(migration.next_min_value(&store).await.unwrap(), Some(job.max_value + 1));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_range_ending_at_key_space_limit_is_covered_once() {
    let store = Arc::new(InMemoryMigrationStore::new());
    let runner = runner(store.clone());
    let mut migration = MigrationBuilder::new("events")
        .bounds(i64::MAX - 14, i64::MAX)
        .batch_size(10)
        .status(MigrationState::Active)
        .create(&store)
        .await;

    runner.run_entire_migration(&mut migration).await.unwrap();

    let ranges: Vec<(i64, i64)> = store
        .jobs_for_migration(migration.id)
        .await
        .unwrap()
        .iter()
        .map(|job| (job.min_value, job.max_value))
        .collect();
    assert_eq!(ranges, vec![(i64::MAX - 14, i64::MAX - 5), (i64::MAX - 4, i64::MAX)]);
    assert_eq!(migration.next_min_value(store.as_ref()).await.unwrap(), None);
    assert_eq!(runner.next_batch_range(&migration).await.unwrap(), None);
    assert_eq!(migration.status(), MigrationState::Finished);
}

#[tokio::test]
async fn test_create_batched_job_snapshots_batch_configuration() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;

    let first = migration.create_batched_job(&store, 1, 10).await.unwrap();
    migration.set_batch_size(20);
    migration.save(&store).await.unwrap();
    let second = migration.create_batched_job(&store, 11, 30).await.unwrap();

    assert_eq!(first.batch_size, 10);
    assert_eq!(second.batch_size, 20);
    assert_eq!((second.sub_batch_size, second.pause_ms), (5, 0));
}

#[tokio::test]
async fn test_create_batched_job_rejects_range_outside_bounds() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events").create(&store).await;

    let err = migration.create_batched_job(&store, 95, 105).await.unwrap_err();
    assert!(matches!(err, MigrationError::ValidationError(_)));
}

#[tokio::test]
async fn test_ten_batches_cover_range_and_finish() {
    let store = InMemoryMigrationStore::new();
    let strategies = BatchingStrategyRegistry::with_defaults(None);
    let mut migration = MigrationBuilder::new("events")
        .bounds(1, 100)
        .batch_size(10)
        .status(MigrationState::Active)
        .create(&store)
        .await;
    let strategy = strategies.resolve(&migration.batch_class_name).unwrap();

    let mut jobs = Vec::new();
    for _ in 0..10 {
        let next_min = migration.next_min_value(&store).await.unwrap().unwrap();
        let bounds = strategy
            .next_batch(&BatchRequest::for_migration(&migration, next_min))
            .await
            .unwrap()
            .unwrap()
            .clamp_to(migration.max_value);
        jobs.push(
            migration
                .create_batched_job(&store, bounds.min_value, bounds.max_value)
                .await
                .unwrap(),
        );
    }

    let ranges: Vec<(i64, i64)> = jobs.iter().map(|job| (job.min_value, job.max_value)).collect();
    let expected: Vec<(i64, i64)> = (0..10).map(|i| (i * 10 + 1, i * 10 + 10)).collect();
    assert_eq!(ranges, expected);
    assert_eq!(migration.next_min_value(&store).await.unwrap(), Some(101));

    for job in &mut jobs {
        job.run(&store).await.unwrap();
        job.succeed(&store).await.unwrap();
    }

    assert_eq!(migration.finish(&store).await.unwrap(), MigrationState::Finished);
    assert_eq!(migration.migrated_tuple_count(&store).await.unwrap(), 100);
}

#[tokio::test]
async fn test_smoothed_time_efficiency_needs_enough_history() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .interval_seconds(100)
        .status(MigrationState::Active)
        .create(&store)
        .await;
    seed_jobs(&store, &migration, &[JobState::Succeeded; 3]).await;

    assert_eq!(
        migration.smoothed_time_efficiency(&store, 4, 0.2).await.unwrap(),
        None
    );
    assert!(migration
        .smoothed_time_efficiency(&store, 3, 0.2)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_smoothed_time_efficiency_follows_recent_trend() {
    let store = InMemoryMigrationStore::new();
    let migration = MigrationBuilder::new("events")
        .interval_seconds(100)
        .status(MigrationState::Active)
        .create(&store)
        .await;

    // oldest first
    let efficiencies = [0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 1.0, 1.0, 1.0, 1.0];
    let jobs = seed_jobs(&store, &migration, &[JobState::Succeeded; 10]).await;
    let base = Utc::now();
    for (i, (job, efficiency)) in jobs.iter().zip(efficiencies).enumerate() {
        let finished_at = base + ChronoDuration::minutes(i as i64);
        store
            .update_job_with(job.id, |job| {
                job.finished_at = Some(finished_at);
                job.started_at =
                    Some(finished_at - ChronoDuration::milliseconds((efficiency * 100_000.0) as i64));
            })
            .unwrap();
    }

    let smoothed = migration
        .smoothed_time_efficiency(&store, 10, 0.2)
        .await
        .unwrap()
        .unwrap();

    assert!((smoothed - 1.0).abs() < (smoothed - 0.5).abs(), "smoothed = {smoothed}");
}

#[tokio::test]
async fn test_failed_save_reverts_transition() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;

    store.fail_next_migration_save();
    let err = migration.pause(&store).await.unwrap_err();

    assert!(matches!(err, MigrationError::DatabaseError(_)));
    assert_eq!(migration.status(), MigrationState::Active);
    assert!(!migration.has_changes());

    assert_eq!(migration.pause(&store).await.unwrap(), MigrationState::Paused);
}

#[tokio::test]
async fn test_hold_excludes_migration_from_pick() {
    let store = InMemoryMigrationStore::new();
    let mut migration = MigrationBuilder::new("events")
        .status(MigrationState::Active)
        .create(&store)
        .await;
    let now = Utc::now();

    migration
        .hold(&store, now + ChronoDuration::minutes(10))
        .await
        .unwrap();

    let picked = store
        .next_executable_migration("main", &[MigrationState::Active], now)
        .await
        .unwrap();
    assert!(picked.is_none());

    let later = store
        .next_executable_migration(
            "main",
            &[MigrationState::Active],
            now + ChronoDuration::minutes(11),
        )
        .await
        .unwrap();
    assert_eq!(later.map(|m| m.id), Some(migration.id));
}
