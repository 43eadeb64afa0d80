//! PostgreSQL store, batching and registration against a live database.
//!
//! Needs `DATABASE_URL`; run with `cargo test --features pg-integration`.

#![cfg(feature = "pg-integration")]

use batched_migrations::batching::{BatchBounds, BatchRequest, BatchingStrategy, PrimaryKeyBatchingStrategy};
use batched_migrations::database::{MigrationStore, PgMigrationStore};
use batched_migrations::error::MigrationError;
use batched_migrations::health::{AutovacuumProbe, PgAutovacuumProbe};
use batched_migrations::models::NewBatchedMigration;
use batched_migrations::orchestration::{MigrationQueuer, PgTableBoundsProbe};
use batched_migrations::state_machine::{JobState, MigrationState};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

fn new_migration(table_name: &str) -> NewBatchedMigration {
    NewBatchedMigration::new("CopyColumnJob", table_name, "id")
        .batch_class_name("PrimaryKeyBatchingStrategy")
        .bounds(1, 100)
        .batch_size(10)
        .sub_batch_size(5)
}

async fn create_events_table(pool: &PgPool, ids: &[i64]) -> sqlx::Result<()> {
    sqlx::query("CREATE TABLE events (id BIGINT PRIMARY KEY, payload TEXT)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO events (id) SELECT unnest($1::BIGINT[])")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_migration_round_trip(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);

    let mut migration = store
        .create_migration(new_migration("events").job_arguments(json!(["payload"])))
        .await
        .unwrap();
    assert_eq!(migration.status(), MigrationState::Paused);

    migration.execute(&store).await.unwrap();
    migration.set_batch_size(20);
    migration.save(&store).await.unwrap();

    let loaded = store.find_migration(migration.id).await.unwrap().unwrap();
    assert_eq!(loaded.status(), MigrationState::Active);
    assert_eq!(loaded.batch_size(), 20);
    assert!(loaded.started_at().is_some());
    assert_eq!(loaded.job_arguments, json!(["payload"]));

    let by_configuration = store
        .find_migration_by_configuration(&migration.configuration())
        .await
        .unwrap();
    assert_eq!(by_configuration.map(|m| m.id), Some(migration.id));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_duplicate_configuration_is_rejected(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);

    store.create_migration(new_migration("events")).await.unwrap();
    let err = store
        .create_migration(new_migration("events"))
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::DuplicateConfiguration(_)));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_job_lifecycle_and_counts(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);
    let migration = store
        .create_migration(new_migration("events").status(MigrationState::Active))
        .await
        .unwrap();

    let mut first = migration.create_batched_job(&store, 1, 10).await.unwrap();
    let mut second = migration.create_batched_job(&store, 11, 20).await.unwrap();
    first.run(&store).await.unwrap();
    first.succeed(&store).await.unwrap();
    second.run(&store).await.unwrap();
    second.fail(&store, "deadlock detected").await.unwrap();

    let counts = store.job_status_counts(migration.id, None).await.unwrap();
    assert_eq!((counts.succeeded, counts.failed, counts.pending), (1, 1, 0));

    assert_eq!(migration.next_min_value(&store).await.unwrap(), Some(21));
    assert_eq!(migration.migrated_tuple_count(&store).await.unwrap(), 10);

    let failed = store.find_job(second.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobState::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("deadlock detected"));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_guarded_writes_detect_lost_races(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);
    let migration = store
        .create_migration(new_migration("events").status(MigrationState::Active))
        .await
        .unwrap();

    let job = migration.create_batched_job(&store, 1, 10).await.unwrap();
    let mut first = job.clone();
    let mut second = job;
    first.run(&store).await.unwrap();
    assert!(second.run(&store).await.unwrap_err().is_conflict());
    assert_eq!(second.status, JobState::Pending);

    let mut stale = migration.clone();
    let mut operator = migration;
    operator.pause(&store).await.unwrap();
    stale
        .hold(&store, Utc::now() + ChronoDuration::minutes(5))
        .await
        .unwrap();

    let stored = store.find_migration(stale.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), MigrationState::Paused);
    assert!(stored.on_hold_until().is_some());

    assert!(stale.failure(&store).await.unwrap_err().is_conflict());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_next_executable_migration_skips_holds(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);
    let mut held = store
        .create_migration(new_migration("events").status(MigrationState::Active))
        .await
        .unwrap();
    let other = store
        .create_migration(new_migration("accounts").status(MigrationState::Active))
        .await
        .unwrap();

    let now = Utc::now();
    held.hold(&store, now + ChronoDuration::minutes(5)).await.unwrap();

    let picked = store
        .next_executable_migration("main", &[MigrationState::Active], now)
        .await
        .unwrap();
    assert_eq!(picked.map(|m| m.id), Some(other.id));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_lease_is_exclusive_until_expiry(pool: PgPool) -> sqlx::Result<()> {
    let store = PgMigrationStore::new(pool);
    let now = Utc::now();
    let ttl = Duration::from_secs(30);

    assert!(store.try_acquire_lease("batched_migration:main", "a", ttl, now).await.unwrap());
    assert!(!store.try_acquire_lease("batched_migration:main", "b", ttl, now).await.unwrap());
    assert!(store
        .try_acquire_lease("batched_migration:main", "b", ttl, now + ChronoDuration::seconds(31))
        .await
        .unwrap());

    store.release_lease("batched_migration:main", "b").await.unwrap();
    assert!(store.try_acquire_lease("batched_migration:main", "a", ttl, now).await.unwrap());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_primary_key_strategy_skips_gaps(pool: PgPool) -> sqlx::Result<()> {
    create_events_table(&pool, &[1, 2, 3, 50, 51, 52, 90]).await?;
    let strategy = PrimaryKeyBatchingStrategy::new(pool);
    let args = json!([]);

    let request = BatchRequest {
        table_name: "events",
        column_name: "id",
        batch_min_value: 3,
        batch_max_value: 100,
        batch_size: 3,
        job_arguments: &args,
    };
    assert_eq!(
        strategy.next_batch(&request).await.unwrap(),
        Some(BatchBounds {
            min_value: 3,
            max_value: 51
        })
    );

    let past_end = BatchRequest {
        batch_min_value: 91,
        ..request
    };
    assert_eq!(strategy.next_batch(&past_end).await.unwrap(), None);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_queue_computes_bounds_from_table(pool: PgPool) -> sqlx::Result<()> {
    create_events_table(&pool, &[4, 8, 15, 16, 23, 42]).await?;
    sqlx::query("CREATE TABLE empty_events (id BIGINT PRIMARY KEY)")
        .execute(&pool)
        .await?;

    let store = Arc::new(PgMigrationStore::new(pool.clone()));
    let queuer = MigrationQueuer::new(store, Arc::new(PgTableBoundsProbe::new(pool)));

    let queued = queuer
        .queue(NewBatchedMigration::new("CopyColumnJob", "events", "id"), None)
        .await
        .unwrap();
    assert_eq!((queued.min_value, queued.max_value), (1, 42));
    assert_eq!(queued.status(), MigrationState::Active);

    let empty = queuer
        .queue(NewBatchedMigration::new("CopyColumnJob", "empty_events", "id"), None)
        .await
        .unwrap();
    assert_eq!(empty.status(), MigrationState::Finished);
    assert_eq!(empty.min_value, empty.max_value);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_autovacuum_probe_reports_idle_tables(pool: PgPool) -> sqlx::Result<()> {
    create_events_table(&pool, &[1]).await?;
    let probe = PgAutovacuumProbe::new(pool);

    let vacuumed = probe
        .tables_being_vacuumed(&["events".to_string()])
        .await
        .unwrap();
    assert!(vacuumed.is_empty());
    Ok(())
}
