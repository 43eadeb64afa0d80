//! In-memory [`MigrationStore`].
//!
//! Rows live behind a single `parking_lot::RwLock`, so every trait call is
//! atomic with respect to the others. Leases are kept in a `DashMap`.

use super::{JobStatusCounts, MigrationStore};
use crate::error::{MigrationError, Result};
use crate::models::{
    BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration, Tracked,
};
use crate::state_machine::{JobState, MigrationState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    migrations: BTreeMap<i64, BatchedMigration>,
    jobs: BTreeMap<i64, BatchedJob>,
    next_migration_id: i64,
    next_job_id: i64,
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    tables: RwLock<Tables>,
    leases: DashMap<String, Lease>,
    fail_next_migration_save: AtomicBool,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored job in place, bypassing the state machine.
    ///
    /// Lets tests backdate timestamps or plant statuses.
    pub fn update_job_with<F>(&self, id: i64, f: F) -> Result<BatchedJob>
    where
        F: FnOnce(&mut BatchedJob),
    {
        let mut tables = self.tables.write();
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MigrationError::not_found("BatchedJob", id))?;
        f(job);
        Ok(job.clone())
    }

    /// Make the next `save_migration` call fail with a database error
    pub fn fail_next_migration_save(&self) {
        self.fail_next_migration_save.store(true, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.tables.read().jobs.len()
    }

    fn jobs_of(tables: &Tables, migration_id: i64) -> impl Iterator<Item = &BatchedJob> {
        tables
            .jobs
            .values()
            .filter(move |job| job.batched_migration_id == migration_id)
    }

    fn recent_jobs_in(
        &self,
        migration_id: i64,
        statuses: &[JobState],
        limit: usize,
    ) -> Vec<BatchedJob> {
        let tables = self.tables.read();
        let mut jobs: Vec<BatchedJob> = Self::jobs_of(&tables, migration_id)
            .filter(|job| statuses.contains(&job.status) && job.finished_at.is_some())
            .cloned()
            .collect();

        jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        jobs
    }
}

/// Overwrite a stored column only when the caller changed it
fn copy_if_changed<T: Clone + PartialEq>(stored: &mut Tracked<T>, tracked: &Tracked<T>) {
    if tracked.is_changed() {
        *stored = Tracked::new(tracked.get().clone());
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn create_migration(&self, new: NewBatchedMigration) -> Result<BatchedMigration> {
        new.validate()?;
        let configuration = new.configuration();

        let mut tables = self.tables.write();
        if tables
            .migrations
            .values()
            .any(|existing| existing.configuration() == configuration)
        {
            return Err(MigrationError::DuplicateConfiguration(configuration.to_string()));
        }

        tables.next_migration_id += 1;
        let id = tables.next_migration_id;
        let migration = BatchedMigration::from_new(id, new, Utc::now());
        tables.migrations.insert(id, migration.clone());

        Ok(migration)
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        Ok(self.tables.read().migrations.get(&id).cloned())
    }

    async fn find_migration_by_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>> {
        Ok(self
            .tables
            .read()
            .migrations
            .values()
            .find(|migration| migration.configuration() == *configuration)
            .cloned())
    }

    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()> {
        if self.fail_next_migration_save.swap(false, Ordering::SeqCst) {
            return Err(MigrationError::DatabaseError(format!(
                "simulated write failure for {migration}"
            )));
        }

        let mut tables = self.tables.write();
        let stored = tables
            .migrations
            .get_mut(&migration.id)
            .ok_or_else(|| MigrationError::not_found("BatchedMigration", migration.id))?;

        if let Some((was, to)) = migration.tracked_status().change() {
            if stored.status() != *was {
                return Err(MigrationError::conflict(
                    "BatchedMigration",
                    migration.id,
                    format!("expected status {was} before moving to {to}, found {}", stored.status()),
                ));
            }
        }

        copy_if_changed(&mut stored.status, &migration.status);
        copy_if_changed(&mut stored.batch_size, &migration.batch_size);
        copy_if_changed(&mut stored.started_at, &migration.started_at);
        copy_if_changed(&mut stored.on_hold_until, &migration.on_hold_until);
        stored.updated_at = migration.updated_at;
        Ok(())
    }

    async fn list_migrations(&self, schema_name: Option<&str>) -> Result<Vec<BatchedMigration>> {
        Ok(self
            .tables
            .read()
            .migrations
            .values()
            .filter(|migration| schema_name.map_or(true, |schema| migration.schema_name == schema))
            .cloned()
            .collect())
    }

    async fn next_executable_migration(
        &self,
        schema_name: &str,
        statuses: &[MigrationState],
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        Ok(self
            .tables
            .read()
            .migrations
            .values()
            .find(|migration| {
                migration.schema_name == schema_name
                    && statuses.contains(&migration.status())
                    && !migration.on_hold(now)
            })
            .cloned())
    }

    async fn create_job(&self, new: NewBatchedJob) -> Result<BatchedJob> {
        let mut tables = self.tables.write();
        if !tables.migrations.contains_key(&new.batched_migration_id) {
            return Err(MigrationError::not_found(
                "BatchedMigration",
                new.batched_migration_id,
            ));
        }

        tables.next_job_id += 1;
        let now = Utc::now();
        let job = BatchedJob {
            id: tables.next_job_id,
            batched_migration_id: new.batched_migration_id,
            min_value: new.min_value,
            max_value: new.max_value,
            batch_size: new.batch_size,
            sub_batch_size: new.sub_batch_size,
            pause_ms: new.pause_ms,
            attempts: 0,
            status: JobState::Pending,
            started_at: None,
            finished_at: None,
            metrics: json!({}),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        tables.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn save_job(&self, job: &BatchedJob, expected_status: JobState) -> Result<()> {
        let mut tables = self.tables.write();
        let stored = tables
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| MigrationError::not_found("BatchedJob", job.id))?;

        if stored.status != expected_status {
            return Err(MigrationError::conflict(
                "BatchedJob",
                job.id,
                format!("expected status {expected_status}, found {}", stored.status),
            ));
        }

        *stored = job.clone();
        Ok(())
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        let tables = self.tables.read();
        Ok(Self::jobs_of(&tables, migration_id)
            .max_by_key(|job| (job.max_value, job.id))
            .cloned())
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        let tables = self.tables.read();
        let mut jobs: Vec<BatchedJob> = Self::jobs_of(&tables, migration_id).cloned().collect();
        jobs.sort_by_key(|job| (job.min_value, job.id));
        Ok(jobs)
    }

    async fn jobs_with_status(
        &self,
        migration_id: i64,
        statuses: &[JobState],
        limit: Option<i64>,
    ) -> Result<Vec<BatchedJob>> {
        let tables = self.tables.read();
        let limit = limit.map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(0));

        Ok(Self::jobs_of(&tables, migration_id)
            .filter(|job| statuses.contains(&job.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn job_status_counts(
        &self,
        migration_id: i64,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<JobStatusCounts> {
        let tables = self.tables.read();
        let mut counts = JobStatusCounts::default();

        Self::jobs_of(&tables, migration_id)
            .filter(|job| created_since.map_or(true, |since| job.created_at >= since))
            .for_each(|job| counts.record(job.status, 1));

        Ok(counts)
    }

    async fn recent_successful_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>> {
        Ok(self.recent_jobs_in(migration_id, &[JobState::Succeeded], limit))
    }

    async fn recent_finished_jobs(&self, migration_id: i64, limit: usize) -> Result<Vec<BatchedJob>> {
        Ok(self.recent_jobs_in(
            migration_id,
            &[JobState::Succeeded, JobState::Failed],
            limit,
        ))
    }

    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let tables = self.tables.read();
        let mut counts = HashMap::new();

        for job in tables.jobs.values() {
            if job.status == JobState::Succeeded && migration_ids.contains(&job.batched_migration_id) {
                *counts.entry(job.batched_migration_id).or_insert(0) += i64::from(job.batch_size);
            }
        }

        Ok(counts)
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MigrationError::ValidationError(format!("invalid lease ttl: {e}")))?;
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };

        let mut entry = self.leases.entry(key.to_string()).or_insert_with(|| lease.clone());
        if entry.owner == owner || entry.expires_at <= now {
            *entry = lease;
            return Ok(true);
        }

        Ok(false)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()> {
        self.leases.remove_if(key, |_, lease| lease.owner == owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_migration(table: &str) -> NewBatchedMigration {
        NewBatchedMigration::new("CopyColumnJob", table, "id").bounds(1, 100)
    }

    #[tokio::test]
    async fn test_duplicate_configuration_is_rejected() {
        let store = InMemoryMigrationStore::new();
        store.create_migration(new_migration("events")).await.unwrap();

        let err = store.create_migration(new_migration("events")).await.unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateConfiguration(_)));

        store.create_migration(new_migration("projects")).await.unwrap();
    }

    #[tokio::test]
    async fn test_leases_exclude_other_owners_until_expiry() {
        let store = InMemoryMigrationStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("main", "a", ttl, now).await.unwrap());
        assert!(store.try_acquire_lease("main", "a", ttl, now).await.unwrap());
        assert!(!store.try_acquire_lease("main", "b", ttl, now).await.unwrap());

        let later = now + chrono::Duration::seconds(61);
        assert!(store.try_acquire_lease("main", "b", ttl, later).await.unwrap());

        store.release_lease("main", "a").await.unwrap();
        assert!(!store.try_acquire_lease("main", "a", ttl, later).await.unwrap());
        store.release_lease("main", "b").await.unwrap();
        assert!(store.try_acquire_lease("main", "a", ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_job_can_only_be_claimed_once() {
        let store = InMemoryMigrationStore::new();
        let migration = store.create_migration(new_migration("events")).await.unwrap();
        let pending = migration.create_batched_job(&store, 1, 10).await.unwrap();

        let mut first = pending.clone();
        let mut second = pending;
        first.run(&store).await.unwrap();

        let err = second.run(&store).await.unwrap_err();
        assert!(err.is_conflict(), "unexpected error {err:?}");
        assert_eq!(second.status, JobState::Pending);
        assert_eq!(second.attempts, 0);

        let stored = store.find_job(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Running);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_save_migration_keeps_untouched_columns() {
        let store = InMemoryMigrationStore::new();
        let created = store
            .create_migration(new_migration("events").status(MigrationState::Active))
            .await
            .unwrap();

        let mut stale = created.clone();
        let mut operator = created;
        operator.pause(&store).await.unwrap();

        stale.set_batch_size(250);
        stale.save(&store).await.unwrap();

        let stored = store.find_migration(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), MigrationState::Paused);
        assert_eq!(stored.batch_size(), 250);
    }

    #[tokio::test]
    async fn test_stale_status_change_conflicts() {
        let store = InMemoryMigrationStore::new();
        let created = store
            .create_migration(new_migration("events").status(MigrationState::Active))
            .await
            .unwrap();

        let mut stale = created.clone();
        let mut operator = created;
        operator.pause(&store).await.unwrap();

        let err = stale.failure(&store).await.unwrap_err();
        assert!(err.is_conflict(), "unexpected error {err:?}");
        assert_eq!(stale.status(), MigrationState::Active);
        assert!(!stale.has_changes());

        let stored = store.find_migration(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), MigrationState::Paused);
    }

    #[tokio::test]
    async fn test_last_job_is_highest_max_value() {
        let store = InMemoryMigrationStore::new();
        let migration = store.create_migration(new_migration("events")).await.unwrap();

        for (min_value, max_value) in [(11, 20), (1, 10)] {
            store
                .create_job(NewBatchedJob {
                    batched_migration_id: migration.id,
                    min_value,
                    max_value,
                    batch_size: 10,
                    sub_batch_size: 5,
                    pause_ms: 0,
                })
                .await
                .unwrap();
        }

        let last = store.last_job(migration.id).await.unwrap().unwrap();
        assert_eq!(last.max_value, 20);

        let ordered = store.jobs_for_migration(migration.id).await.unwrap();
        assert_eq!(ordered[0].min_value, 1);
    }
}
