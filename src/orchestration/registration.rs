//! # Migration Registration
//!
//! Queues a batched migration for a table, computing its key bounds from
//! the table itself. Registration is idempotent per configuration.

use crate::batching::{quote_identifier, BatchingError};
use crate::database::MigrationStore;
use crate::error::Result;
use crate::models::{BatchedMigration, NewBatchedMigration};
use crate::state_machine::MigrationState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

/// Key bounds and size estimate of a table column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub estimated_tuple_count: Option<i64>,
}

#[async_trait]
pub trait TableBoundsProbe: Send + Sync {
    async fn probe(&self, table_name: &str, column_name: &str) -> Result<TableStats>;
}

/// Reads bounds with `MIN`/`MAX` and the tuple estimate from `pg_class`
#[derive(Debug, Clone)]
pub struct PgTableBoundsProbe {
    pool: PgPool,
}

impl PgTableBoundsProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TableBoundsProbe for PgTableBoundsProbe {
    async fn probe(&self, table_name: &str, column_name: &str) -> Result<TableStats> {
        let table = quote_identifier(table_name)?;
        let column = quote_identifier(column_name)?;

        let (min_value, max_value): (Option<i64>, Option<i64>) = sqlx::query_as(&format!(
            "SELECT MIN({column})::BIGINT, MAX({column})::BIGINT FROM {table}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(BatchingError::from)?;

        let estimated_tuple_count: Option<i64> =
            sqlx::query_scalar("SELECT reltuples::BIGINT FROM pg_class WHERE oid = $1::regclass")
                .bind(&table)
                .fetch_optional(&self.pool)
                .await?;

        Ok(TableStats {
            min_value,
            max_value,
            estimated_tuple_count: estimated_tuple_count.filter(|count| *count >= 0),
        })
    }
}

pub struct MigrationQueuer {
    store: Arc<dyn MigrationStore>,
    probe: Arc<dyn TableBoundsProbe>,
}

impl MigrationQueuer {
    pub fn new(store: Arc<dyn MigrationStore>, probe: Arc<dyn TableBoundsProbe>) -> Self {
        Self { store, probe }
    }

    /// Queue `new`, starting at its `min_value`.
    ///
    /// `batch_max_value` defaults to the column's current maximum. An empty
    /// table yields a migration created `finished` with `max_value =
    /// min_value`; otherwise the migration starts `active`. An existing
    /// migration for the same configuration is returned unchanged.
    pub async fn queue(
        &self,
        new: NewBatchedMigration,
        batch_max_value: Option<i64>,
    ) -> Result<BatchedMigration> {
        let configuration = new.configuration();
        if let Some(existing) = self
            .store
            .find_migration_by_configuration(&configuration)
            .await?
        {
            info!(
                migration_id = existing.id,
                configuration = %configuration,
                "Batched background migration not enqueued because it already exists"
            );
            return Ok(existing);
        }

        let stats = self.probe.probe(&new.table_name, &new.column_name).await?;
        let batch_min_value = new.min_value;
        let batch_max_value = batch_max_value.or(stats.max_value);

        let new = match batch_max_value {
            Some(max_value) => new
                .bounds(batch_min_value, max_value.max(batch_min_value))
                .status(MigrationState::Active),
            None => new
                .bounds(batch_min_value, batch_min_value)
                .status(MigrationState::Finished),
        }
        .total_tuple_count(stats.estimated_tuple_count);

        let migration = self.store.create_migration(new).await?;

        info!(
            migration_id = migration.id,
            job_class_name = %migration.job_class_name,
            table_name = %migration.table_name,
            min_value = migration.min_value,
            max_value = migration.max_value,
            status = %migration.status(),
            "📥 Queued batched background migration"
        );

        Ok(migration)
    }
}

impl std::fmt::Debug for MigrationQueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationQueuer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryMigrationStore;

    struct FixedStats(TableStats);

    #[async_trait]
    impl TableBoundsProbe for FixedStats {
        async fn probe(&self, _table_name: &str, _column_name: &str) -> Result<TableStats> {
            Ok(self.0)
        }
    }

    fn queuer(store: Arc<InMemoryMigrationStore>, stats: TableStats) -> MigrationQueuer {
        MigrationQueuer::new(store, Arc::new(FixedStats(stats)))
    }

    #[tokio::test]
    async fn test_queue_uses_table_bounds() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let queuer = queuer(
            store,
            TableStats {
                min_value: Some(1),
                max_value: Some(5_000),
                estimated_tuple_count: Some(4_800),
            },
        );

        let migration = queuer
            .queue(NewBatchedMigration::new("CopyColumnJob", "events", "id"), None)
            .await
            .unwrap();

        assert_eq!((migration.min_value, migration.max_value), (1, 5_000));
        assert_eq!(migration.status(), MigrationState::Active);
        assert!(migration.started_at().is_some());
        assert_eq!(migration.total_tuple_count, Some(4_800));
    }

    #[tokio::test]
    async fn test_empty_table_is_created_finished() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let queuer = queuer(store, TableStats::default());

        let migration = queuer
            .queue(NewBatchedMigration::new("CopyColumnJob", "events", "id"), None)
            .await
            .unwrap();

        assert_eq!(migration.status(), MigrationState::Finished);
        assert_eq!(migration.min_value, migration.max_value);
    }

    #[tokio::test]
    async fn test_queue_is_idempotent() {
        let store = Arc::new(InMemoryMigrationStore::new());
        let queuer = queuer(
            store.clone(),
            TableStats {
                max_value: Some(10),
                ..TableStats::default()
            },
        );

        let first = queuer
            .queue(NewBatchedMigration::new("CopyColumnJob", "events", "id"), None)
            .await
            .unwrap();
        let second = queuer
            .queue(NewBatchedMigration::new("::CopyColumnJob", "events", "id"), Some(99))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_value, 10);
        assert_eq!(store.list_migrations(None).await.unwrap().len(), 1);
    }
}
