//! # Batching Strategies
//!
//! A batching strategy answers one question: starting from a cursor, which
//! contiguous key range should the next job cover? Strategies are resolved
//! by the migration's `batch_class_name` through a
//! [`BatchingStrategyRegistry`].
//!
//! Strategies must be free of side effects. Two calls with the same request
//! against the same table contents return the same bounds.

pub mod dense_range;
pub mod primary_key;

use crate::error::{MigrationError, Result};
use crate::models::BatchedMigration;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use dense_range::DenseRangeBatchingStrategy;
pub use primary_key::PrimaryKeyBatchingStrategy;

#[derive(Debug, Error)]
pub enum BatchingError {
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Invalid batch request: {0}")]
    InvalidRequest(String),

    #[error("Range query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl From<BatchingError> for MigrationError {
    fn from(err: BatchingError) -> Self {
        MigrationError::BatchingError(err.to_string())
    }
}

/// Input to [`BatchingStrategy::next_batch`]
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub table_name: &'a str,
    pub column_name: &'a str,
    /// First key the next batch may start at
    pub batch_min_value: i64,
    /// Upper bound of the migration's range
    pub batch_max_value: i64,
    pub batch_size: i32,
    pub job_arguments: &'a Value,
}

impl<'a> BatchRequest<'a> {
    pub fn for_migration(migration: &'a BatchedMigration, batch_min_value: i64) -> Self {
        Self {
            table_name: &migration.table_name,
            column_name: &migration.column_name,
            batch_min_value,
            batch_max_value: migration.max_value,
            batch_size: migration.batch_size(),
            job_arguments: &migration.job_arguments,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), BatchingError> {
        if self.batch_size < 1 {
            return Err(BatchingError::InvalidRequest(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }

    /// True once the cursor has moved past the migration's range
    pub fn is_exhausted(&self) -> bool {
        self.batch_min_value > self.batch_max_value
    }
}

/// Inclusive key range chosen for the next job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBounds {
    pub min_value: i64,
    pub max_value: i64,
}

impl BatchBounds {
    /// Cap the upper bound at `max_value`
    pub fn clamp_to(self, max_value: i64) -> Self {
        Self {
            min_value: self.min_value,
            max_value: self.max_value.min(max_value),
        }
    }
}

#[async_trait]
pub trait BatchingStrategy: Send + Sync {
    /// Name the strategy is registered under
    fn name(&self) -> &'static str;

    /// Next range at or after `request.batch_min_value`; `None` once no keys remain
    async fn next_batch(
        &self,
        request: &BatchRequest<'_>,
    ) -> std::result::Result<Option<BatchBounds>, BatchingError>;
}

/// Strategies keyed by `batch_class_name`
#[derive(Default)]
pub struct BatchingStrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn BatchingStrategy>>>,
}

impl BatchingStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies. The primary key strategy needs a pool.
    pub fn with_defaults(pool: Option<PgPool>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(DenseRangeBatchingStrategy));
        if let Some(pool) = pool {
            registry.register(Arc::new(PrimaryKeyBatchingStrategy::new(pool)));
        }
        registry
    }

    pub fn register(&self, strategy: Arc<dyn BatchingStrategy>) {
        debug!(strategy = strategy.name(), "Registering batching strategy");
        self.strategies
            .write()
            .insert(strategy.name().to_string(), strategy);
    }

    /// Register a strategy under an additional name
    pub fn register_as(&self, name: impl Into<String>, strategy: Arc<dyn BatchingStrategy>) {
        self.strategies.write().insert(name.into(), strategy);
    }

    pub fn resolve(&self, batch_class_name: &str) -> Result<Arc<dyn BatchingStrategy>> {
        let name = crate::models::normalize_class_name(batch_class_name);
        self.strategies
            .read()
            .get(&name)
            .cloned()
            .ok_or(MigrationError::UnknownBatchingStrategy(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BatchingStrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingStrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

/// Quote a possibly schema-qualified SQL identifier
pub(crate) fn quote_identifier(identifier: &str) -> std::result::Result<String, BatchingError> {
    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.is_empty() || parts.len() > 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(BatchingError::InvalidIdentifier(identifier.to_string()));
    }

    Ok(parts
        .iter()
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}
