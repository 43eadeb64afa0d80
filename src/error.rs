//! Error types for the batched migration orchestrator.
//!
//! Each layer owns a focused `thiserror` enum (state machine, configuration,
//! health indicators, batching strategies) and converts into
//! [`MigrationError`] at the crate boundary.

use crate::config::ConfigurationError;
use crate::state_machine::errors::{GuardError, StateMachineError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{entity} {id} was changed concurrently: {detail}")]
    Conflict {
        entity: &'static str,
        id: i64,
        detail: String,
    },
    #[error("A batched migration already exists for {0}")]
    DuplicateConfiguration(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Batching strategy error: {0}")]
    BatchingError(String),
    #[error("Unknown batching strategy: {0}")]
    UnknownBatchingStrategy(String),
    #[error("Unknown job class: {0}")]
    UnknownJobClass(String),
    #[error("Dispatch error: {0}")]
    DispatchError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(
        "Batched migration {job_class_name} could not be completed and a manual action is required. \
         Check the failed jobs of migration {migration_id} for more details."
    )]
    FailedToFinalize {
        migration_id: i64,
        job_class_name: String,
    },
}

impl MigrationError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        MigrationError::NotFound { entity, id }
    }

    pub fn conflict(entity: &'static str, id: i64, detail: impl Into<String>) -> Self {
        MigrationError::Conflict {
            entity,
            id,
            detail: detail.into(),
        }
    }

    /// True when a guarded write found the row in a different state than expected
    pub fn is_conflict(&self) -> bool {
        matches!(self, MigrationError::Conflict { .. })
    }

    /// True for errors raised because an operation was not allowed in the
    /// current state, as opposed to infrastructure failures.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, MigrationError::InvalidTransition(_))
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for MigrationError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        MigrationError::DatabaseError(format!("schema migration failed: {err}"))
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::ValidationError(format!("JSON serialization error: {err}"))
    }
}

impl From<ConfigurationError> for MigrationError {
    fn from(err: ConfigurationError) -> Self {
        MigrationError::ConfigurationError(err.to_string())
    }
}

impl From<StateMachineError> for MigrationError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::Store(inner) => inner,
            other => MigrationError::InvalidTransition(other.to_string()),
        }
    }
}

impl From<GuardError> for MigrationError {
    fn from(err: GuardError) -> Self {
        MigrationError::InvalidTransition(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
