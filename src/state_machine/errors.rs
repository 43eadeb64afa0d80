use crate::error::MigrationError;
use thiserror::Error;

/// Error types for state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Store error: {0}")]
    Store(MigrationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Guard check could not read state: {0}")]
    Store(MigrationError),
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Store(inner) => Self::Store(inner),
            other => Self::GuardFailed {
                reason: other.to_string(),
            },
        }
    }
}

impl From<MigrationError> for StateMachineError {
    fn from(err: MigrationError) -> Self {
        Self::Store(err)
    }
}

impl From<MigrationError> for GuardError {
    fn from(err: MigrationError) -> Self {
        Self::Store(err)
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

/// Helper function to create business rule violations
pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}
