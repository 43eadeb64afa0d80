use serde::{Deserialize, Serialize};

/// Events that can trigger batched migration state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MigrationEvent {
    /// Operator pause
    Pause,
    /// Start or resume processing; also used by retry
    Execute,
    /// Mark the migration finished (guarded)
    Finish,
    /// Circuit breaker or unrecoverable failure
    Failure,
    /// Enter the synchronous drain path
    Finalize,
}

impl MigrationEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Execute => "execute",
            Self::Finish => "finish",
            Self::Failure => "failure",
            Self::Finalize => "finalize",
        }
    }
}

/// Events that can trigger batched job state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// Begin executing the job
    Run,
    /// Job completed every sub-batch
    Succeed,
    /// Job failed with an error message
    Fail(String),
    /// Make a failed job runnable again
    Retry,
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Retry => "retry",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
