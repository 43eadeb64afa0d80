use serde::{Deserialize, Serialize};
use std::fmt;

/// Batched migration states, persisted as small integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Registered but not progressing (initial state, or operator pause)
    Paused,
    /// Eligible for the coordinator's queue-order pick
    Active,
    /// Every job succeeded; terminal
    Finished,
    /// Circuit breaker tripped; terminal until an operator retries
    Failed,
    /// Being drained synchronously, bypassing interval pacing
    Finalizing,
}

impl MigrationState {
    pub const ALL: [MigrationState; 5] = [
        Self::Paused,
        Self::Active,
        Self::Finished,
        Self::Failed,
        Self::Finalizing,
    ];

    /// Integer encoding stored in `batched_background_migrations.status`
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Paused => 0,
            Self::Active => 1,
            Self::Finished => 3,
            Self::Failed => 4,
            Self::Finalizing => 5,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Paused),
            1 => Some(Self::Active),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            5 => Some(Self::Finalizing),
            _ => None,
        }
    }

    /// Only `finished` never leaves; `failed` may be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Active or paused migrations are still waiting in the queue
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::Active => write!(f, "active"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

impl std::str::FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paused" => Ok(Self::Paused),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "finalizing" => Ok(Self::Finalizing),
            _ => Err(format!("Invalid migration state: {s}")),
        }
    }
}

impl Default for MigrationState {
    fn default() -> Self {
        Self::Paused
    }
}

/// Batched job states, persisted as small integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl JobState {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Failed => 2,
            Self::Succeeded => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Failed),
            3 => Some(Self::Succeeded),
            _ => None,
        }
    }

    /// Jobs that are queued or executing
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Jobs that have run to an outcome
    pub fn has_run(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Succeeded => write!(f, "succeeded"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}
