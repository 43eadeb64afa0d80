//! # System Constants
//!
//! Default operational boundaries for the batched migration orchestrator.
//! Every value here is only a default: the effective thresholds reach the
//! coordinator through [`crate::config::MigrationsConfig`].

use std::time::Duration;

/// Circuit breaker defaults used by `should_stop`
pub mod circuit_breaker {
    /// Minimum number of run jobs before the failure ratio is considered
    pub const MINIMUM_JOBS: i64 = 50;
    /// Failure ratio above which a migration is failed
    pub const MAXIMUM_FAILED_RATIO: f64 = 0.5;
}

/// Batch size optimizer defaults
pub mod optimizer {
    pub const TARGET_EFFICIENCY_MIN: f64 = 0.9;
    pub const TARGET_EFFICIENCY_MAX: f64 = 0.95;
    pub const MIN_BATCH_SIZE: i32 = 1_000;
    pub const MAX_BATCH_SIZE: i32 = 2_000_000;
    pub const MAX_MULTIPLIER: f64 = 1.2;
    pub const NUMBER_OF_JOBS: usize = 20;
    pub const EMA_ALPHA: f64 = 0.4;
}

/// Per-migration defaults applied when a migration is registered
pub mod migration_defaults {
    pub const BATCH_SIZE: i32 = 1_000;
    pub const SUB_BATCH_SIZE: i32 = 100;
    pub const PAUSE_MS: i32 = 100;
    pub const INTERVAL_SECONDS: i32 = 120;
    pub const BATCH_MIN_VALUE: i64 = 1;
    pub const BATCH_CLASS_NAME: &str = "PrimaryKeyBatchingStrategy";
}

/// Default duration a migration is put on hold for
pub const DEFAULT_HOLD_DURATION: Duration = Duration::from_secs(10 * 60);

/// Tolerance applied to `interval_elapsed` by the coordinator
pub const INTERVAL_VARIANCE: Duration = Duration::from_secs(5);

/// Lease TTL is the migration interval multiplied by this value
pub const LEASE_TIMEOUT_MULTIPLIER: u32 = 3;

/// Name of the opentelemetry meter used for job metrics
pub const METER_NAME: &str = "batched_migrations";

/// Default schema (shard) identifier a coordinator serves
pub const DEFAULT_SCHEMA_NAME: &str = "main";
