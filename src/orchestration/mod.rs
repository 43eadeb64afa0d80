//! # Orchestration
//!
//! - [`coordinator`] - periodic tick selecting the migration to progress
//! - [`runner`] - job execution follow-up, finalize and inline runs
//! - [`batch_optimizer`] - efficiency-driven batch size tuning
//! - [`registration`] - queueing migrations with bounds from the table
//! - [`bootstrap`] - wiring and lifecycle of a complete system

pub mod batch_optimizer;
pub mod bootstrap;
pub mod coordinator;
pub mod registration;
pub mod runner;

pub use batch_optimizer::{BatchOptimizer, BatchSizeChange};
pub use bootstrap::{MigrationSystem, RunningSystem};
pub use coordinator::{MigrationCoordinator, TickOutcome};
pub use registration::{MigrationQueuer, PgTableBoundsProbe, TableBoundsProbe, TableStats};
pub use runner::{BatchedMigrationRunner, RunOutcome};
