//! # Data Models
//!
//! - [`BatchedMigration`] - a table-wide key range processed over time
//! - [`BatchedJob`] - one contiguous slice of that range
//! - [`Tracked`] - per-attribute dirty tracking used by the migration model

pub mod batched_job;
pub mod batched_migration;
pub mod tracked;

pub use batched_job::{BatchedJob, NewBatchedJob, SubBatchRange};
pub use batched_migration::{
    normalize_class_name, smoothed_efficiency, BatchedMigration, MigrationConfiguration,
    MigrationLabels, NewBatchedMigration,
};
pub use tracked::Tracked;
