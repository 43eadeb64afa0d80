//! # Services
//!
//! Thin operator-facing layer over the orchestration core.

pub mod migration_controls;

pub use migration_controls::{MigrationControls, MigrationStatusReport};
