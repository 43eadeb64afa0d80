#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batched Migrations
//!
//! Orchestrator for batched background migrations: large table mutations
//! (backfills, type conversions, data copies) sliced into small key ranges
//! that are executed incrementally, without long locks or unbounded
//! transactions.
//!
//! ## Overview
//!
//! A migration covers an inclusive key range of one table column. The
//! coordinator picks one migration per schema at a time, consults health
//! indicators, and creates the next job once the migration's interval has
//! elapsed. Workers execute jobs in sub-batches with a pause in between.
//! After each job the runner checks the failure-ratio circuit breaker,
//! retunes the batch size from measured efficiency and finishes the
//! migration once its range is covered.
//!
//! ## Module Organization
//!
//! - [`models`] - migrations, jobs and change tracking
//! - [`state_machine`] - migration and job lifecycles with guards
//! - [`database`] - the `MigrationStore` trait, Postgres and in-memory stores
//! - [`batching`] - pluggable strategies choosing the next key range
//! - [`health`] - health indicators and signal aggregation
//! - [`execution`] - job classes, the job executor and the worker pool
//! - [`orchestration`] - coordinator, runner, optimizer, registration
//! - [`services`] - operator controls
//! - [`config`] - layered TOML configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batched_migrations::config::ConfigManager;
//! use batched_migrations::execution::{JobClassRegistry, NoopJobClass};
//! use batched_migrations::orchestration::MigrationSystem;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config_manager = ConfigManager::load()?;
//!
//! let job_classes = Arc::new(JobClassRegistry::new());
//! job_classes.register(Arc::new(NoopJobClass));
//!
//! let system = MigrationSystem::connect(config_manager, job_classes).await?;
//! let running = system.start().await?;
//! // ...
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit and integration tests run against the in-memory store. Postgres
//! backed tests need `DATABASE_URL` and the `pg-integration` feature:
//!
//! ```bash
//! cargo test
//! cargo test --features pg-integration
//! ```

pub mod batching;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod execution;
pub mod health;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;

pub use config::{ConfigManager, MigrationsConfig};
pub use database::{InMemoryMigrationStore, MigrationStore, PgMigrationStore};
pub use error::{MigrationError, Result};
pub use models::{BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedMigration};
pub use orchestration::{
    BatchOptimizer, BatchedMigrationRunner, MigrationCoordinator, MigrationSystem, TickOutcome,
};
pub use state_machine::{JobState, MigrationState};
