//! # Batched Migrations CLI
//!
//! Runs the coordinator and worker pool, and exposes the operator controls
//! (pause, resume, retry, finalize, status) for individual migrations.
//!
//! Job classes are supplied by the embedding application; this binary only
//! registers the no-op job class, which makes it useful for dry runs and for
//! operating on migrations whose jobs run elsewhere.

use anyhow::Context;
use batched_migrations::config::ConfigManager;
use batched_migrations::execution::{JobClassRegistry, NoopJobClass};
use batched_migrations::logging::{init_structured_logging, log_migration_operation};
use batched_migrations::models::NewBatchedMigration;
use batched_migrations::orchestration::MigrationSystem;
use batched_migrations::services::MigrationStatusReport;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "batched-migrations")]
#[command(about = "Run and operate batched background migrations")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Environment override (default: BATCHED_MIGRATIONS_ENV, APP_ENV, development)
    #[arg(short, long)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator and worker pool until interrupted
    Run,

    /// Show one migration, or all of them
    Status {
        migration_id: Option<i64>,

        /// Restrict the listing to one schema
        #[arg(long)]
        schema: Option<String>,
    },

    /// Pause an active migration
    Pause { migration_id: i64 },

    /// Resume a paused or failed migration
    Resume { migration_id: i64 },

    /// Reset failed jobs and reactivate the migration
    Retry { migration_id: i64 },

    /// Drain the remaining range synchronously
    Finalize { migration_id: i64 },

    /// Queue a migration with bounds computed from the table
    Queue {
        #[arg(long)]
        job_class: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        /// JSON array of job arguments
        #[arg(long, default_value = "[]")]
        job_arguments: String,
        #[arg(long)]
        batch_size: Option<i32>,
        #[arg(long)]
        sub_batch_size: Option<i32>,
        #[arg(long)]
        batch_max_value: Option<i64>,
    },

    /// Load and validate configuration, then print it
    ConfigCheck,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(environment) = &cli.environment {
        std::env::set_var("BATCHED_MIGRATIONS_ENV", environment);
    }

    init_structured_logging();

    let config_manager = match &cli.config_dir {
        Some(dir) => ConfigManager::load_from_directory(Some(dir.clone())),
        None => ConfigManager::load(),
    }
    .context("failed to load configuration")?;

    if let Commands::ConfigCheck = cli.command {
        println!(
            "✅ Configuration valid for environment '{}'",
            config_manager.environment()
        );
        println!("{}", serde_json::to_string_pretty(config_manager.config())?);
        return Ok(());
    }

    let job_classes = Arc::new(JobClassRegistry::new());
    job_classes.register(Arc::new(NoopJobClass));

    let system = MigrationSystem::connect(config_manager, job_classes)
        .await
        .context("failed to connect to the database")?;
    let controls = &system.controls;

    match cli.command {
        Commands::Run => {
            let running = system.start().await?;
            info!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            running.shutdown().await;
        }
        Commands::Status {
            migration_id: Some(migration_id),
            ..
        } => print_reports(&[controls.status(migration_id).await?])?,
        Commands::Status {
            migration_id: None,
            schema,
        } => print_reports(&controls.list(schema.as_deref()).await?)?,
        Commands::Pause { migration_id } => {
            let migration = controls.pause(migration_id).await?;
            log_migration_operation("pause", migration.id, Some(&migration.job_class_name), &migration.status().to_string(), None);
        }
        Commands::Resume { migration_id } => {
            let migration = controls.resume(migration_id).await?;
            log_migration_operation("resume", migration.id, Some(&migration.job_class_name), &migration.status().to_string(), None);
        }
        Commands::Retry { migration_id } => {
            let (migration, reset) = controls.retry(migration_id).await?;
            let details = format!("{reset} failed jobs reset");
            log_migration_operation("retry", migration.id, Some(&migration.job_class_name), &migration.status().to_string(), Some(&details));
        }
        Commands::Finalize { migration_id } => {
            let migration = controls.finalize(migration_id).await?;
            log_migration_operation("finalize", migration.id, Some(&migration.job_class_name), &migration.status().to_string(), None);
        }
        Commands::Queue {
            job_class,
            table,
            column,
            job_arguments,
            batch_size,
            sub_batch_size,
            batch_max_value,
        } => {
            let job_arguments: Value =
                serde_json::from_str(&job_arguments).context("job arguments must be valid JSON")?;

            let mut new = NewBatchedMigration::with_defaults(
                &system.config_manager.config().defaults,
                job_class,
                table,
                column,
            )
            .job_arguments(job_arguments);
            if let Some(batch_size) = batch_size {
                new = new.batch_size(batch_size);
            }
            if let Some(sub_batch_size) = sub_batch_size {
                new = new.sub_batch_size(sub_batch_size);
            }

            let queuer = system
                .queuer(None)
                .context("queueing needs a database connection")?;
            let migration = queuer.queue(new, batch_max_value).await?;
            log_migration_operation("queue", migration.id, Some(&migration.job_class_name), &migration.status().to_string(), None);
        }
        Commands::ConfigCheck => {}
    }

    Ok(())
}

fn print_reports(reports: &[MigrationStatusReport]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(reports)?);
    Ok(())
}
