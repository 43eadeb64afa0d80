//! # Migration System Bootstrap
//!
//! Wires store, registries, health indicators, runner and operator controls
//! from a [`ConfigManager`], and starts the coordinator loop together with
//! the worker pool that executes dispatched jobs.

use crate::batching::BatchingStrategyRegistry;
use crate::config::ConfigManager;
use crate::database::{connection, MigrationStore, PgMigrationStore};
use crate::error::Result;
use crate::execution::{JobClassRegistry, JobExecutor, JobHandler, WorkerPool};
use crate::health::{HealthStatus, PgAutovacuumProbe};
use crate::orchestration::coordinator::MigrationCoordinator;
use crate::orchestration::registration::{MigrationQueuer, PgTableBoundsProbe, TableBoundsProbe};
use crate::orchestration::runner::BatchedMigrationRunner;
use crate::services::MigrationControls;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Everything needed to run or operate on batched migrations
pub struct MigrationSystem {
    pub config_manager: Arc<ConfigManager>,
    pub store: Arc<dyn MigrationStore>,
    pub runner: Arc<BatchedMigrationRunner>,
    pub controls: MigrationControls,
    pool: Option<PgPool>,
}

impl MigrationSystem {
    /// Assemble a system over any store
    pub fn new(
        config_manager: Arc<ConfigManager>,
        store: Arc<dyn MigrationStore>,
        strategies: Arc<BatchingStrategyRegistry>,
        job_classes: Arc<JobClassRegistry>,
        health: HealthStatus,
    ) -> Self {
        let executor = JobExecutor::new(Arc::clone(&store), job_classes);
        let runner = Arc::new(BatchedMigrationRunner::new(
            Arc::clone(&store),
            strategies,
            executor,
            health,
            config_manager.config(),
        ));
        let controls = MigrationControls::new(Arc::clone(&store), Arc::clone(&runner));

        Self {
            config_manager,
            store,
            runner,
            controls,
            pool: None,
        }
    }

    /// Connect to Postgres and assemble the production wiring
    pub async fn connect(
        config_manager: Arc<ConfigManager>,
        job_classes: Arc<JobClassRegistry>,
    ) -> Result<Self> {
        let config = config_manager.config();
        let pool = connection::connect(&config.database).await?;

        let store: Arc<dyn MigrationStore> = Arc::new(PgMigrationStore::new(pool.clone()));
        let strategies = Arc::new(BatchingStrategyRegistry::with_defaults(Some(pool.clone())));
        let health = HealthStatus::from_config(
            &config.health,
            Arc::clone(&store),
            Some(Arc::new(PgAutovacuumProbe::new(pool.clone()))),
        );

        info!(
            environment = %config_manager.environment(),
            indicators = ?health.indicator_names(),
            strategies = ?strategies.names(),
            job_classes = ?job_classes.names(),
            "🏗️ Batched migration system assembled"
        );

        let mut system = Self::new(config_manager, store, strategies, job_classes, health);
        system.pool = Some(pool);
        Ok(system)
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Queuer probing tables with `probe`, or through the pool when connected
    pub fn queuer(&self, probe: Option<Arc<dyn TableBoundsProbe>>) -> Option<MigrationQueuer> {
        let probe = probe.or_else(|| {
            self.pool
                .clone()
                .map(|pool| Arc::new(PgTableBoundsProbe::new(pool)) as Arc<dyn TableBoundsProbe>)
        })?;
        Some(MigrationQueuer::new(Arc::clone(&self.store), probe))
    }

    /// Start the worker pool and the coordinator loop
    pub async fn start(&self) -> Result<RunningSystem> {
        let coordinator_config = &self.config_manager.config().coordinator;

        let handler: Arc<dyn JobHandler> = self.runner.clone();
        let worker_pool = WorkerPool::start(
            handler,
            coordinator_config.worker_count,
            coordinator_config.queue_capacity,
        );

        let coordinator = Arc::new(MigrationCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.runner),
            Arc::new(worker_pool.dispatcher()),
            self.config_manager.config(),
        ));
        let loop_handle = coordinator.start().await?;

        Ok(RunningSystem {
            coordinator,
            worker_pool,
            loop_handle,
        })
    }
}

impl std::fmt::Debug for MigrationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSystem")
            .field("environment", &self.config_manager.environment())
            .field("runner", &self.runner)
            .field("connected", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle over a started coordinator and worker pool
pub struct RunningSystem {
    coordinator: Arc<MigrationCoordinator>,
    worker_pool: WorkerPool,
    loop_handle: JoinHandle<()>,
}

impl RunningSystem {
    pub fn coordinator(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    /// Stop ticking, then drain in-flight jobs
    pub async fn shutdown(self) {
        self.coordinator.stop().await;
        if let Err(e) = self.loop_handle.await {
            error!(error = %e, "Coordinator loop ended abnormally");
        }
        self.worker_pool.shutdown().await;
        info!("✅ Batched migration system shut down");
    }
}
