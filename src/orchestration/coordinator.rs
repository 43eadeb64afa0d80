//! # Migration Coordinator
//!
//! One scheduling tick picks the earliest active migration of a schema that
//! is not on hold, takes an exclusive lease for that schema, consults the
//! health indicators and, once the migration's interval has elapsed,
//! creates the next job and hands it to the worker queue.
//!
//! Concurrent coordinators serialize on the lease; the queue-order pick plus
//! the persisted status make sure only one migration per schema progresses
//! at a time.
//!
//! Pending jobs left behind by a retry are queued one at a time. A queued job
//! is remembered until its lease TTL passes, so it is not queued again while
//! it waits for a worker.

use crate::config::{CoordinatorConfig, HoldConfig, MigrationsConfig};
use crate::database::MigrationStore;
use crate::error::{MigrationError, Result};
use crate::execution::{JobDispatch, JobDispatcher};
use crate::models::BatchedMigration;
use crate::orchestration::runner::BatchedMigrationRunner;
use crate::state_machine::{JobState, MigrationState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What one coordinator tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    /// Coordinator turned off in configuration
    Disabled,
    /// No active migration outside its hold window
    NoMigration,
    /// Another coordinator holds the schema lease
    LeaseUnavailable { migration_id: i64 },
    /// A health indicator asked to stop; the migration was put on hold
    Held { migration_id: i64, reason: String },
    /// The last job was created less than an interval ago
    IntervalNotElapsed { migration_id: i64 },
    /// A job was handed to the worker queue
    Dispatched { migration_id: i64, job_id: i64 },
    /// The range is covered and the migration moved to `status`
    Completed {
        migration_id: i64,
        status: MigrationState,
    },
    /// The range is covered but jobs are still outstanding
    AwaitingJobs { migration_id: i64 },
}

pub struct MigrationCoordinator {
    id: Uuid,
    store: Arc<dyn MigrationStore>,
    runner: Arc<BatchedMigrationRunner>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: CoordinatorConfig,
    hold: HoldConfig,
    /// Pending jobs handed to the queue, keyed by job id, with the dispatch time
    queued_pending: DashMap<i64, DateTime<Utc>>,
    shutdown_notify: Arc<Notify>,
    running: Arc<RwLock<bool>>,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        runner: Arc<BatchedMigrationRunner>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: &MigrationsConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            runner,
            dispatcher,
            config: config.coordinator.clone(),
            hold: config.hold.clone(),
            queued_pending: DashMap::new(),
            shutdown_notify: Arc::new(Notify::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lease_key(&self) -> String {
        format!("batched_migration:{}", self.config.schema_name)
    }

    /// Lease lifetime: the migration interval times the configured multiplier
    pub fn lease_ttl(&self, migration: &BatchedMigration) -> Duration {
        let interval = u64::try_from(migration.interval).unwrap_or(0).max(1);
        Duration::from_secs(interval * u64::from(self.config.lease_timeout_multiplier.max(1)))
    }

    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduling step as of `now`
    #[instrument(skip(self), fields(coordinator_id = %self.id, schema = %self.config.schema_name))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if !self.config.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let store = self.store.as_ref();
        let Some(migration) = store
            .next_executable_migration(&self.config.schema_name, &[MigrationState::Active], now)
            .await?
        else {
            debug!("No executable batched migration");
            return Ok(TickOutcome::NoMigration);
        };

        let lease_key = self.lease_key();
        let owner = self.id.to_string();
        let acquired = store
            .try_acquire_lease(&lease_key, &owner, self.lease_ttl(&migration), now)
            .await?;

        if !acquired {
            debug!(migration_id = migration.id, lease_key = %lease_key, "Schema lease held elsewhere");
            return Ok(TickOutcome::LeaseUnavailable {
                migration_id: migration.id,
            });
        }

        let outcome = self.tick_with_lease(migration, now).await;

        if let Err(e) = store.release_lease(&lease_key, &owner).await {
            warn!(lease_key = %lease_key, error = %e, "Failed to release schema lease");
        }

        outcome
    }

    async fn tick_with_lease(
        &self,
        mut migration: BatchedMigration,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let store = self.store.as_ref();

        // Another coordinator may have changed it before we took the lease
        migration.reload(store).await?;
        if !migration.is_active() || migration.on_hold(now) {
            return Ok(TickOutcome::NoMigration);
        }

        let signal = self
            .runner
            .health()
            .evaluate_worst(&migration.health_context())
            .await;
        if signal.is_stop() {
            let hold = chrono::Duration::from_std(self.hold.default_hold())
                .map_err(|e| MigrationError::ValidationError(format!("invalid hold duration: {e}")))?;
            migration.hold(store, now + hold).await?;
            return Ok(TickOutcome::Held {
                migration_id: migration.id,
                reason: signal.reason().unwrap_or_default().to_string(),
            });
        }

        if !migration
            .interval_elapsed(store, now, self.config.interval_variance())
            .await?
        {
            return Ok(TickOutcome::IntervalNotElapsed {
                migration_id: migration.id,
            });
        }

        if let Some(bounds) = self.runner.next_batch_range(&migration).await? {
            let job = migration
                .create_batched_job(store, bounds.min_value, bounds.max_value)
                .await?;
            return self.dispatch(&migration, job.id).await;
        }

        // Pending jobs left over from a retry; one at a time
        let counts = store.job_status_counts(migration.id, None).await?;
        if counts.running == 0 {
            let pending = store
                .jobs_with_status(migration.id, &[JobState::Pending], Some(1))
                .await?;
            if let Some(job) = pending.first() {
                if self.is_queued(job.id, now, self.lease_ttl(&migration)) {
                    debug!(
                        migration_id = migration.id,
                        job_id = job.id,
                        "Pending job is already queued, waiting for a worker"
                    );
                } else {
                    let outcome = self.dispatch(&migration, job.id).await?;
                    self.queued_pending.insert(job.id, now);
                    return Ok(outcome);
                }
            }
        }

        let before = migration.status();
        let status = self.runner.finish_or_fail(&mut migration).await?;
        if status == before {
            Ok(TickOutcome::AwaitingJobs {
                migration_id: migration.id,
            })
        } else {
            Ok(TickOutcome::Completed {
                migration_id: migration.id,
                status,
            })
        }
    }

    /// Whether `job_id` was queued less than `redispatch_after` before `now`.
    ///
    /// Forgets dispatches older than that, so a job lost with its worker is
    /// queued again.
    fn is_queued(&self, job_id: i64, now: DateTime<Utc>, redispatch_after: Duration) -> bool {
        let redispatch_after =
            chrono::Duration::from_std(redispatch_after).unwrap_or_else(|_| chrono::Duration::zero());
        self.queued_pending
            .retain(|_, dispatched_at| *dispatched_at + redispatch_after > now);
        self.queued_pending.contains_key(&job_id)
    }

    async fn dispatch(&self, migration: &BatchedMigration, job_id: i64) -> Result<TickOutcome> {
        self.dispatcher
            .dispatch(JobDispatch {
                migration_id: migration.id,
                job_id,
            })
            .await?;

        debug!(
            migration_id = migration.id,
            job_id = job_id,
            batch_size = migration.batch_size(),
            "Dispatched batched job"
        );

        Ok(TickOutcome::Dispatched {
            migration_id: migration.id,
            job_id,
        })
    }

    /// Spawn the periodic tick loop
    #[instrument(skip(self), fields(coordinator_id = %self.id))]
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut running = self.running.write().await;
        if *running {
            return Err(MigrationError::InvalidState(
                "Coordinator is already running".to_string(),
            ));
        }
        *running = true;
        drop(running);

        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            schema = %self.config.schema_name,
            "🚀 COORDINATOR: Starting batched migration coordinator"
        );

        let coordinator = Arc::clone(self);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let tick_interval = self.config.tick_interval();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick_interval) => {
                        match coordinator.tick().await {
                            Ok(outcome) => debug!(outcome = ?outcome, "Coordinator tick"),
                            Err(e) => error!("Coordinator tick failed: {}", e),
                        }
                    }
                    _ = shutdown_notify.notified() => {
                        info!("Coordinator loop shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// Signal the tick loop to stop. An in-flight tick completes first.
    #[instrument(skip(self), fields(coordinator_id = %self.id))]
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            info!("COORDINATOR: Already stopped");
            return;
        }

        self.shutdown_notify.notify_one();
        *running = false;
        info!("🛑 COORDINATOR: Batched migration coordinator stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
