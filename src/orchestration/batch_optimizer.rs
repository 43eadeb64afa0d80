//! # Batch Optimizer
//!
//! Retunes a migration's `batch_size` from the smoothed time efficiency of
//! its most recent successful jobs. Efficiency is job duration divided by
//! the migration interval, so a value below the target band means jobs
//! finish with time to spare and the batch can grow; above it, the batch
//! shrinks.

use crate::config::OptimizerConfig;
use crate::database::MigrationStore;
use crate::error::Result;
use crate::models::BatchedMigration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A batch size adjustment that was persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSizeChange {
    pub from: i32,
    pub to: i32,
    pub efficiency: f64,
}

#[derive(Debug, Clone)]
pub struct BatchOptimizer {
    config: OptimizerConfig,
}

impl BatchOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Adjust and save `migration.batch_size`. `None` when nothing changed.
    pub async fn optimize(
        &self,
        migration: &mut BatchedMigration,
        store: &dyn MigrationStore,
    ) -> Result<Option<BatchSizeChange>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let efficiency = migration
            .smoothed_time_efficiency(store, self.config.number_of_jobs, self.config.ema_alpha)
            .await?;

        let Some(efficiency) = efficiency else {
            debug!(
                migration_id = migration.id,
                number_of_jobs = self.config.number_of_jobs,
                "Not enough successful jobs to optimize batch size"
            );
            return Ok(None);
        };

        let from = migration.batch_size();
        let to = self.compute_new_batch_size(
            from,
            efficiency,
            migration.sub_batch_size,
            migration.max_batch_size,
        );

        if to == from {
            return Ok(None);
        }

        migration.set_batch_size(to);
        migration.save(store).await?;

        info!(
            migration_id = migration.id,
            job_class_name = %migration.job_class_name,
            efficiency = efficiency,
            old_batch_size = from,
            new_batch_size = to,
            "📐 Batch size optimized"
        );

        Ok(Some(BatchSizeChange {
            from,
            to,
            efficiency,
        }))
    }

    /// Batch size for a measured `efficiency`, clamped to the allowed range
    pub fn compute_new_batch_size(
        &self,
        batch_size: i32,
        efficiency: f64,
        sub_batch_size: i32,
        max_batch_size: Option<i32>,
    ) -> i32 {
        if !efficiency.is_finite() || efficiency <= 0.0 {
            return batch_size;
        }

        let target = self.config.target_efficiency_min..=self.config.target_efficiency_max;
        if target.contains(&efficiency) {
            return batch_size;
        }

        let multiplier = (self.config.target_efficiency_max / efficiency).min(self.config.max_multiplier);
        let proposed = (f64::from(batch_size) * multiplier).floor();

        let lower = self.config.min_batch_size.max(sub_batch_size).max(1);
        let upper = max_batch_size.unwrap_or(self.config.max_batch_size).max(lower);

        proposed.clamp(f64::from(lower), f64::from(upper)) as i32
    }
}

impl Default for BatchOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}
