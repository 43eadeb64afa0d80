use crate::health::{HealthContext, HealthIndicator, HealthIndicatorError, Signal};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

/// Reports which of the given tables an autovacuum worker is processing
#[async_trait]
pub trait AutovacuumProbe: Send + Sync {
    async fn tables_being_vacuumed(
        &self,
        tables: &[String],
    ) -> Result<Vec<String>, HealthIndicatorError>;
}

/// Probe over `pg_stat_progress_vacuum` joined to autovacuum backends.
///
/// Anti-wraparound vacuums are autovacuum workers too, so they are included.
#[derive(Debug, Clone)]
pub struct PgAutovacuumProbe {
    pool: PgPool,
}

impl PgAutovacuumProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Drop any schema qualifier
fn relation_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

#[async_trait]
impl AutovacuumProbe for PgAutovacuumProbe {
    async fn tables_being_vacuumed(
        &self,
        tables: &[String],
    ) -> Result<Vec<String>, HealthIndicatorError> {
        let relations: Vec<String> = tables
            .iter()
            .map(|table| relation_name(table).to_string())
            .collect();

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT c.relname::TEXT
             FROM pg_stat_progress_vacuum p
             JOIN pg_stat_activity a ON a.pid = p.pid
             JOIN pg_class c ON c.oid = p.relid
             WHERE a.backend_type = 'autovacuum worker'
               AND c.relname = ANY($1)",
        )
        .bind(&relations)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

/// Stops a migration while autovacuum is working on one of its tables
pub struct AutovacuumActiveOnTable {
    probe: Arc<dyn AutovacuumProbe>,
    enabled: bool,
}

impl AutovacuumActiveOnTable {
    pub fn new(probe: Arc<dyn AutovacuumProbe>, enabled: bool) -> Self {
        Self { probe, enabled }
    }
}

#[async_trait]
impl HealthIndicator for AutovacuumActiveOnTable {
    fn name(&self) -> &'static str {
        "autovacuum_active_on_table"
    }

    async fn evaluate(&self, context: &HealthContext) -> Result<Signal, HealthIndicatorError> {
        if !self.enabled {
            return Ok(Signal::normal(self.name()));
        }

        let vacuumed = self.probe.tables_being_vacuumed(&context.tables).await?;
        if vacuumed.is_empty() {
            return Ok(Signal::normal(self.name()));
        }

        Ok(Signal::stop(
            self.name(),
            format!("autovacuum running on: {}", vacuumed.join(", ")),
        ))
    }
}
