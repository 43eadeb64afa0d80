use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

/// Build a connection pool and optionally apply the bundled schema
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await?;

    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    info!(
        max_connections = config.max_connections,
        run_migrations = config.run_migrations,
        "Database pool ready"
    );

    Ok(pool)
}

/// Apply the `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<bool> {
    let row = sqlx::query("SELECT 1 AS health").fetch_one(pool).await?;
    let health: i32 = row.try_get("health")?;
    Ok(health == 1)
}
