use super::{quote_identifier, BatchBounds, BatchRequest, BatchingError, BatchingStrategy};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

/// Ordered scan over the batching column.
///
/// The next batch spans the first `batch_size` existing keys at or after the
/// cursor, so gaps in the key space do not produce empty jobs.
#[derive(Debug, Clone)]
pub struct PrimaryKeyBatchingStrategy {
    pool: PgPool,
}

impl PrimaryKeyBatchingStrategy {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn range_query(request: &BatchRequest<'_>) -> Result<String, BatchingError> {
        let table = quote_identifier(request.table_name)?;
        let column = quote_identifier(request.column_name)?;

        Ok(format!(
            "SELECT MIN(batch_key)::BIGINT, MAX(batch_key)::BIGINT FROM (
                 SELECT {column} AS batch_key FROM {table}
                 WHERE {column} >= $1 AND {column} <= $2
                 ORDER BY {column}
                 LIMIT $3
             ) AS next_batch"
        ))
    }
}

#[async_trait]
impl BatchingStrategy for PrimaryKeyBatchingStrategy {
    fn name(&self) -> &'static str {
        "PrimaryKeyBatchingStrategy"
    }

    async fn next_batch(
        &self,
        request: &BatchRequest<'_>,
    ) -> Result<Option<BatchBounds>, BatchingError> {
        request.validate()?;
        if request.is_exhausted() {
            return Ok(None);
        }

        let query = Self::range_query(request)?;
        let (min_value, max_value): (Option<i64>, Option<i64>) = sqlx::query_as(&query)
            .bind(request.batch_min_value)
            .bind(request.batch_max_value)
            .bind(i64::from(request.batch_size))
            .fetch_one(&self.pool)
            .await?;

        debug!(
            table_name = request.table_name,
            column_name = request.column_name,
            batch_min_value = request.batch_min_value,
            ?min_value,
            ?max_value,
            "Scanned next batch range"
        );

        Ok(min_value
            .zip(max_value)
            .map(|(min_value, max_value)| BatchBounds { min_value, max_value }))
    }
}
