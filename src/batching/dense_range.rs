use super::{BatchBounds, BatchRequest, BatchingError, BatchingStrategy};
use async_trait::async_trait;

/// Arithmetic batching over a dense key space: `[min, min + batch_size - 1]`.
///
/// Never touches the table, so it suits tables without gaps and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseRangeBatchingStrategy;

#[async_trait]
impl BatchingStrategy for DenseRangeBatchingStrategy {
    fn name(&self) -> &'static str {
        "DenseRangeBatchingStrategy"
    }

    async fn next_batch(
        &self,
        request: &BatchRequest<'_>,
    ) -> Result<Option<BatchBounds>, BatchingError> {
        request.validate()?;
        if request.is_exhausted() {
            return Ok(None);
        }

        let max_value = request
            .batch_min_value
            .saturating_add(i64::from(request.batch_size) - 1)
            .min(request.batch_max_value);

        Ok(Some(BatchBounds {
            min_value: request.batch_min_value,
            max_value,
        }))
    }
}
