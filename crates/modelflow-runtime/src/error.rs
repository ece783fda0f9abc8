//! Execution errors

use modelflow_warehouse::WarehouseError;
use std::future::Future;
use std::time::Duration;

/// Errors raised while materializing a unit or evaluating a test
///
/// These never abort a run: they fail the affected unit (or test) and the
/// executor skips whatever depends on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Statement(#[from] WarehouseError),

    #[error("statement timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("could not check out a warehouse connection: {0}")]
    Pool(WarehouseError),
}

impl ExecutionError {
    /// Whether running the same statement again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Pool(e) | Self::Statement(e) => matches!(e, WarehouseError::ConnectionError(_)),
        }
    }
}

/// Await a warehouse call, failing with [`ExecutionError::Timeout`] after `limit`
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ExecutionError>
where
    F: Future<Output = Result<T, WarehouseError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ExecutionError::Timeout(limit))?
        .map_err(ExecutionError::from)
}
