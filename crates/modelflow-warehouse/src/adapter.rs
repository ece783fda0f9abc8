//! Warehouse trait the executor and test engine run statements through

use modelflow_core::RelationKind;

/// DDL behaviour the materialization plan depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `drop` and `alter ... rename` can run inside one transaction
    pub transactional_ddl: bool,

    /// `drop table ... cascade` is accepted
    pub drop_cascade: bool,
}

/// Errors that can occur when talking to a warehouse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection pool is closed")]
    PoolClosed,
}

/// A SQL warehouse
///
/// Implementations must be safe to call from several tasks at once; the
/// [`WarehousePool`](crate::WarehousePool) bounds how many calls are in flight.
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    /// Get the warehouse name (e.g., "DuckDB", "PostgreSQL")
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Run one statement, returning the number of rows it changed
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError>;

    /// Run statements atomically; nothing is applied if one fails
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), WarehouseError>;

    /// Run a query returning a single integer (`select count(*) ...`)
    async fn query_count(&self, sql: &str) -> Result<u64, WarehouseError>;

    /// Kind of the relation `schema.name`, `None` when it does not exist
    async fn relation_kind(&self, schema: &str, name: &str) -> Result<Option<RelationKind>, WarehouseError>;

    /// Test the connection to the warehouse
    ///
    /// This is useful for validating credentials before a run starts.
    async fn test_connection(&self) -> Result<(), WarehouseError>;

    /// Create a schema unless it already exists
    async fn ensure_schema(&self, schema: &str) -> Result<(), WarehouseError> {
        self.execute(&format!("create schema if not exists {}", schema))
            .await
            .map(|_| ())
    }
}

/// Map an `information_schema.tables.table_type` value
#[cfg_attr(not(any(feature = "duckdb", feature = "postgres")), allow(dead_code))]
pub(crate) fn relation_kind_from_table_type(table_type: &str) -> Result<RelationKind, WarehouseError> {
    match table_type.to_ascii_uppercase().as_str() {
        "BASE TABLE" | "LOCAL TEMPORARY" => Ok(RelationKind::Table),
        "VIEW" => Ok(RelationKind::View),
        other => Err(WarehouseError::InvalidResponse(format!("unsupported relation type '{}'", other))),
    }
}

/// Convert a count column to `u64`
pub(crate) fn non_negative(value: i64) -> Result<u64, WarehouseError> {
    u64::try_from(value)
        .map_err(|_| WarehouseError::InvalidResponse(format!("expected a non-negative count, got {}", value)))
}
