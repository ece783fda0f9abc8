//! DuckDB warehouse
//!
//! Runs statements on an embedded DuckDB database, in memory or backed by a
//! file. DuckDB calls are blocking, so each one runs on tokio's blocking pool.
//! Dropping the future of a call (a statement timeout, for example)
//! interrupts the statement if it is running and cancels it if it has not
//! started yet.
//!
//! ```rust,ignore
//! let warehouse = DuckDbWarehouse::open_in_memory()?;
//! let warehouse = DuckDbWarehouse::open("target/warehouse.duckdb")?;
//! ```

use crate::adapter::{Capabilities, Warehouse, WarehouseError};
use std::path::Path;

#[cfg(feature = "duckdb")]
use crate::adapter::{non_negative, relation_kind_from_table_type};

#[cfg(feature = "duckdb")]
use ::duckdb::{params, Connection, InterruptHandle, OptionalExt};

use modelflow_core::RelationKind;

#[cfg(feature = "duckdb")]
use std::sync::{Arc, Mutex};

/// DuckDB warehouse
pub struct DuckDbWarehouse {
    #[cfg(feature = "duckdb")]
    connection: Arc<Mutex<Connection>>,

    #[cfg(feature = "duckdb")]
    interrupt: Arc<InterruptHandle>,

    /// Database file, `None` when in memory
    path: Option<String>,
}

impl DuckDbWarehouse {
    /// Open a private in-memory database
    #[cfg(feature = "duckdb")]
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let connection = Connection::open_in_memory()
            .map_err(|e| WarehouseError::ConnectionError(format!("Failed to open DuckDB: {}", e)))?;

        Ok(Self {
            interrupt: connection.interrupt_handle(),
            connection: Arc::new(Mutex::new(connection)),
            path: None,
        })
    }

    /// Open (or create) a database file
    #[cfg(feature = "duckdb")]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WarehouseError::ConfigError(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let connection = Connection::open(path).map_err(|e| {
            WarehouseError::ConnectionError(format!("Failed to open DuckDB at {}: {}", path.display(), e))
        })?;

        Ok(Self {
            interrupt: connection.interrupt_handle(),
            connection: Arc::new(Mutex::new(connection)),
            path: Some(path.display().to_string()),
        })
    }

    /// Create warehouse without duckdb feature (returns error)
    #[cfg(not(feature = "duckdb"))]
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        Err(WarehouseError::ConfigError(
            "DuckDB support not compiled. Rebuild with: cargo build --features duckdb".to_string(),
        ))
    }

    /// Create warehouse without duckdb feature (returns error)
    #[cfg(not(feature = "duckdb"))]
    pub fn open(_path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        Err(WarehouseError::ConfigError(
            "DuckDB support not compiled. Rebuild with: cargo build --features duckdb".to_string(),
        ))
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Run `f` with the connection on the blocking pool
    #[cfg(feature = "duckdb")]
    async fn with_connection<T, F>(&self, f: F) -> Result<T, WarehouseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WarehouseError> + Send + 'static,
    {
        let connection = self.connection.clone();
        let call = Arc::new(Mutex::new(CallState::Queued));
        let _interrupt = InterruptOnDrop {
            call: call.clone(),
            handle: self.interrupt.clone(),
        };

        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| WarehouseError::ConnectionError("DuckDB connection lock poisoned".to_string()))?;

            if !call.transition(CallState::Queued, CallState::Running)? {
                return Err(WarehouseError::QueryError("call abandoned before it started".to_string()));
            }
            let result = f(&mut guard);
            call.transition(CallState::Running, CallState::Finished)?;
            result
        })
        .await
        .map_err(|e| WarehouseError::QueryError(format!("DuckDB task failed: {}", e)))?
    }
}

/// Progress of one blocking call
#[cfg(feature = "duckdb")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

#[cfg(feature = "duckdb")]
trait Transition {
    /// Move from `from` to `to`; `false` when the call is in another state
    fn transition(&self, from: CallState, to: CallState) -> Result<bool, WarehouseError>;
}

#[cfg(feature = "duckdb")]
impl Transition for Mutex<CallState> {
    fn transition(&self, from: CallState, to: CallState) -> Result<bool, WarehouseError> {
        let mut state = self
            .lock()
            .map_err(|_| WarehouseError::ConnectionError("DuckDB call state poisoned".to_string()))?;
        if *state != from {
            return Ok(false);
        }
        *state = to;
        Ok(true)
    }
}

/// Interrupts or abandons the call when its future is dropped unfinished
///
/// The state lock is held across `interrupt()`, and the blocking task needs
/// it to finish, so the interrupt can only hit this call's statement.
#[cfg(feature = "duckdb")]
struct InterruptOnDrop {
    call: Arc<Mutex<CallState>>,
    handle: Arc<InterruptHandle>,
}

#[cfg(feature = "duckdb")]
impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let Ok(mut state) = self.call.lock() else {
            return;
        };
        match *state {
            CallState::Queued => *state = CallState::Abandoned,
            CallState::Running => {
                tracing::warn!("Interrupting DuckDB statement");
                self.handle.interrupt();
            }
            CallState::Finished | CallState::Abandoned => {}
        }
    }
}

#[cfg(feature = "duckdb")]
fn query_error(e: ::duckdb::Error) -> WarehouseError {
    WarehouseError::QueryError(e.to_string())
}

#[async_trait::async_trait]
impl Warehouse for DuckDbWarehouse {
    fn name(&self) -> &'static str {
        "DuckDB"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional_ddl: true,
            drop_cascade: false,
        }
    }

    #[cfg(feature = "duckdb")]
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(&sql, params![]).map_err(query_error)?;
            Ok(changed as u64)
        })
        .await
    }

    #[cfg(feature = "duckdb")]
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), WarehouseError> {
        let statements = statements.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction().map_err(query_error)?;
            for statement in &statements {
                // Dropping `tx` on error rolls back
                tx.execute(statement, params![]).map_err(query_error)?;
            }
            tx.commit().map_err(query_error)
        })
        .await
    }

    #[cfg(feature = "duckdb")]
    async fn query_count(&self, sql: &str) -> Result<u64, WarehouseError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let count: i64 = conn.query_row(&sql, params![], |row| row.get(0)).map_err(query_error)?;
            non_negative(count)
        })
        .await
    }

    #[cfg(feature = "duckdb")]
    async fn relation_kind(&self, schema: &str, name: &str) -> Result<Option<RelationKind>, WarehouseError> {
        let (schema, name) = (schema.to_string(), name.to_string());
        self.with_connection(move |conn| {
            let table_type: Option<String> = conn
                .query_row(
                    "select table_type from information_schema.tables \
                     where table_catalog = current_database() and table_schema = ? and table_name = ?",
                    params![schema, name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(query_error)?;
            table_type.as_deref().map(relation_kind_from_table_type).transpose()
        })
        .await
    }

    #[cfg(feature = "duckdb")]
    async fn test_connection(&self) -> Result<(), WarehouseError> {
        self.query_count("select 1::bigint").await.map(|_| ())
    }

    #[cfg(not(feature = "duckdb"))]
    async fn execute(&self, _sql: &str) -> Result<u64, WarehouseError> {
        Err(WarehouseError::ConfigError("DuckDB support not compiled".to_string()))
    }

    #[cfg(not(feature = "duckdb"))]
    async fn execute_transaction(&self, _statements: &[String]) -> Result<(), WarehouseError> {
        Err(WarehouseError::ConfigError("DuckDB support not compiled".to_string()))
    }

    #[cfg(not(feature = "duckdb"))]
    async fn query_count(&self, _sql: &str) -> Result<u64, WarehouseError> {
        Err(WarehouseError::ConfigError("DuckDB support not compiled".to_string()))
    }

    #[cfg(not(feature = "duckdb"))]
    async fn relation_kind(&self, _schema: &str, _name: &str) -> Result<Option<RelationKind>, WarehouseError> {
        Err(WarehouseError::ConfigError("DuckDB support not compiled".to_string()))
    }

    #[cfg(not(feature = "duckdb"))]
    async fn test_connection(&self) -> Result<(), WarehouseError> {
        Err(WarehouseError::ConfigError("DuckDB support not compiled".to_string()))
    }
}

#[cfg(all(test, feature = "duckdb"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn execute_and_count() {
        let warehouse = DuckDbWarehouse::open_in_memory().unwrap();
        warehouse.test_connection().await.unwrap();

        warehouse.ensure_schema("staging").await.unwrap();
        warehouse
            .execute("create table staging.orders as select * from range(5) t(id)")
            .await
            .unwrap();

        assert_eq!(warehouse.query_count("select count(*) from staging.orders").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_nothing_applied() {
        let warehouse = DuckDbWarehouse::open_in_memory().unwrap();
        warehouse.execute("create table t as select 1 as id").await.unwrap();

        let result = warehouse
            .execute_transaction(&["drop table t".to_string(), "select * from missing_table".to_string()])
            .await;
        assert!(result.is_err());

        // The drop was rolled back
        assert_eq!(warehouse.query_count("select count(*) from t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn relation_kinds() {
        let warehouse = DuckDbWarehouse::open_in_memory().unwrap();
        warehouse.ensure_schema("staging").await.unwrap();
        warehouse.execute("create table staging.t as select 1 as id").await.unwrap();
        warehouse.execute("create view staging.v as select * from staging.t").await.unwrap();

        assert_eq!(warehouse.relation_kind("staging", "t").await.unwrap(), Some(RelationKind::Table));
        assert_eq!(warehouse.relation_kind("staging", "v").await.unwrap(), Some(RelationKind::View));
        assert_eq!(warehouse.relation_kind("staging", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn timed_out_statement_is_interrupted() {
        let warehouse = DuckDbWarehouse::open_in_memory().unwrap();

        let slow = tokio::time::timeout(
            Duration::from_millis(200),
            warehouse.query_count("select sum(range % 7)::bigint from range(1000000000000)"),
        )
        .await;
        assert!(slow.is_err());

        // The connection is released instead of finishing the scan
        let next = tokio::time::timeout(Duration::from_secs(10), warehouse.query_count("select 1::bigint")).await;
        assert_eq!(next.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn query_errors_are_reported() {
        let warehouse = DuckDbWarehouse::open_in_memory().unwrap();
        let err = warehouse.execute("select * from nowhere").await.unwrap_err();
        assert!(matches!(err, WarehouseError::QueryError(_)));
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("warehouse.duckdb");

        {
            let warehouse = DuckDbWarehouse::open(&path).unwrap();
            warehouse.execute("create table t as select 42::bigint as answer").await.unwrap();
        }

        let warehouse = DuckDbWarehouse::open(&path).unwrap();
        assert_eq!(warehouse.path(), Some(path.display().to_string().as_str()));
        assert_eq!(warehouse.query_count("select answer from t").await.unwrap(), 42);
    }
}
