//! Warehouse connections
//!
//! The [`Warehouse`] trait is everything the executor and the test engine
//! need from a SQL warehouse: run a statement, run statements atomically and
//! read a count. [`WarehousePool`] bounds how many of those run at once.
//!
//! ## Features
//!
//! Enable warehouse support via Cargo features:
//! - `duckdb` - embedded DuckDB (bundled)
//! - `postgres` - PostgreSQL with optional TLS
//! - `all-warehouses` - All warehouse implementations
//!
//! [`MockWarehouse`] is always available for tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modelflow_warehouse::{DuckDbWarehouse, WarehousePool};
//!
//! let warehouse = DuckDbWarehouse::open("target/warehouse.duckdb")?;
//! let pool = WarehousePool::new(Arc::new(warehouse), 4);
//! let conn = pool.checkout().await?;
//! conn.execute("create schema if not exists staging").await?;
//! ```

pub mod adapter;
pub mod pool;
pub mod mock;
pub mod duckdb;
pub mod postgres;

pub use adapter::{Capabilities, Warehouse, WarehouseError};
pub use pool::{PooledConnection, WarehousePool};
pub use mock::MockWarehouse;
pub use self::duckdb::DuckDbWarehouse;
pub use postgres::{PostgresOptions, PostgresWarehouse};
