//! PostgreSQL warehouse
//!
//! Runs statements over a small set of tokio-postgres connections. It works
//! with PostgreSQL and compatible databases that support transactional DDL.
//!
//! ## Authentication
//!
//! 1. Direct password authentication
//! 2. Connection string (PostgreSQL keyword/value format)
//! 3. TLS/SSL connections via native-tls
//!
//! ## Usage
//!
//! ```rust,ignore
//! let options = PostgresOptions::new("localhost", "analytics", "modelflow").password("secret");
//! let warehouse = PostgresWarehouse::connect(&options).await?;
//!
//! let warehouse = PostgresWarehouse::from_connection_string(
//!     "host=localhost port=5432 dbname=analytics user=modelflow password=secret",
//!     4,
//!     true,
//! ).await?;
//! ```

use crate::adapter::{Capabilities, Warehouse, WarehouseError};

#[cfg(feature = "postgres")]
use crate::adapter::{non_negative, relation_kind_from_table_type};

use modelflow_core::RelationKind;

#[cfg(feature = "postgres")]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "postgres")]
use tokio::sync::Mutex;

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,

    /// Use TLS (native-tls)
    pub tls: bool,

    /// Number of connections to open
    pub connections: usize,
}

impl PostgresOptions {
    pub fn new(host: impl Into<String>, database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 5432,
            database: database.into(),
            user: user.into(),
            password: None,
            tls: false,
            connections: 1,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections.max(1);
        self
    }

    /// keyword/value connection string
    pub fn connection_string(&self) -> String {
        let mut config = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.database, self.user
        );
        if let Some(password) = &self.password {
            config.push_str(&format!(" password={}", password));
        }
        config
    }
}

/// PostgreSQL warehouse
pub struct PostgresWarehouse {
    /// Open connections, used round robin
    #[cfg(feature = "postgres")]
    clients: Vec<Mutex<Client>>,

    #[cfg(feature = "postgres")]
    next: AtomicUsize,

    /// Connection target for logging (`host:port/database`)
    target: String,
}

impl PostgresWarehouse {
    /// Connect with explicit options
    pub async fn connect(options: &PostgresOptions) -> Result<Self, WarehouseError> {
        let target = format!("{}:{}/{}", options.host, options.port, options.database);
        Self::open(&options.connection_string(), options.connections, options.tls, target).await
    }

    /// Connect from a PostgreSQL connection string
    pub async fn from_connection_string(conn_str: &str, connections: usize, tls: bool) -> Result<Self, WarehouseError> {
        Self::open(conn_str, connections, tls, "postgres".to_string()).await
    }

    /// Connection target (`host:port/database`)
    pub fn target(&self) -> &str {
        &self.target
    }

    #[cfg(feature = "postgres")]
    async fn open(conn_str: &str, connections: usize, tls: bool, target: String) -> Result<Self, WarehouseError> {
        let mut clients = Vec::with_capacity(connections.max(1));

        for _ in 0..connections.max(1) {
            let client = if tls {
                let connector = TlsConnector::builder()
                    .build()
                    .map_err(|e| WarehouseError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;

                let (client, connection) = tokio_postgres::connect(conn_str, MakeTlsConnector::new(connector))
                    .await
                    .map_err(|e| {
                        WarehouseError::ConnectionError(format!("Failed to connect to {} with TLS: {}", target, e))
                    })?;

                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(target = %target, error = %e, "PostgreSQL TLS connection error");
                    }
                });
                client
            } else {
                let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
                    .await
                    .map_err(|e| WarehouseError::ConnectionError(format!("Failed to connect to {}: {}", target, e)))?;

                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(target = %target, error = %e, "PostgreSQL connection error");
                    }
                });
                client
            };

            clients.push(Mutex::new(client));
        }

        tracing::debug!(target = %target, connections = clients.len(), "Connected to PostgreSQL");

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            target,
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn open(_conn_str: &str, _connections: usize, _tls: bool, _target: String) -> Result<Self, WarehouseError> {
        Err(WarehouseError::ConfigError(
            "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres".to_string(),
        ))
    }

    #[cfg(feature = "postgres")]
    fn client(&self) -> &Mutex<Client> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }
}

#[cfg(feature = "postgres")]
fn query_error(e: tokio_postgres::Error) -> WarehouseError {
    WarehouseError::QueryError(e.to_string())
}

#[async_trait::async_trait]
impl Warehouse for PostgresWarehouse {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional_ddl: true,
            drop_cascade: true,
        }
    }

    #[cfg(feature = "postgres")]
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        let client = self.client().lock().await;
        client.execute(sql, &[]).await.map_err(query_error)
    }

    #[cfg(feature = "postgres")]
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), WarehouseError> {
        let mut client = self.client().lock().await;
        let tx = client.transaction().await.map_err(query_error)?;

        for statement in statements {
            // Dropping `tx` on error rolls back
            tx.execute(statement.as_str(), &[]).await.map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)
    }

    #[cfg(feature = "postgres")]
    async fn query_count(&self, sql: &str) -> Result<u64, WarehouseError> {
        let client = self.client().lock().await;
        let row = client.query_one(sql, &[]).await.map_err(query_error)?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| WarehouseError::InvalidResponse(format!("expected an integer count: {}", e)))?;
        non_negative(count)
    }

    #[cfg(feature = "postgres")]
    async fn relation_kind(&self, schema: &str, name: &str) -> Result<Option<RelationKind>, WarehouseError> {
        let client = self.client().lock().await;
        let row = client
            .query_opt(
                "select table_type::text from information_schema.tables where table_schema::text = $1 and table_name::text = $2",
                &[&schema, &name],
            )
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let table_type: String = row
                    .try_get(0)
                    .map_err(|e| WarehouseError::InvalidResponse(format!("expected a table type: {}", e)))?;
                relation_kind_from_table_type(&table_type).map(Some)
            }
            None => Ok(None),
        }
    }

    #[cfg(feature = "postgres")]
    async fn test_connection(&self) -> Result<(), WarehouseError> {
        let client = self.client().lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| WarehouseError::ConnectionError(format!("Connection test failed for {}: {}", self.target, e)))
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute(&self, _sql: &str) -> Result<u64, WarehouseError> {
        Err(WarehouseError::ConfigError("PostgreSQL support not compiled".to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute_transaction(&self, _statements: &[String]) -> Result<(), WarehouseError> {
        Err(WarehouseError::ConfigError("PostgreSQL support not compiled".to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn query_count(&self, _sql: &str) -> Result<u64, WarehouseError> {
        Err(WarehouseError::ConfigError("PostgreSQL support not compiled".to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn relation_kind(&self, _schema: &str, _name: &str) -> Result<Option<RelationKind>, WarehouseError> {
        Err(WarehouseError::ConfigError("PostgreSQL support not compiled".to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn test_connection(&self) -> Result<(), WarehouseError> {
        Err(WarehouseError::ConfigError("PostgreSQL support not compiled".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_from_options() {
        let options = PostgresOptions::new("db.example.com", "analytics", "modelflow")
            .port(6543)
            .password("secret")
            .connections(0);

        assert_eq!(
            options.connection_string(),
            "host=db.example.com port=6543 dbname=analytics user=modelflow password=secret"
        );
        assert_eq!(options.connections, 1);
        assert!(!options.tls);
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn connect_without_feature_is_a_config_error() {
        let options = PostgresOptions::new("localhost", "db", "user");
        assert!(matches!(
            PostgresWarehouse::connect(&options).await,
            Err(WarehouseError::ConfigError(_))
        ));
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    #[ignore = "requires PGHOST, PGDATABASE and PGUSER"]
    async fn round_trip_against_live_postgres() {
        let host = std::env::var("PGHOST").unwrap();
        let database = std::env::var("PGDATABASE").unwrap();
        let user = std::env::var("PGUSER").unwrap();
        let mut options = PostgresOptions::new(host, database, user).connections(2);
        if let Ok(password) = std::env::var("PGPASSWORD") {
            options = options.password(password);
        }

        let warehouse = PostgresWarehouse::connect(&options).await.unwrap();
        warehouse.test_connection().await.unwrap();
        warehouse.ensure_schema("modelflow_it").await.unwrap();
        warehouse
            .execute_transaction(&[
                "drop table if exists modelflow_it.t".to_string(),
                "create table modelflow_it.t as select generate_series(1, 3) as id".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(warehouse.query_count("select count(*) from modelflow_it.t").await.unwrap(), 3);
        assert_eq!(
            warehouse.relation_kind("modelflow_it", "t").await.unwrap(),
            Some(RelationKind::Table)
        );
    }
}
