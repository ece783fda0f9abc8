//! Mock warehouse for testing
//!
//! Records every statement instead of running it. It's useful for:
//! - Unit testing the executor and the test engine
//! - Checking the statement sequence of a materialization
//! - Simulating statement failures, timeouts and flaky warehouses
//!
//! ## Usage
//!
//! ```rust,ignore
//! use modelflow_warehouse::{MockWarehouse, Warehouse};
//!
//! let warehouse = MockWarehouse::new().with_latency(10);
//! warehouse.fail_on("create table marts.fct_orders", "relation does not exist").await;
//! warehouse.set_count("mf_failures", 3).await;
//!
//! warehouse.execute("create schema if not exists marts").await?;
//! assert_eq!(warehouse.statements().await.len(), 1);
//! ```

use crate::adapter::{Capabilities, Warehouse, WarehouseError};
use modelflow_core::RelationKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Scripted failure for statements containing `pattern`
#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    message: String,

    /// Failures left; `None` fails forever
    remaining: Option<u32>,
}

/// Mock warehouse for testing
///
/// # Features
///
/// - Records statements in execution order (transactions as `begin` / `commit`)
/// - Fails statements matching a substring, forever or a set number of times
/// - Answers `query_count` from substring rules
/// - Reports relation kinds set with [`MockWarehouse::set_relation`]
/// - Simulates latency and connection failures
/// - Tracks the peak number of concurrent calls
pub struct MockWarehouse {
    statements: Arc<RwLock<Vec<String>>>,
    failures: Arc<RwLock<Vec<FailureRule>>>,

    /// `(pattern, count)` rules for `query_count`, first match wins
    counts: Arc<RwLock<Vec<(String, u64)>>>,

    /// Existing relations by `schema.name`
    relations: Arc<RwLock<HashMap<String, RelationKind>>>,

    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate query latency (milliseconds)
    latency_ms: u64,

    capabilities: Capabilities,

    /// Name to return from name() method
    warehouse_name: &'static str,
}

impl MockWarehouse {
    /// Create a mock with transactional DDL and no scripted behaviour
    pub fn new() -> Self {
        Self {
            statements: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(Vec::new())),
            counts: Arc::new(RwLock::new(Vec::new())),
            relations: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            fail_connection: false,
            latency_ms: 0,
            capabilities: Capabilities {
                transactional_ddl: true,
                drop_cascade: false,
            },
            warehouse_name: "Mock",
        }
    }

    /// Configure to fail all connection tests
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for all operations
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set a custom warehouse name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.warehouse_name = name;
        self
    }

    /// Fail every statement containing `pattern`
    pub async fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.failures.write().await.push(FailureRule {
            pattern: pattern.into(),
            message: message.into(),
            remaining: None,
        });
    }

    /// Fail the next `times` statements containing `pattern`
    pub async fn fail_times(&self, pattern: impl Into<String>, message: impl Into<String>, times: u32) {
        self.failures.write().await.push(FailureRule {
            pattern: pattern.into(),
            message: message.into(),
            remaining: Some(times),
        });
    }

    /// Answer `query_count` with `count` for queries containing `pattern`
    pub async fn set_count(&self, pattern: impl Into<String>, count: u64) {
        self.counts.write().await.push((pattern.into(), count));
    }

    /// Report `relation` (`schema.name`) as existing with `kind`
    pub async fn set_relation(&self, relation: impl Into<String>, kind: RelationKind) {
        self.relations.write().await.insert(relation.into(), kind);
    }

    /// Every statement received so far, in order
    pub async fn statements(&self) -> Vec<String> {
        self.statements.read().await.clone()
    }

    /// Number of recorded statements containing `pattern`
    pub async fn executed(&self, pattern: &str) -> usize {
        self.statements
            .read()
            .await
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    /// Highest number of calls that were in progress at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Forget recorded statements
    pub async fn clear(&self) {
        self.statements.write().await.clear();
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    /// Record a statement and apply failure rules
    async fn run(&self, sql: &str) -> Result<(), WarehouseError> {
        self.statements.write().await.push(sql.to_string());

        let mut failures = self.failures.write().await;
        let Some(index) = failures.iter().position(|rule| sql.contains(&rule.pattern)) else {
            return Ok(());
        };

        let message = failures[index].message.clone();
        if let Some(remaining) = failures[index].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                failures.remove(index);
            }
        }

        Err(WarehouseError::QueryError(message))
    }

    fn enter(&self) -> InFlight<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

impl Default for MockWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Warehouse for MockWarehouse {
    fn name(&self) -> &'static str {
        self.warehouse_name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        let _guard = self.enter();
        self.simulate_latency().await;
        self.run(sql).await.map(|_| 0)
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), WarehouseError> {
        let _guard = self.enter();
        self.simulate_latency().await;

        self.statements.write().await.push("begin".to_string());
        for statement in statements {
            if let Err(e) = self.run(statement).await {
                self.statements.write().await.push("rollback".to_string());
                return Err(e);
            }
        }
        self.statements.write().await.push("commit".to_string());

        Ok(())
    }

    async fn query_count(&self, sql: &str) -> Result<u64, WarehouseError> {
        let _guard = self.enter();
        self.simulate_latency().await;
        self.run(sql).await?;

        Ok(self
            .counts
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, count)| *count)
            .unwrap_or(0))
    }

    async fn relation_kind(&self, schema: &str, name: &str) -> Result<Option<RelationKind>, WarehouseError> {
        Ok(self.relations.read().await.get(&format!("{}.{}", schema, name)).copied())
    }

    async fn test_connection(&self) -> Result<(), WarehouseError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(WarehouseError::ConnectionError("Mock connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}
