//! Test engine
//!
//! Evaluates compiled data tests against materialized relations. A test's
//! query selects the failing rows; the engine counts them and maps the count
//! to a status using the test's severity.

use crate::error::{with_timeout, ExecutionError};
use modelflow_core::{TestResult, TestSeverity, TestStatus};
use modelflow_sql::{CompiledTest, CompiledUnit};
use modelflow_warehouse::WarehousePool;
use std::time::Duration;

/// Runs test queries through the connection pool
#[derive(Debug, Clone)]
pub struct TestEngine {
    pool: WarehousePool,
    timeout: Duration,
}

impl TestEngine {
    pub fn new(pool: WarehousePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Evaluate every test of a unit, in declaration order
    pub async fn evaluate(&self, unit: &CompiledUnit) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(unit.tests.len());
        for test in &unit.tests {
            results.push(self.evaluate_test(test).await);
        }
        results
    }

    /// Evaluate one test
    pub async fn evaluate_test(&self, test: &CompiledTest) -> TestResult {
        match self.count_failures(test).await {
            Ok(count) => {
                let result = outcome(test, count);
                match result.status {
                    TestStatus::Pass => tracing::debug!(test = %test.name, "Test passed"),
                    _ => tracing::warn!(
                        test = %test.name,
                        status = %result.status,
                        failing_rows = count,
                        "Test found failing rows"
                    ),
                }
                result
            }
            Err(e) => {
                tracing::error!(test = %test.name, error = %e, "Test query failed");
                let mut result = blank(test, TestStatus::Error);
                result.message = Some(e.to_string());
                result
            }
        }
    }

    async fn count_failures(&self, test: &CompiledTest) -> Result<u64, ExecutionError> {
        let conn = tokio::time::timeout(self.timeout, self.pool.checkout())
            .await
            .map_err(|_| ExecutionError::Timeout(self.timeout))?
            .map_err(ExecutionError::Pool)?;

        with_timeout(self.timeout, conn.query_count(&test.count_sql)).await
    }
}

/// Result for a test that was not evaluated
pub fn skipped(test: &CompiledTest, reason: impl Into<String>) -> TestResult {
    let mut result = blank(test, TestStatus::Skipped);
    result.message = Some(reason.into());
    result
}

fn outcome(test: &CompiledTest, failing_rows: u64) -> TestResult {
    let status = match (failing_rows, test.severity) {
        (0, _) => TestStatus::Pass,
        (_, TestSeverity::Warn) => TestStatus::Warn,
        (_, TestSeverity::Error) => TestStatus::Fail,
    };

    let mut result = blank(test, status);
    result.failing_row_count = failing_rows;
    if failing_rows > 0 {
        result.message = Some(format!("{} failing row(s)", failing_rows));
    }
    result
}

fn blank(test: &CompiledTest, status: TestStatus) -> TestResult {
    TestResult {
        test: test.name.clone(),
        kind: test.kind,
        column: test.column.clone(),
        severity: test.severity,
        status,
        failing_row_count: 0,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelflow_core::TestKind;
    use modelflow_warehouse::MockWarehouse;
    use std::sync::Arc;

    fn compiled(name: &str, severity: TestSeverity) -> CompiledTest {
        CompiledTest {
            name: name.to_string(),
            kind: TestKind::NotNull,
            column: Some("order_id".to_string()),
            severity,
            failing_rows_sql: format!("select * from marts.{} where order_id is null", name),
            count_sql: format!("select count(*) from (\nselect * from marts.{}\n) as mf_failures", name),
            requires: Vec::new(),
        }
    }

    #[tokio::test]
    async fn failing_rows_map_to_severity() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.set_count("marts.strict_test", 2).await;
        warehouse.set_count("marts.lenient_test", 5).await;
        let engine = TestEngine::new(WarehousePool::new(warehouse, 1), Duration::from_secs(5));

        let clean = engine.evaluate_test(&compiled("clean_test", TestSeverity::Error)).await;
        assert_eq!(clean.status, TestStatus::Pass);
        assert_eq!(clean.failing_row_count, 0);

        let strict = engine.evaluate_test(&compiled("strict_test", TestSeverity::Error)).await;
        assert_eq!(strict.status, TestStatus::Fail);
        assert_eq!(strict.failing_row_count, 2);

        let lenient = engine.evaluate_test(&compiled("lenient_test", TestSeverity::Warn)).await;
        assert_eq!(lenient.status, TestStatus::Warn);
        assert_eq!(lenient.failing_row_count, 5);
    }

    #[tokio::test]
    async fn query_errors_are_test_errors() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_on("marts.broken", "column order_id does not exist").await;
        let engine = TestEngine::new(WarehousePool::new(warehouse, 1), Duration::from_secs(5));

        let result = engine.evaluate_test(&compiled("broken", TestSeverity::Warn)).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.unwrap().contains("column order_id does not exist"));
    }

    #[tokio::test]
    async fn slow_tests_time_out() {
        let warehouse = Arc::new(MockWarehouse::new().with_latency(200));
        let engine = TestEngine::new(WarehousePool::new(warehouse, 1), Duration::from_millis(20));

        let result = engine.evaluate_test(&compiled("slow", TestSeverity::Error)).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[test]
    fn skipped_results_carry_the_reason() {
        let result = skipped(&compiled("t", TestSeverity::Error), "unit 'fct_orders' was not built");
        assert_eq!(result.status, TestStatus::Skipped);
        assert_eq!(result.message.as_deref(), Some("unit 'fct_orders' was not built"));
    }
}
