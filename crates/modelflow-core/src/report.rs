//! Run report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use crate::unit::{TestKind, TestSeverity};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Zero failing rows
    Pass,

    /// Failing rows on an error-severity test
    Fail,

    /// Failing rows on a warn-severity test
    Warn,

    /// The test query itself failed
    Error,

    /// Not evaluated because a unit it needs was not built
    Skipped,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of evaluating one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name
    pub test: String,

    pub kind: TestKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    pub severity: TestSeverity,

    pub status: TestStatus,

    pub failing_row_count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    /// Whether the test passed (ran and found zero failing rows)
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }

    /// Whether this result fails a strict run
    pub fn is_blocking(&self) -> bool {
        matches!(self.status, TestStatus::Fail | TestStatus::Error)
    }
}

/// Result of one unit in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Unit name
    pub unit: String,

    pub status: UnitStatus,

    /// Rows in the materialized table; `None` for views and unbuilt units
    pub rows_affected: Option<u64>,

    #[serde(default)]
    pub test_results: Vec<TestResult>,

    /// Error or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub duration_ms: u64,

    /// Number of times the unit was executed in this run
    pub attempts: u32,
}

impl RunResult {
    pub fn success(unit: impl Into<String>, rows_affected: Option<u64>, duration_ms: u64) -> Self {
        Self {
            unit: unit.into(),
            status: UnitStatus::Success,
            rows_affected,
            test_results: Vec::new(),
            message: None,
            duration_ms,
            attempts: 1,
        }
    }

    pub fn failed(unit: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            unit: unit.into(),
            status: UnitStatus::Failed,
            rows_affected: None,
            test_results: Vec::new(),
            message: Some(message.into()),
            duration_ms,
            attempts: 1,
        }
    }

    pub fn skipped(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: UnitStatus::Skipped,
            rows_affected: None,
            test_results: Vec::new(),
            message: Some(reason.into()),
            duration_ms: 0,
            attempts: 0,
        }
    }

    /// Whether the unit did not end up built
    pub fn is_unbuilt(&self) -> bool {
        self.status != UnitStatus::Success
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary statistics for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub units: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub tests: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_warned: usize,
    pub tests_errored: usize,
    pub tests_skipped: usize,
}

impl RunSummary {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut summary = Self {
            units: results.len(),
            ..Self::default()
        };

        for result in results {
            match result.status {
                UnitStatus::Success => summary.succeeded += 1,
                UnitStatus::Failed => summary.failed += 1,
                UnitStatus::Skipped => summary.skipped += 1,
            }

            for test in &result.test_results {
                summary.tests += 1;
                match test.status {
                    TestStatus::Pass => summary.tests_passed += 1,
                    TestStatus::Fail => summary.tests_failed += 1,
                    TestStatus::Warn => summary.tests_warned += 1,
                    TestStatus::Error => summary.tests_errored += 1,
                    TestStatus::Skipped => summary.tests_skipped += 1,
                }
            }
        }

        summary
    }
}

/// Run report (run_report.json v1)
///
/// This is the stable output format.
/// Every unit of the run appears in `results`, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    pub run_id: String,

    /// Timestamp (RFC 3339)
    pub started_at: String,

    /// Timestamp (RFC 3339)
    pub finished_at: String,

    pub status: RunStatus,

    /// Executor passes, including retries
    pub attempts: u32,

    pub summary: RunSummary,

    pub results: Vec<RunResult>,
}

impl RunReport {
    /// Build a report from final results
    ///
    /// `strict` turns blocking test results into a failed run.
    pub fn new(
        started_at: chrono::DateTime<chrono::Utc>,
        results: Vec<RunResult>,
        attempts: u32,
        cancelled: bool,
        strict: bool,
    ) -> Self {
        let summary = RunSummary::from_results(&results);
        let test_blocked = strict && results.iter().flat_map(|r| &r.test_results).any(TestResult::is_blocking);

        let status = if cancelled {
            RunStatus::Cancelled
        } else if summary.failed > 0 || summary.skipped > 0 || test_blocked {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        Self {
            version: ReportVersion::CURRENT,
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            status,
            attempts,
            summary,
            results,
        }
    }

    /// Result for a unit
    pub fn result(&self, unit: &str) -> Option<&RunResult> {
        self.results.iter().find(|r| r.unit == unit)
    }

    /// Every failing or erroring test across the run
    pub fn failed_tests(&self) -> Vec<&TestResult> {
        self.results
            .iter()
            .flat_map(|r| &r.test_results)
            .filter(|t| t.is_blocking())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)
    }
}
