//! Failure notifications

use modelflow_core::{RunReport, UnitStatus};

/// Told about every run cycle that did not succeed
///
/// Implementations handle their own delivery errors; a notification never
/// changes the outcome of a run.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RunReport);
}

/// Writes failures to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &RunReport) {
        let failed: Vec<&str> = report
            .results
            .iter()
            .filter(|r| r.status == UnitStatus::Failed)
            .map(|r| r.unit.as_str())
            .collect();

        tracing::error!(
            run_id = %report.run_id,
            status = %report.status,
            failed = ?failed,
            skipped = report.summary.skipped,
            failing_tests = report.failed_tests().len(),
            "Run did not succeed"
        );
    }
}
