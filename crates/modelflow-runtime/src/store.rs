//! Run history
//!
//! Every finished run cycle appends its report to a [`RunStore`]. The JSON
//! lines store keeps one report per line, so history survives restarts and
//! can be inspected with ordinary tools.

use modelflow_core::RunReport;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access run log {path}: {message}")]
    Io { path: String, message: String },

    #[error("Corrupt run log entry at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Failed to serialize run report: {0}")]
    Serialize(String),
}

/// Append-only record of run reports
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn append(&self, report: &RunReport) -> Result<(), StoreError>;

    /// Stored reports, oldest first; `limit` keeps only the most recent ones
    async fn history(&self, limit: Option<usize>) -> Result<Vec<RunReport>, StoreError>;

    /// Most recent report
    async fn last(&self) -> Result<Option<RunReport>, StoreError> {
        Ok(self.history(Some(1)).await?.pop())
    }
}

fn keep_last(mut reports: Vec<RunReport>, limit: Option<usize>) -> Vec<RunReport> {
    if let Some(limit) = limit {
        let excess = reports.len().saturating_sub(limit);
        reports.drain(..excess);
    }
    reports
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    reports: RwLock<Vec<RunReport>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for MemoryRunStore {
    async fn append(&self, report: &RunReport) -> Result<(), StoreError> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }

    async fn history(&self, limit: Option<usize>) -> Result<Vec<RunReport>, StoreError> {
        Ok(keep_last(self.reports.read().await.clone(), limit))
    }
}

/// JSON lines file store
#[derive(Debug)]
pub struct JsonLinesRunStore {
    path: PathBuf,

    /// Serializes appends from concurrent cycles
    lock: Mutex<()>,
}

impl JsonLinesRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, e: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl RunStore for JsonLinesRunStore {
    async fn append(&self, report: &RunReport) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(report).map_err(|e| StoreError::Serialize(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        tracing::debug!(path = %self.path.display(), run_id = %report.run_id, "Appended run report");
        Ok(())
    }

    async fn history(&self, limit: Option<usize>) -> Result<Vec<RunReport>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut reports = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let report = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                line: number + 1,
                message: e.to_string(),
            })?;
            reports.push(report);
        }

        Ok(keep_last(reports, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelflow_core::RunResult;
    use pretty_assertions::assert_eq;

    fn report(unit: &str) -> RunReport {
        RunReport::new(chrono::Utc::now(), vec![RunResult::success(unit, None, 1)], 1, false, false)
    }

    #[tokio::test]
    async fn memory_store_keeps_the_latest() {
        let store = MemoryRunStore::new();
        store.append(&report("a")).await.unwrap();
        store.append(&report("b")).await.unwrap();

        assert_eq!(store.history(None).await.unwrap().len(), 2);
        let last = store.last().await.unwrap().unwrap();
        assert_eq!(last.results[0].unit, "b");
    }

    #[tokio::test]
    async fn json_lines_store_round_trips_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesRunStore::new(dir.path().join("target").join("run_log.jsonl"));

        assert!(store.history(None).await.unwrap().is_empty());

        let first = report("stg_orders");
        let second = report("fct_orders");
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let history = store.history(None).await.unwrap();
        assert_eq!(history, vec![first, second.clone()]);
        assert_eq!(store.history(Some(1)).await.unwrap(), vec![second]);

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn corrupt_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_log.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = JsonLinesRunStore::new(&path).history(None).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
