//! Run scheduling
//!
//! A run cycle plans and executes the project, retries failed units (and
//! everything downstream of them) under the retry policy, records the report
//! and notifies on failure. Tests that were skipped because a unit they read
//! from failed are evaluated again once a retry has built that unit.
//!
//! [`Scheduler::schedule`] repeats cycles for a trigger until cancelled.
//! Cycles never overlap: triggers that arrive while a cycle is running are
//! coalesced into the next one.

use crate::executor::Executor;
use crate::notify::{LogNotifier, Notifier};
use crate::pipeline::{Pipeline, RunPlan};
use crate::store::{RunStore, StoreError};
use crate::test_engine::TestEngine;
use modelflow_core::{RetryPolicy, RunReport, RunResult, TestStatus, UnitStatus};
use modelflow_project::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What starts a run cycle
#[derive(Debug)]
pub enum Trigger {
    /// A single cycle
    Once,

    /// A cycle, then another one `period` after each cycle finishes
    Interval(Duration),

    /// A cycle per received event, until the sender is dropped
    Events(mpsc::Receiver<()>),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs cycles of a project against one warehouse pool
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    executor: Executor,
    store: Arc<dyn RunStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    strict: bool,

    /// Units to run; `None` runs every unit
    selection: Option<Vec<NodeId>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, executor: Executor, store: Arc<dyn RunStore>) -> Self {
        Self {
            pipeline,
            executor,
            store,
            notifier: Arc::new(LogNotifier),
            retry: RetryPolicy::none(),
            strict: false,
            selection: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fail runs whose error-severity tests fail
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_selection(mut self, units: Vec<NodeId>) -> Self {
        self.selection = Some(units);
        self
    }

    /// Token that stops the current cycle and the schedule loop
    pub fn cancellation(&self) -> &CancellationToken {
        self.executor.cancellation()
    }

    /// Plan, execute, retry, record and notify
    pub async fn run_cycle(&self) -> Result<RunReport, SchedulerError> {
        let started_at = chrono::Utc::now();
        let cancel = self.cancellation();

        let cascade = self.executor.pool().warehouse().capabilities().drop_cascade;
        let plan = match &self.selection {
            Some(units) if cascade => self.pipeline.plan(&self.pipeline.with_cascade_dependents(units)),
            Some(units) => self.pipeline.plan(units),
            None => self.pipeline.plan_all(),
        };
        tracing::info!(units = plan.len(), "Starting run cycle");

        let compile_failed: HashSet<&str> = plan.failures.iter().map(|r| r.unit.as_str()).collect();
        let planned: HashSet<&str> = plan.order.iter().map(String::as_str).collect();

        let mut results = self.pipeline.execute(&self.executor, &plan).await;
        let mut attempts = 1;

        for retry in 1..=self.retry.max_retries {
            if cancel.is_cancelled() {
                break;
            }

            let retry_set = self.retry_set(&results, &planned, &compile_failed);
            if retry_set.is_empty() {
                break;
            }

            let delay = self.retry.delay_for(retry);
            tracing::warn!(
                retry,
                units = retry_set.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying failed units"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let subset = self.pipeline.plan(&retry_set);
            let retried = self.pipeline.execute(&self.executor, &subset).await;
            attempts += 1;
            merge(&mut results, retried);
        }

        if attempts > 1 && !cancel.is_cancelled() {
            self.evaluate_unblocked_tests(&plan, &planned, &mut results).await;
        }

        let cancelled = cancel.is_cancelled() && results.iter().any(|r| r.status == UnitStatus::Skipped);
        let report = RunReport::new(started_at, results, attempts, cancelled, self.strict);

        tracing::info!(
            run_id = %report.run_id,
            status = %report.status,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            attempts = report.attempts,
            "Run cycle finished"
        );

        self.store.append(&report).await?;
        if !report.is_success() {
            self.notifier.notify(&report).await;
        }

        Ok(report)
    }

    /// Failed units plus their planned downstream, minus anything that
    /// depends on a unit that did not compile
    fn retry_set(&self, results: &[RunResult], planned: &HashSet<&str>, compile_failed: &HashSet<&str>) -> Vec<NodeId> {
        let graph = self.pipeline.graph();
        let mut set: HashSet<NodeId> = HashSet::new();

        for failed in results
            .iter()
            .filter(|r| r.status == UnitStatus::Failed && !compile_failed.contains(r.unit.as_str()))
        {
            set.insert(failed.unit.clone());
            set.extend(
                graph
                    .downstream(&failed.unit)
                    .into_iter()
                    .filter(|n| planned.contains(n.as_str())),
            );
        }

        set.retain(|unit| {
            !compile_failed.contains(unit.as_str())
                && !graph.upstream(unit).iter().any(|u| compile_failed.contains(u.as_str()))
        });

        graph.in_order(&set)
    }

    /// Evaluate skipped tests of built units whose required units are now built
    async fn evaluate_unblocked_tests(&self, plan: &RunPlan, planned: &HashSet<&str>, results: &mut [RunResult]) {
        let built: HashSet<String> = results
            .iter()
            .filter(|r| r.status == UnitStatus::Success)
            .map(|r| r.unit.clone())
            .collect();
        let engine = TestEngine::new(self.executor.pool().clone(), self.executor.options().statement_timeout);

        for result in results.iter_mut().filter(|r| r.status == UnitStatus::Success) {
            let Some(unit) = plan.unit(&result.unit) else {
                continue;
            };

            for (compiled, test_result) in unit.tests.iter().zip(result.test_results.iter_mut()) {
                let unblocked = test_result.status == TestStatus::Skipped
                    && compiled
                        .requires
                        .iter()
                        .all(|name| built.contains(name) || !planned.contains(name.as_str()));
                if unblocked {
                    tracing::info!(unit = %unit.name, test = %compiled.name, "Evaluating test after retry");
                    *test_result = engine.evaluate_test(compiled).await;
                }
            }
        }
    }

    /// Run cycles for `trigger` until it is exhausted or cancelled
    ///
    /// Returns the number of cycles run. Store errors are logged and do not
    /// stop the schedule.
    pub async fn schedule(&self, trigger: Trigger) -> usize {
        let cancel = self.cancellation().clone();
        let mut cycles = 0;

        match trigger {
            Trigger::Once => {
                self.logged_cycle().await;
                cycles += 1;
            }
            Trigger::Interval(period) => loop {
                if cancel.is_cancelled() {
                    break;
                }
                self.logged_cycle().await;
                cycles += 1;

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            },
            Trigger::Events(mut events) => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Events that piled up during the last cycle are covered by this one
                        while events.try_recv().is_ok() {}

                        self.logged_cycle().await;
                        cycles += 1;
                    }
                }
            },
        }

        tracing::info!(cycles, "Schedule stopped");
        cycles
    }

    async fn logged_cycle(&self) {
        if let Err(e) = self.run_cycle().await {
            tracing::error!(error = %e, "Failed to record run cycle");
        }
    }
}

/// Replace results of retried units, accumulating attempts
fn merge(results: &mut [RunResult], retried: Vec<RunResult>) {
    for result in retried {
        if let Some(slot) = results.iter_mut().find(|r| r.unit == result.unit) {
            let previous = slot.attempts;
            *slot = result;
            slot.attempts += previous;
        }
    }
}
