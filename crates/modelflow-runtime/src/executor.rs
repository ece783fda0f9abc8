//! Parallel DAG executor
//!
//! Materializes compiled units with bounded parallelism. A unit starts once
//! every dependency inside the run has been built; dependencies outside the
//! run are assumed to exist already. When a unit fails, everything
//! downstream of it inside the run is skipped while independent branches
//! keep going.
//!
//! ## Scheduling
//!
//! The executor keeps a ready queue of units whose in-run dependencies have
//! all succeeded and spawns one task per ready unit onto a `JoinSet`. Tasks
//! wait for a slot in the [`WarehousePool`], so at most `pool.size()`
//! statements are in flight regardless of how many units are ready.
//!
//! Cancellation stops new units from starting. Units already running finish,
//! and every unit that never started is reported as skipped.

use crate::error::{with_timeout, ExecutionError};
use crate::test_engine::{self, TestEngine};
use modelflow_core::{ExecutionConfig, RunResult, TestResult, TestTiming, UnitStatus};
use modelflow_sql::{CompiledUnit, Plan, Step, SwapStrategy};
use modelflow_warehouse::WarehousePool;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Limit for every warehouse call, including waiting for a connection
    pub statement_timeout: Duration,

    pub test_timing: TestTiming,
}

impl ExecutorOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            statement_timeout: config.statement_timeout(),
            test_timing: config.test_timing,
        }
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// A finished task
enum Completed {
    Unit { index: usize, result: RunResult },
    Test { unit: usize, test: usize, result: TestResult },
}

/// Whether a finished unit was built, and which failure caused it not to be
#[derive(Debug, Clone)]
struct Outcome {
    built: bool,
    root: String,
}

/// Executes compiled units against a warehouse pool
#[derive(Debug, Clone)]
pub struct Executor {
    pool: WarehousePool,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(pool: WarehousePool, options: ExecutorOptions) -> Self {
        Self {
            pool,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop starting units once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pool(&self) -> &WarehousePool {
        &self.pool
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Execute `units` (a dependency-closed or partial subset of the DAG)
    ///
    /// Returns one result per unit, in the order of `units`.
    pub async fn run(&self, units: &[CompiledUnit]) -> Vec<RunResult> {
        self.run_seeded(units, Vec::new()).await
    }

    /// Execute `units` next to units that already have a result
    ///
    /// `seeded` results (units that failed to compile, for example) take
    /// part in dependency resolution: their dependents are skipped unless the
    /// seeded result is a success. They are returned after the results of
    /// `units`.
    pub async fn run_seeded(&self, units: &[CompiledUnit], seeded: Vec<RunResult>) -> Vec<RunResult> {
        let units: Vec<Arc<CompiledUnit>> = units.iter().cloned().map(Arc::new).collect();
        let mut state = RunState::new(&units, &seeded);
        let engine = TestEngine::new(self.pool.clone(), self.options.statement_timeout);
        let mut tasks: JoinSet<Completed> = JoinSet::new();

        tracing::info!(units = units.len(), threads = self.pool.size(), "Starting execution");

        loop {
            while let Some(index) = state.ready.pop_front() {
                if self.cancel.is_cancelled() {
                    state.cancelled = true;
                    state.ready.clear();
                    break;
                }
                let unit = units[index].clone();
                let pool = self.pool.clone();
                let timeout = self.options.statement_timeout;
                tasks.spawn(async move {
                    let result = build(&pool, &unit, timeout).await;
                    Completed::Unit { index, result }
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok(Completed::Unit { index, result }) => {
                    let built = state.finish_unit(index, result);
                    if built && self.options.test_timing == TestTiming::AfterUnit {
                        state.queue_tests(index);
                    }
                    if self.options.test_timing == TestTiming::AfterUnit {
                        self.spawn_tests(&mut state, &engine, &mut tasks);
                    }
                }
                Ok(Completed::Test { unit, test, result }) => {
                    state.tests[unit][test] = Some(result);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Execution task did not complete");
                }
            }
        }

        if self.cancel.is_cancelled() {
            state.cancelled = true;
        }

        if self.options.test_timing == TestTiming::EndOfRun && !state.cancelled {
            for index in 0..units.len() {
                if state.is_built(index) {
                    state.queue_tests(index);
                }
            }
            self.spawn_tests(&mut state, &engine, &mut tasks);

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Completed::Test { unit, test, result }) => state.tests[unit][test] = Some(result),
                    Ok(Completed::Unit { .. }) => {}
                    Err(e) => tracing::error!(error = %e, "Test task did not complete"),
                }
            }
        }

        let results = state.finish(seeded);
        let failed = results.iter().filter(|r| r.status == UnitStatus::Failed).count();
        let skipped = results.iter().filter(|r| r.status == UnitStatus::Skipped).count();
        tracing::info!(units = results.len(), failed, skipped, "Execution finished");
        results
    }

    /// Spawn every queued test whose required units are settled
    fn spawn_tests(&self, state: &mut RunState<'_>, engine: &TestEngine, tasks: &mut JoinSet<Completed>) {
        let queued = std::mem::take(&mut state.queued_tests);

        for (unit, test) in queued {
            let compiled = &state.units[unit].tests[test];
            match state.requirement(&compiled.requires) {
                Requirement::Met => {
                    let engine = engine.clone();
                    let owner = state.units[unit].clone();
                    tasks.spawn(async move {
                        let result = engine.evaluate_test(&owner.tests[test]).await;
                        Completed::Test { unit, test, result }
                    });
                }
                Requirement::Unbuilt(name) => {
                    let reason = format!("required unit '{}' was not built", name);
                    state.tests[unit][test] = Some(test_engine::skipped(compiled, reason));
                }
                Requirement::Pending => state.queued_tests.push((unit, test)),
            }
        }
    }
}

enum Requirement {
    Met,
    Pending,
    Unbuilt(String),
}

/// Bookkeeping for one executor pass
struct RunState<'a> {
    units: &'a [Arc<CompiledUnit>],
    index: HashMap<String, usize>,

    /// Settled units and seeded results, by name
    outcomes: HashMap<String, Outcome>,

    results: Vec<Option<RunResult>>,

    /// In-run dependencies not yet built
    waiting: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: VecDeque<usize>,

    tests: Vec<Vec<Option<TestResult>>>,
    queued_tests: Vec<(usize, usize)>,

    cancelled: bool,
}

impl<'a> RunState<'a> {
    fn new(units: &'a [Arc<CompiledUnit>], seeded: &[RunResult]) -> Self {
        let index: HashMap<String, usize> = units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.name.clone(), i))
            .collect();

        let outcomes = seeded
            .iter()
            .map(|result| {
                (
                    result.unit.clone(),
                    Outcome {
                        built: result.status == UnitStatus::Success,
                        root: result.unit.clone(),
                    },
                )
            })
            .collect();

        let mut state = Self {
            units,
            index,
            outcomes,
            results: vec![None; units.len()],
            waiting: vec![0; units.len()],
            dependents: vec![Vec::new(); units.len()],
            ready: VecDeque::new(),
            tests: units.iter().map(|u| vec![None; u.tests.len()]).collect(),
            queued_tests: Vec::new(),
            cancelled: false,
        };

        for (i, unit) in units.iter().enumerate() {
            for dependency in &unit.depends_on {
                if let Some(&parent) = state.index.get(dependency) {
                    state.waiting[i] += 1;
                    state.dependents[parent].push(i);
                }
            }
        }

        for (i, unit) in units.iter().enumerate() {
            let blocked_by = unit
                .depends_on
                .iter()
                .filter_map(|dependency| state.outcomes.get(dependency))
                .find(|outcome| !outcome.built)
                .map(|outcome| outcome.root.clone());

            match blocked_by {
                Some(root) => state.skip_from(i, root),
                None if state.waiting[i] == 0 && state.results[i].is_none() => state.ready.push_back(i),
                None => {}
            }
        }

        state
    }

    /// Record a unit result, releasing or skipping its dependents
    fn finish_unit(&mut self, index: usize, result: RunResult) -> bool {
        let name = self.units[index].name.clone();
        let built = result.status == UnitStatus::Success;

        match result.status {
            UnitStatus::Success => tracing::info!(
                unit = %name,
                rows = ?result.rows_affected,
                duration_ms = result.duration_ms,
                "Unit built"
            ),
            _ => tracing::error!(
                unit = %name,
                error = result.message.as_deref().unwrap_or_default(),
                "Unit failed"
            ),
        }

        self.outcomes.insert(name.clone(), Outcome { built, root: name.clone() });
        self.results[index] = Some(result);

        if built {
            for j in self.dependents[index].clone() {
                self.waiting[j] -= 1;
                if self.waiting[j] == 0 && self.results[j].is_none() {
                    self.ready.push_back(j);
                }
            }
        } else {
            for j in self.dependents[index].clone() {
                self.skip_from(j, name.clone());
            }
        }

        built
    }

    /// Skip `index` and everything downstream of it because `root` failed
    fn skip_from(&mut self, index: usize, root: String) {
        let mut stack = vec![index];

        while let Some(i) = stack.pop() {
            if self.results[i].is_some() {
                continue;
            }
            let name = self.units[i].name.clone();
            tracing::warn!(unit = %name, upstream = %root, "Skipping unit");

            self.results[i] = Some(RunResult::skipped(&name, format!("upstream '{}' failed", root)));
            self.outcomes.insert(
                name,
                Outcome {
                    built: false,
                    root: root.clone(),
                },
            );
            stack.extend(self.dependents[i].iter().copied());
        }
    }

    fn is_built(&self, index: usize) -> bool {
        self.results[index]
            .as_ref()
            .is_some_and(|r| r.status == UnitStatus::Success)
    }

    fn queue_tests(&mut self, index: usize) {
        for test in 0..self.units[index].tests.len() {
            self.queued_tests.push((index, test));
        }
    }

    /// State of the units a test reads from besides its own unit
    fn requirement(&self, requires: &[String]) -> Requirement {
        for name in requires {
            let in_run = self.index.contains_key(name) || self.outcomes.contains_key(name);
            if !in_run {
                continue;
            }
            match self.outcomes.get(name) {
                Some(outcome) if outcome.built => {}
                Some(_) => return Requirement::Unbuilt(name.clone()),
                None => return Requirement::Pending,
            }
        }
        Requirement::Met
    }

    /// Final results: units in order, then seeded results
    fn finish(self, seeded: Vec<RunResult>) -> Vec<RunResult> {
        let cancelled = self.cancelled;
        let mut out = Vec::with_capacity(self.units.len() + seeded.len());

        for ((unit, result), tests) in self.units.iter().zip(self.results).zip(self.tests) {
            let mut result = result.unwrap_or_else(|| {
                let reason = if cancelled { "run cancelled" } else { "not started" };
                RunResult::skipped(&unit.name, reason)
            });

            let built = result.status == UnitStatus::Success;
            result.test_results = unit
                .tests
                .iter()
                .zip(tests)
                .map(|(compiled, evaluated)| {
                    evaluated.unwrap_or_else(|| {
                        let reason = if !built {
                            format!("unit '{}' was not built", unit.name)
                        } else if cancelled {
                            "run cancelled".to_string()
                        } else {
                            "required units were not built".to_string()
                        };
                        test_engine::skipped(compiled, reason)
                    })
                })
                .collect();

            out.push(result);
        }

        out.extend(seeded);
        out
    }
}

/// Materialize one unit, timing the whole plan
async fn build(pool: &WarehousePool, unit: &CompiledUnit, timeout: Duration) -> RunResult {
    let started = Instant::now();
    tracing::info!(unit = %unit.name, relation = %unit.relation, materialization = %unit.materialization, "Building unit");

    let outcome = materialize(pool, unit, timeout).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(rows) => RunResult::success(&unit.name, rows, duration_ms),
        Err(e) => {
            if e.is_retryable() {
                tracing::warn!(unit = %unit.name, error = %e, "Unit failed with a retryable error");
            }
            RunResult::failed(&unit.name, e.to_string(), duration_ms)
        }
    }
}

/// Run the unit's materialization plan on one pooled connection
async fn materialize(pool: &WarehousePool, unit: &CompiledUnit, timeout: Duration) -> Result<Option<u64>, ExecutionError> {
    let conn = tokio::time::timeout(timeout, pool.checkout())
        .await
        .map_err(|_| ExecutionError::Timeout(timeout))?
        .map_err(ExecutionError::Pool)?;

    let capabilities = conn.capabilities();
    let existing = with_timeout(timeout, conn.relation_kind(&unit.schema, &unit.name)).await?;
    let plan = Plan::for_unit(
        unit,
        SwapStrategy::new(capabilities.transactional_ddl, capabilities.drop_cascade),
        existing,
    );

    let mut rows = None;
    for step in &plan.steps {
        match step {
            Step::Execute(sql) => {
                tracing::debug!(unit = %unit.name, sql = %sql, "Executing statement");
                with_timeout(timeout, conn.execute(sql)).await?;
            }
            Step::Transaction(statements) => {
                tracing::debug!(unit = %unit.name, statements = statements.len(), "Executing transaction");
                with_timeout(timeout, conn.execute_transaction(statements)).await?;
            }
            Step::CountRows(sql) => {
                rows = Some(with_timeout(timeout, conn.query_count(sql)).await?);
            }
            Step::Replace { statement, restore } => {
                if let Err(e) = with_timeout(timeout, conn.execute(statement)).await {
                    tracing::warn!(unit = %unit.name, error = %e, "Swap failed, restoring previous relation");
                    if let Err(restore_error) = with_timeout(timeout, conn.execute(restore)).await {
                        tracing::error!(unit = %unit.name, error = %restore_error, "Failed to restore previous relation");
                    }
                    return Err(e);
                }
            }
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelflow_core::{Materialization, RelationKind, TestKind, TestSeverity, TestStatus, UnitKind};
    use modelflow_sql::CompiledTest;
    use modelflow_warehouse::{Capabilities, MockWarehouse};
    use pretty_assertions::assert_eq;

    fn unit(name: &str, depends_on: &[&str]) -> CompiledUnit {
        CompiledUnit {
            name: name.to_string(),
            relation: format!("marts.{}", name),
            schema: "marts".to_string(),
            kind: UnitKind::Mart,
            materialization: Materialization::View,
            sql: format!("select 1 as {}_id", name),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            tests: Vec::new(),
            checksum: String::new(),
        }
    }

    fn not_null(unit: &str, requires: &[&str]) -> CompiledTest {
        CompiledTest {
            name: format!("not_null_{}_id", unit),
            kind: TestKind::NotNull,
            column: Some("id".to_string()),
            severity: TestSeverity::Error,
            failing_rows_sql: format!("select * from marts.{} where id is null", unit),
            count_sql: format!("select count(*) from (\nselect * from marts.{} where id is null\n) as mf_failures", unit),
            requires: requires.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn executor(warehouse: Arc<MockWarehouse>, threads: usize) -> Executor {
        Executor::new(WarehousePool::new(warehouse, threads), ExecutorOptions::default())
    }

    fn statuses(results: &[RunResult]) -> Vec<(&str, UnitStatus)> {
        results.iter().map(|r| (r.unit.as_str(), r.status)).collect()
    }

    #[tokio::test]
    async fn dependencies_build_before_dependents() {
        let warehouse = Arc::new(MockWarehouse::new());
        let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["b"])];

        let results = executor(warehouse.clone(), 4).run(&units).await;

        assert_eq!(
            statuses(&results),
            vec![("a", UnitStatus::Success), ("b", UnitStatus::Success), ("c", UnitStatus::Success)]
        );
        let statements = warehouse.statements().await;
        let position = |relation: &str| statements.iter().position(|s| s.contains(relation)).unwrap();
        assert!(position("marts.a ") < position("marts.b "));
        assert!(position("marts.b ") < position("marts.c "));
    }

    #[tokio::test]
    async fn failure_skips_downstream_but_not_siblings() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_on("view marts.a ", "division by zero").await;
        let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["b"]), unit("d", &[])];

        let results = executor(warehouse.clone(), 2).run(&units).await;

        assert_eq!(
            statuses(&results),
            vec![
                ("a", UnitStatus::Failed),
                ("b", UnitStatus::Skipped),
                ("c", UnitStatus::Skipped),
                ("d", UnitStatus::Success),
            ]
        );
        assert!(results[0].message.as_deref().unwrap().contains("division by zero"));
        assert_eq!(results[2].message.as_deref(), Some("upstream 'a' failed"));
        assert_eq!(warehouse.executed("marts.b").await, 0);
        assert_eq!(warehouse.executed("marts.c").await, 0);
    }

    #[tokio::test]
    async fn dependencies_outside_the_run_are_satisfied() {
        let warehouse = Arc::new(MockWarehouse::new());
        let results = executor(warehouse, 1).run(&[unit("b", &["a"])]).await;
        assert_eq!(statuses(&results), vec![("b", UnitStatus::Success)]);
    }

    #[tokio::test]
    async fn seeded_failures_skip_dependents() {
        let warehouse = Arc::new(MockWarehouse::new());
        let seeded = vec![RunResult::failed("a", "unresolved reference 'missing'", 0)];

        let results = executor(warehouse, 1)
            .run_seeded(&[unit("b", &["a"]), unit("d", &[])], seeded)
            .await;

        assert_eq!(
            statuses(&results),
            vec![("b", UnitStatus::Skipped), ("d", UnitStatus::Success), ("a", UnitStatus::Failed)]
        );
        assert_eq!(results[0].message.as_deref(), Some("upstream 'a' failed"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_pool() {
        let warehouse = Arc::new(MockWarehouse::new().with_latency(20));
        let units: Vec<_> = (0..8).map(|i| unit(&format!("u{}", i), &[])).collect();

        let results = executor(warehouse.clone(), 3).run(&units).await;

        assert!(results.iter().all(|r| r.status == UnitStatus::Success));
        assert!(warehouse.peak_concurrency() <= 3);
        assert!(warehouse.peak_concurrency() >= 2);
    }

    #[tokio::test]
    async fn statement_timeout_fails_the_unit() {
        let warehouse = Arc::new(MockWarehouse::new().with_latency(200));
        let options = ExecutorOptions {
            statement_timeout: Duration::from_millis(20),
            test_timing: TestTiming::AfterUnit,
        };

        let results = Executor::new(WarehousePool::new(warehouse, 1), options)
            .run(&[unit("slow", &[])])
            .await;

        assert_eq!(results[0].status, UnitStatus::Failed);
        assert!(results[0].message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn switching_materialization_drops_the_old_relation() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.set_relation("marts.a", RelationKind::Table).await;

        let results = executor(warehouse.clone(), 1).run(&[unit("a", &[])]).await;

        assert_eq!(results[0].status, UnitStatus::Success);
        assert_eq!(
            warehouse.statements().await,
            vec![
                "begin",
                "drop table if exists marts.a",
                "create or replace view marts.a as\nselect 1 as a_id",
                "commit",
            ]
        );
    }

    #[tokio::test]
    async fn failed_swap_restores_the_previous_table() {
        let warehouse = Arc::new(MockWarehouse::new().with_capabilities(Capabilities {
            transactional_ddl: false,
            drop_cascade: false,
        }));
        warehouse.set_relation("marts.a", RelationKind::Table).await;
        warehouse
            .fail_on("alter table marts.a__mf_tmp rename to a", "rename failed")
            .await;

        let mut table = unit("a", &[]);
        table.materialization = Materialization::Table;
        let results = executor(warehouse.clone(), 1).run(&[table]).await;

        assert_eq!(results[0].status, UnitStatus::Failed);
        let statements = warehouse.statements().await;
        assert_eq!(
            &statements[statements.len() - 3..],
            &[
                "alter table marts.a rename to a__mf_backup".to_string(),
                "alter table marts.a__mf_tmp rename to a".to_string(),
                "alter table marts.a__mf_backup rename to a".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_runs_skip_unstarted_units() {
        let warehouse = Arc::new(MockWarehouse::new());
        let token = CancellationToken::new();
        token.cancel();

        let results = executor(warehouse.clone(), 2)
            .with_cancellation(token)
            .run(&[unit("a", &[]), unit("b", &["a"])])
            .await;

        assert_eq!(statuses(&results), vec![("a", UnitStatus::Skipped), ("b", UnitStatus::Skipped)]);
        assert_eq!(results[0].message.as_deref(), Some("run cancelled"));
        assert!(warehouse.statements().await.is_empty());
    }

    #[tokio::test]
    async fn tests_run_after_their_unit() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.set_count("from marts.b where", 2).await;

        let mut a = unit("a", &[]);
        a.tests.push(not_null("a", &[]));
        let mut b = unit("b", &["a"]);
        b.tests.push(not_null("b", &[]));

        let results = executor(warehouse, 2).run(&[a, b]).await;

        assert_eq!(results[0].test_results[0].status, TestStatus::Pass);
        assert_eq!(results[1].test_results[0].status, TestStatus::Fail);
        assert_eq!(results[1].test_results[0].failing_row_count, 2);
    }

    #[tokio::test]
    async fn tests_wait_for_required_units() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_on("view marts.customers ", "boom").await;

        let mut orders = unit("orders", &[]);
        orders.tests.push(not_null("orders", &["customers"]));
        let customers = unit("customers", &[]);

        let results = executor(warehouse, 2).run(&[orders, customers]).await;

        assert_eq!(results[0].status, UnitStatus::Success);
        assert_eq!(results[0].test_results[0].status, TestStatus::Skipped);
        assert_eq!(
            results[0].test_results[0].message.as_deref(),
            Some("required unit 'customers' was not built")
        );
    }

    #[tokio::test]
    async fn tests_of_unbuilt_units_are_skipped() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_on("view marts.a ", "boom").await;
        let mut a = unit("a", &[]);
        a.tests.push(not_null("a", &[]));

        let results = executor(warehouse.clone(), 1).run(&[a]).await;

        assert_eq!(results[0].test_results[0].status, TestStatus::Skipped);
        assert_eq!(warehouse.executed("mf_failures").await, 0);
    }

    #[tokio::test]
    async fn end_of_run_tests_wait_for_every_unit() {
        let warehouse = Arc::new(MockWarehouse::new());
        let options = ExecutorOptions {
            test_timing: TestTiming::EndOfRun,
            ..ExecutorOptions::default()
        };

        let mut a = unit("a", &[]);
        a.tests.push(not_null("a", &[]));
        let b = unit("b", &["a"]);

        let results = Executor::new(WarehousePool::new(warehouse.clone(), 2), options)
            .run(&[a, b])
            .await;

        assert_eq!(results[0].test_results[0].status, TestStatus::Pass);
        let statements = warehouse.statements().await;
        let test_at = statements.iter().position(|s| s.contains("mf_failures")).unwrap();
        let b_at = statements.iter().position(|s| s.contains("view marts.b ")).unwrap();
        assert!(b_at < test_at);
    }
}
