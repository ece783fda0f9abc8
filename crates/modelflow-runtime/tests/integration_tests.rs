//! End-to-end runs against DuckDB and the mock warehouse

use modelflow_core::{Backoff, Config, RelationKind, RetryPolicy, RunReport, RunStatus, TestStatus, UnitStatus};
use modelflow_runtime::{
    Executor, ExecutorOptions, JsonLinesRunStore, MemoryRunStore, Notifier, Pipeline, RunStore, Scheduler, Trigger,
};
use modelflow_warehouse::{Capabilities, DuckDbWarehouse, MockWarehouse, Warehouse, WarehousePool};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const ORDERS_PROJECT: &str = r#"
sources:
  raw:
    tables: [orders]

units:
  stg_orders:
    body: "select order_id, status, amount from {{ source('raw', 'orders') }}"
    columns:
      - name: order_id
        tests: [unique, not_null]
      - name: status
        tests:
          - accepted_values:
              values: [P, O, F]
  fct_orders:
    materialization: table
    body: "select status, count(*) as orders, sum(amount) as amount from {{ ref('stg_orders') }} group by status"
"#;

const CHAIN_PROJECT: &str = r#"
units:
  stg_a:
    body: "select 1 as id"
  int_b:
    body: "select * from {{ ref('stg_a') }}"
  mart_c:
    body: "select * from {{ ref('int_b') }}"
  stg_d:
    body: "select 2 as id"
"#;

const SCENARIO_PROJECT: &str = r#"
units:
  stg_orders:
    materialization: view
    body: "select * from (values (1, 'P'), (2, 'O'), (3, 'F')) t(order_id, status)"
  fct_orders:
    materialization: table
    body: "select order_id, status from {{ ref('stg_orders') }}"
    columns:
      - name: order_id
        tests: [not_null]
"#;

const RELATIONSHIP_PROJECT: &str = r#"
units:
  stg_a:
    body: "select 1 as id"
  stg_d:
    body: "select 1 as a_id"
    columns:
      - name: a_id
        tests:
          - relationships:
              to: ref('stg_a')
              field: id
"#;

const CASCADE_PROJECT: &str = r#"
units:
  stg_t:
    materialization: table
    body: "select 1 as id"
  int_v:
    body: "select * from {{ ref('stg_t') }}"
  mart_v:
    body: "select * from {{ ref('int_v') }}"
  fct_t:
    materialization: table
    body: "select * from {{ ref('mart_v') }}"
  rpt_v:
    body: "select * from {{ ref('fct_t') }}"
"#;

fn switch_project(materialization: &str) -> String {
    format!(
        r#"
units:
  stg_x:
    materialization: {}
    body: "select * from range(5) t(id)"
"#,
        materialization
    )
}

fn load(root: &Path, definitions: &str) -> Arc<Pipeline> {
    std::fs::write(root.join("modelflow.yml"), definitions).unwrap();
    let config = Config {
        project_root: root.to_path_buf(),
        ..Config::default()
    };
    Arc::new(Pipeline::from_config(&config).unwrap())
}

fn scheduler(pipeline: Arc<Pipeline>, warehouse: Arc<dyn Warehouse>, store: Arc<dyn RunStore>) -> Scheduler {
    let executor = Executor::new(WarehousePool::new(warehouse, 4), ExecutorOptions::default());
    Scheduler::new(pipeline, executor, store)
}

async fn seed_orders(warehouse: &DuckDbWarehouse, rows: &str) {
    warehouse.ensure_schema("raw").await.unwrap();
    warehouse
        .execute(&format!(
            "create or replace table raw.orders as select * from (values {}) t(order_id, status, amount)",
            rows
        ))
        .await
        .unwrap();
}

fn test_status(report: &RunReport, unit: &str, test: &str) -> (TestStatus, u64) {
    let result = report
        .result(unit)
        .unwrap()
        .test_results
        .iter()
        .find(|t| t.test == test)
        .unwrap();
    (result.status, result.failing_row_count)
}

#[derive(Default)]
struct RecordingNotifier {
    runs: Mutex<Vec<RunStatus>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, report: &RunReport) {
        self.runs.lock().await.push(report.status);
    }
}

#[tokio::test]
async fn builds_staging_view_and_fact_table() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), ORDERS_PROJECT);

    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());
    seed_orders(&warehouse, "(1, 'P', 10), (2, 'O', 20), (3, 'F', 30), (4, 'P', 5)").await;

    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let order: Vec<_> = report.results.iter().map(|r| r.unit.as_str()).collect();
    assert_eq!(order, vec!["stg_orders", "fct_orders"]);

    let fct = report.result("fct_orders").unwrap();
    assert_eq!(fct.rows_affected, Some(3));
    assert_eq!(report.result("stg_orders").unwrap().rows_affected, None);
    assert!(report.result("stg_orders").unwrap().test_results.iter().all(|t| t.passed()));

    assert_eq!(
        warehouse
            .query_count("select count(*) from marts.fct_orders where status = 'P'")
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        warehouse.query_count("select count(*) from staging.stg_orders").await.unwrap(),
        4
    );
}

#[tokio::test]
async fn rebuilding_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), ORDERS_PROJECT);

    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());
    seed_orders(&warehouse, "(1, 'P', 10), (2, 'O', 20)").await;

    let scheduler = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()));
    let first = scheduler.run_cycle().await.unwrap();
    warehouse
        .execute("create table main.first_fct as select * from marts.fct_orders")
        .await
        .unwrap();
    warehouse
        .execute("create table main.first_stg as select * from staging.stg_orders")
        .await
        .unwrap();
    let second = scheduler.run_cycle().await.unwrap();

    assert!(first.is_success());
    assert!(second.is_success());

    // Same rows, compared as multisets in both directions
    for (live, snapshot) in [("marts.fct_orders", "main.first_fct"), ("staging.stg_orders", "main.first_stg")] {
        for (a, b) in [(live, snapshot), (snapshot, live)] {
            let sql = format!("select count(*) from (select * from {} except all select * from {})", a, b);
            assert_eq!(warehouse.query_count(&sql).await.unwrap(), 0, "{} differs from {}", a, b);
        }
    }
    assert_eq!(
        first.result("fct_orders").unwrap().rows_affected,
        second.result("fct_orders").unwrap().rows_affected
    );
    assert_eq!(warehouse.query_count("select count(*) from marts.fct_orders").await.unwrap(), 2);
    assert_eq!(
        warehouse
            .query_count("select count(*) from information_schema.tables where table_name = 'fct_orders__mf_tmp'")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn unique_counts_every_row_of_a_duplicate_group() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), ORDERS_PROJECT);

    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());
    seed_orders(&warehouse, "(1, 'P', 10), (1, 'P', 10), (1, 'O', 10), (2, 'F', 5)").await;

    let report = scheduler(pipeline.clone(), warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(
        test_status(&report, "stg_orders", "unique_stg_orders_order_id"),
        (TestStatus::Fail, 3)
    );
    assert_eq!(
        test_status(&report, "stg_orders", "not_null_stg_orders_order_id"),
        (TestStatus::Pass, 0)
    );

    // Test failures only fail strict runs
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.failed_tests().len(), 1);

    let strict = scheduler(pipeline, warehouse, Arc::new(MemoryRunStore::new()))
        .strict(true)
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(strict.status, RunStatus::Failed);
}

#[tokio::test]
async fn accepted_values_reports_unexpected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), ORDERS_PROJECT);

    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());
    seed_orders(&warehouse, "(1, 'P', 10), (2, 'X', 20), (3, 'F', 30)").await;

    let report = scheduler(pipeline, warehouse, Arc::new(MemoryRunStore::new()))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(
        test_status(&report, "stg_orders", "accepted_values_stg_orders_status"),
        (TestStatus::Fail, 1)
    );
}

#[tokio::test]
async fn failed_unit_skips_its_downstream_only() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CHAIN_PROJECT);

    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.fail_on("view staging.stg_a ", "relation raw.a does not exist").await;
    let notifier = Arc::new(RecordingNotifier::default());

    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .with_notifier(notifier.clone())
        .run_cycle()
        .await
        .unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| (r.unit.as_str(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("stg_a", UnitStatus::Failed),
            ("int_b", UnitStatus::Skipped),
            ("mart_c", UnitStatus::Skipped),
            ("stg_d", UnitStatus::Success),
        ]
    );
    assert_eq!(report.result("mart_c").unwrap().message.as_deref(), Some("upstream 'stg_a' failed"));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(warehouse.executed("intermediate.int_b").await, 0);
    assert_eq!(*notifier.runs.lock().await, vec![RunStatus::Failed]);
}

#[tokio::test]
async fn retries_rerun_failed_units_and_their_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CHAIN_PROJECT);

    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.fail_times("view staging.stg_a ", "connection reset", 1).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let retry = RetryPolicy {
        max_retries: 2,
        backoff: Backoff::Fixed,
        base_delay_ms: 1,
        max_delay_ms: 1,
    };

    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .with_retry(retry)
        .with_notifier(notifier.clone())
        .run_cycle()
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.attempts, 2);
    assert_eq!(report.result("stg_a").unwrap().attempts, 2);
    assert_eq!(report.result("mart_c").unwrap().attempts, 1);
    assert_eq!(report.result("stg_d").unwrap().attempts, 1);

    // stg_d succeeded the first time and is not rebuilt
    assert_eq!(warehouse.executed("view staging.stg_d ").await, 1);
    assert!(notifier.runs.lock().await.is_empty());
}

#[tokio::test]
async fn selection_limits_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CHAIN_PROJECT);
    let selected = pipeline.select(&["int_b+".parse().unwrap()]).unwrap();

    let warehouse = Arc::new(MockWarehouse::new());
    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .with_selection(selected)
        .run_cycle()
        .await
        .unwrap();

    let units: Vec<_> = report.results.iter().map(|r| r.unit.as_str()).collect();
    assert_eq!(units, vec!["int_b", "mart_c"]);
    assert_eq!(warehouse.executed("staging.stg_a").await, 0);
}

#[tokio::test]
async fn run_history_is_appended_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CHAIN_PROJECT);
    let store = Arc::new(JsonLinesRunStore::new(dir.path().join("target").join("run_log.jsonl")));

    let scheduler = scheduler(pipeline, Arc::new(MockWarehouse::new()), store.clone());
    let (events, receiver) = tokio::sync::mpsc::channel(8);
    for _ in 0..3 {
        events.send(()).await.unwrap();
    }
    drop(events);

    // Queued events coalesce into one cycle
    let cycles = scheduler.schedule(Trigger::Events(receiver)).await;
    assert_eq!(cycles, 1);

    assert_eq!(scheduler.schedule(Trigger::Once).await, 1);

    let history = store.history(None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.is_success()));
    assert_ne!(history[0].run_id, history[1].run_id);
}

#[tokio::test]
async fn cancelled_schedule_stops_before_the_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CHAIN_PROJECT);
    let store = Arc::new(MemoryRunStore::new());

    let scheduler = scheduler(pipeline, Arc::new(MockWarehouse::new()), store.clone());
    let token = scheduler.cancellation().clone();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
    });

    let cycles = scheduler
        .schedule(Trigger::Interval(std::time::Duration::from_secs(3600)))
        .await;
    canceller.await.unwrap();

    assert_eq!(cycles, 1);
    assert_eq!(store.history(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn orders_scenario_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), SCENARIO_PROJECT);

    assert_eq!(pipeline.graph().order().to_vec(), vec!["stg_orders", "fct_orders"]);
    let plan = pipeline.plan_all();
    assert!(plan.unit("fct_orders").unwrap().sql.contains("from staging.stg_orders"));

    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());
    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let order: Vec<_> = report.results.iter().map(|r| (r.unit.as_str(), r.status)).collect();
    assert_eq!(
        order,
        vec![("stg_orders", UnitStatus::Success), ("fct_orders", UnitStatus::Success)]
    );
    assert_eq!(
        test_status(&report, "fct_orders", "not_null_fct_orders_order_id"),
        (TestStatus::Pass, 0)
    );
    assert_eq!(warehouse.relation_kind("staging", "stg_orders").await.unwrap(), Some(RelationKind::View));
    assert_eq!(warehouse.relation_kind("marts", "fct_orders").await.unwrap(), Some(RelationKind::Table));
}

#[tokio::test]
async fn changing_materialization_replaces_the_relation() {
    let dir = tempfile::tempdir().unwrap();
    let warehouse = Arc::new(DuckDbWarehouse::open_in_memory().unwrap());

    for (materialization, kind) in [
        ("view", RelationKind::View),
        ("table", RelationKind::Table),
        ("view", RelationKind::View),
    ] {
        let pipeline = load(dir.path(), &switch_project(materialization));
        let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
            .run_cycle()
            .await
            .unwrap();

        let result = report.result("stg_x").unwrap();
        assert_eq!(result.status, UnitStatus::Success, "{}: {:?}", materialization, result.message);
        assert_eq!(warehouse.relation_kind("staging", "stg_x").await.unwrap(), Some(kind));
        assert_eq!(warehouse.query_count("select count(*) from staging.stg_x").await.unwrap(), 5);
    }
}

#[tokio::test]
async fn retried_units_unblock_tests_that_read_from_them() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), RELATIONSHIP_PROJECT);

    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.fail_times("view staging.stg_a ", "connection reset", 1).await;
    let retry = RetryPolicy {
        max_retries: 1,
        backoff: Backoff::Fixed,
        base_delay_ms: 1,
        max_delay_ms: 1,
    };

    let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
        .with_retry(retry)
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.result("stg_a").unwrap().attempts, 2);
    assert_eq!(
        test_status(&report, "stg_d", "relationships_stg_d_a_id"),
        (TestStatus::Pass, 0)
    );

    // stg_d itself is not rebuilt
    assert_eq!(warehouse.executed("view staging.stg_d ").await, 1);
}

#[tokio::test]
async fn cascading_warehouses_rebuild_dropped_views() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load(dir.path(), CASCADE_PROJECT);

    let run = |drop_cascade: bool| {
        let pipeline = pipeline.clone();
        async move {
            let warehouse = Arc::new(MockWarehouse::new().with_capabilities(Capabilities {
                transactional_ddl: true,
                drop_cascade,
            }));
            let report = scheduler(pipeline, warehouse.clone(), Arc::new(MemoryRunStore::new()))
                .with_selection(vec!["stg_t".to_string()])
                .run_cycle()
                .await
                .unwrap();
            let units: Vec<String> = report.results.iter().map(|r| r.unit.clone()).collect();
            (units, warehouse)
        }
    };

    // Views on top of stg_t are dropped with it; the table fct_t keeps its data
    let (units, warehouse) = run(true).await;
    assert_eq!(units, vec!["stg_t", "int_v", "mart_v"]);
    assert_eq!(warehouse.executed("drop table if exists staging.stg_t cascade").await, 1);
    assert_eq!(warehouse.executed("fct_t").await, 0);

    let (units, _) = run(false).await;
    assert_eq!(units, vec!["stg_t"]);
}
