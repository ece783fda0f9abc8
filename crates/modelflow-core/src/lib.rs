//! Modelflow Core
//!
//! Domain model shared by every crate: units and their tests, run reports
//! and the project configuration.
//! Report fields are part of the public output format - add, never rename.

pub mod unit;
pub mod report;
pub mod config;

pub use unit::{
    is_identifier, AcceptedValue, Assertion, Materialization, Reference, RelationKind, Source, Test,
    TestKind, TestSeverity, Unit, UnitKind,
};
pub use report::{
    ReportVersion, RunReport, RunResult, RunStatus, RunSummary, TestResult, TestStatus, UnitStatus,
};
pub use config::{
    Backoff, Config, ConfigError, DialectConfig, ExecutionConfig, RetryPolicy, ScheduleConfig,
    SchemaConfig, TestTiming, WarehouseConfig,
};
