//! Modelflow Runtime
//!
//! Executes a resolved project against a warehouse.
//!
//! This crate handles:
//! - Parallel materialization of compiled units in dependency order
//! - Failure isolation (dependents of a failed unit are skipped)
//! - Data test evaluation
//! - Run cycles with retries, run history and failure notifications

pub mod error;
pub mod executor;
pub mod test_engine;
pub mod pipeline;
pub mod store;
pub mod notify;
pub mod scheduler;

pub use error::ExecutionError;
pub use executor::{Executor, ExecutorOptions};
pub use test_engine::TestEngine;
pub use pipeline::{Pipeline, PipelineError, RunPlan};
pub use store::{JsonLinesRunStore, MemoryRunStore, RunStore, StoreError};
pub use notify::{LogNotifier, Notifier};
pub use scheduler::{Scheduler, SchedulerError, Trigger};
