//! SQL compilation
//!
//! This crate handles:
//! - Replacing `ref()` / `source()` markers with qualified relation names
//! - Validating compiled SQL using datafusion-sqlparser-rs
//! - Compiling data tests into failing-rows queries
//! - Planning the statements that materialize a unit

pub mod parser;
pub mod assertion;
pub mod compiler;
pub mod materialize;

pub use parser::SqlParser;
pub use compiler::{compile, CompileError, CompiledTest, CompiledUnit, Compiler};
pub use materialize::{Plan, Step, SwapStrategy, BACKUP_SUFFIX, TMP_SUFFIX};
