//! Project loading and DAG construction
//!
//! This crate handles:
//! - Parsing definitions files (YAML / JSON) and discovering `.sql` files
//! - Scanning `ref()` / `source()` markers
//! - Validating units into a catalog
//! - Building the dependency graph (DAG) and selecting subsets of it

pub mod definition;
pub mod reference;
pub mod registry;
pub mod dag;
pub mod selector;

pub use definition::{ColumnDefinition, ProjectFile, SourceDefinition, SourceTable, TestArgs, TestDefinition, UnitDefinition};
pub use reference::{Marker, ReferenceScanner, ScanError};
pub use registry::{Catalog, RegistryError, DEFINITIONS_FILE};
pub use dag::{resolve, DependencyGraph, NodeId, NodeInfo, ResolveError};
pub use selector::{select, SelectError, Selector};
