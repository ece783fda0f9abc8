//! Reference compilation
//!
//! Replaces `ref()` / `source()` markers with qualified relation names and
//! compiles each test into its failing-rows query. Compilation is pure: it
//! never touches the warehouse.

use crate::assertion;
use crate::parser::SqlParser;
use modelflow_core::{
    Assertion, Materialization, Reference, SchemaConfig, Test, TestKind, TestSeverity, Unit,
    UnitKind,
};
use modelflow_project::{Catalog, DependencyGraph, NodeInfo, ReferenceScanner};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors raised while compiling a unit
///
/// Both are fatal to the affected unit only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("unit '{unit}': unresolved reference '{identifier}'")]
    UnresolvedReference { unit: String, identifier: String },

    #[error("unit '{unit}': invalid SQL: {message}")]
    InvalidSql { unit: String, message: String },
}

impl CompileError {
    pub fn unit(&self) -> &str {
        match self {
            Self::UnresolvedReference { unit, .. } | Self::InvalidSql { unit, .. } => unit,
        }
    }
}

/// A test ready to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTest {
    pub name: String,
    pub kind: TestKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    pub severity: TestSeverity,

    /// Query returning the violating rows
    pub failing_rows_sql: String,

    /// Query counting the violating rows
    pub count_sql: String,

    /// Units besides the target that must be built before the test runs
    pub requires: Vec<String>,
}

/// A unit with references replaced by relation names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub name: String,

    /// Qualified `{schema}.{name}`
    pub relation: String,

    pub schema: String,

    pub kind: UnitKind,

    pub materialization: Materialization,

    /// Compiled body (a single query)
    pub sql: String,

    /// Units this unit depends on
    pub depends_on: Vec<String>,

    pub tests: Vec<CompiledTest>,

    /// sha256 of the compiled body
    pub checksum: String,
}

/// Compiles units against a resolved graph
#[derive(Debug)]
pub struct Compiler {
    schemas: SchemaConfig,
    validator: Option<SqlParser>,
}

impl Compiler {
    pub fn new(schemas: SchemaConfig) -> Self {
        Self {
            schemas,
            validator: None,
        }
    }

    /// Parse compiled SQL with `parser` and reject anything but a single query
    pub fn with_validation(mut self, parser: SqlParser) -> Self {
        self.validator = Some(parser);
        self
    }

    /// Schema a node is materialized in
    pub fn schema_for(&self, node: &NodeInfo) -> String {
        node.schema
            .clone()
            .unwrap_or_else(|| self.schemas.schema_for(node.kind).to_string())
    }

    /// Qualified relation name of a unit in the graph
    pub fn relation_for(&self, name: &str, node: &NodeInfo) -> String {
        format!("{}.{}", self.schema_for(node), name)
    }

    /// Compile one unit
    pub fn compile(&self, unit: &Unit, graph: &DependencyGraph) -> Result<CompiledUnit, CompileError> {
        let node = graph.node(&unit.name).ok_or_else(|| CompileError::UnresolvedReference {
            unit: unit.name.clone(),
            identifier: unit.name.clone(),
        })?;

        let sql = self.render(&unit.name, &unit.body, graph)?;
        self.validate(&unit.name, &sql)?;

        let schema = self.schema_for(node);
        let relation = format!("{}.{}", schema, unit.name);

        let tests = unit
            .tests
            .iter()
            .map(|test| self.compile_test(unit, &relation, test, graph))
            .collect::<Result<Vec<_>, _>>()?;

        let checksum = hex::encode(Sha256::digest(sql.as_bytes()));

        tracing::debug!(unit = %unit.name, relation = %relation, "Compiled unit");

        Ok(CompiledUnit {
            name: unit.name.clone(),
            relation,
            schema,
            kind: unit.kind,
            materialization: unit.materialization,
            sql,
            depends_on: unit.unit_references().into_iter().map(str::to_string).collect(),
            tests,
            checksum,
        })
    }

    /// Compile every unit of `names` (topological order expected)
    ///
    /// Failures are returned per unit so the caller can keep going with the
    /// units that compiled.
    pub fn compile_all(
        &self,
        catalog: &Catalog,
        graph: &DependencyGraph,
        names: &[String],
    ) -> Vec<Result<CompiledUnit, CompileError>> {
        names
            .iter()
            .map(|name| match catalog.unit(name) {
                Some(unit) => self.compile(unit, graph),
                None => Err(CompileError::UnresolvedReference {
                    unit: name.clone(),
                    identifier: name.clone(),
                }),
            })
            .collect()
    }

    /// Replace markers in `sql` with relation names
    pub fn render(&self, unit: &str, sql: &str, graph: &DependencyGraph) -> Result<String, CompileError> {
        let stripped = ReferenceScanner::strip_comments(sql);
        let markers = ReferenceScanner::scan(&stripped).map_err(|e| CompileError::InvalidSql {
            unit: unit.to_string(),
            message: e.to_string(),
        })?;

        let mut rendered = String::with_capacity(stripped.len());
        let mut cursor = 0;

        for marker in markers {
            rendered.push_str(&stripped[cursor..marker.span.start]);
            rendered.push_str(&self.resolve(unit, &marker.reference, graph)?);
            cursor = marker.span.end;
        }
        rendered.push_str(&stripped[cursor..]);

        Ok(rendered.trim().trim_end_matches(';').trim_end().to_string())
    }

    /// Relation name a reference compiles to
    pub fn resolve(&self, unit: &str, reference: &Reference, graph: &DependencyGraph) -> Result<String, CompileError> {
        let unresolved = || CompileError::UnresolvedReference {
            unit: unit.to_string(),
            identifier: reference.identifier(),
        };

        match reference {
            Reference::Unit { name } => {
                let node = graph.node(name).ok_or_else(unresolved)?;
                Ok(self.relation_for(name, node))
            }
            Reference::Source { source_name, table_name } => graph
                .source(source_name, table_name)
                .map(|source| source.location.clone())
                .ok_or_else(unresolved),
        }
    }

    fn validate(&self, unit: &str, sql: &str) -> Result<(), CompileError> {
        match &self.validator {
            Some(parser) => parser.validate_query(sql).map_err(|message| CompileError::InvalidSql {
                unit: unit.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    fn compile_test(
        &self,
        unit: &Unit,
        relation: &str,
        test: &Test,
        graph: &DependencyGraph,
    ) -> Result<CompiledTest, CompileError> {
        let failing_rows_sql = match &test.assertion {
            Assertion::Unique { column } => assertion::unique(relation, column),
            Assertion::NotNull { column } => assertion::not_null(relation, column),
            Assertion::AcceptedValues { column, values } => {
                assertion::accepted_values(relation, column, values)
            }
            Assertion::Relationships { column, to, field } => {
                let parent = self.resolve(&unit.name, to, graph)?;
                assertion::relationships(relation, column, &parent, field)
            }
            Assertion::Singular { sql } => {
                let rendered = self.render(&unit.name, sql, graph)?;
                self.validate(&unit.name, &rendered)?;
                rendered
            }
        };

        let mut requires: Vec<String> = Vec::new();
        for reference in &test.references {
            if let Reference::Unit { name } = reference {
                if name != &unit.name && !requires.contains(name) {
                    requires.push(name.clone());
                }
            }
        }

        Ok(CompiledTest {
            name: test.name.clone(),
            kind: test.kind(),
            column: test.target_column().map(str::to_string),
            severity: test.severity,
            count_sql: assertion::count(&failing_rows_sql),
            failing_rows_sql,
            requires,
        })
    }
}

/// Compile one unit with the per-kind schema mapping and no validation
pub fn compile(unit: &Unit, graph: &DependencyGraph, schemas: &SchemaConfig) -> Result<CompiledUnit, CompileError> {
    Compiler::new(schemas.clone()).compile(unit, graph)
}
