//! Transformation units, their references and their test assertions

use serde::{Deserialize, Serialize};

/// Layer a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Light cleanup of a single source
    Staging,

    /// Reusable building blocks between staging and marts
    Intermediate,

    /// Business-facing entities
    Mart,

    /// Event / transaction grain tables
    Fact,
}

impl UnitKind {
    /// Infer a kind from the dbt naming convention (`stg_`, `int_`, `fct_`)
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("stg_") {
            Self::Staging
        } else if name.starts_with("int_") {
            Self::Intermediate
        } else if name.starts_with("fct_") {
            Self::Fact
        } else {
            Self::Mart
        }
    }

    /// Parse a kind from a directory or config name
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "staging" => Some(Self::Staging),
            "intermediate" => Some(Self::Intermediate),
            "mart" | "marts" => Some(Self::Mart),
            "fact" | "facts" => Some(Self::Fact),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Intermediate => "intermediate",
            Self::Mart => "mart",
            Self::Fact => "fact",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a unit is persisted in the warehouse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// `create or replace view`
    #[default]
    View,

    /// Full-refresh table with an atomic swap
    Table,
}

impl std::fmt::Display for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Kind of an existing warehouse relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Table,
    View,
}

impl From<Materialization> for RelationKind {
    fn from(materialization: Materialization) -> Self {
        match materialization {
            Materialization::View => Self::View,
            Materialization::Table => Self::Table,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::View => write!(f, "view"),
        }
    }
}

/// A reference marker found in a SQL body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reference {
    /// `{{ ref('unit_name') }}`
    Unit { name: String },

    /// `{{ source('source_name', 'table_name') }}`
    Source {
        source_name: String,
        table_name: String,
    },
}

impl Reference {
    pub fn unit(name: impl Into<String>) -> Self {
        Self::Unit { name: name.into() }
    }

    pub fn source(source_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Identifier used in error messages and lookups
    ///
    /// Units are keyed by their name, sources by `source_name.table_name`.
    pub fn identifier(&self) -> String {
        match self {
            Self::Unit { name } => name.clone(),
            Self::Source { source_name, table_name } => format!("{}.{}", source_name, table_name),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit { name } => write!(f, "ref('{}')", name),
            Self::Source { source_name, table_name } => {
                write!(f, "source('{}', '{}')", source_name, table_name)
            }
        }
    }
}

/// An external table the project reads from but never builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Logical source name (e.g. "raw")
    pub source_name: String,

    /// Logical table name (e.g. "orders")
    pub table_name: String,

    /// Physical location in the warehouse (e.g. "raw.orders")
    pub location: String,
}

impl Source {
    pub fn new(
        source_name: impl Into<String>,
        table_name: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            table_name: table_name.into(),
            location: location.into(),
        }
    }

    /// Lookup key (`source_name.table_name`)
    pub fn key(&self) -> String {
        format!("{}.{}", self.source_name, self.table_name)
    }
}

/// Kind of a test assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Unique,
    NotNull,
    Relationships,
    AcceptedValues,
    Singular,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::NotNull => "not_null",
            Self::Relationships => "relationships",
            Self::AcceptedValues => "accepted_values",
            Self::Singular => "singular",
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failing test fails the run in strict mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    #[default]
    Error,
    Warn,
}

/// A literal in an `accepted_values` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcceptedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AcceptedValue {
    /// Render as a SQL literal
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "true".to_string() } else { "false".to_string() },
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

/// What a test asserts about its unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// No two rows share a non-null value
    Unique { column: String },

    /// No row has a null value
    NotNull { column: String },

    /// Every non-null value exists in `to.field`
    Relationships {
        column: String,
        to: Reference,
        field: String,
    },

    /// Every non-null value is one of `values`
    AcceptedValues {
        column: String,
        values: Vec<AcceptedValue>,
    },

    /// Raw query expected to return zero rows
    Singular { sql: String },
}

impl Assertion {
    pub fn kind(&self) -> TestKind {
        match self {
            Self::Unique { .. } => TestKind::Unique,
            Self::NotNull { .. } => TestKind::NotNull,
            Self::Relationships { .. } => TestKind::Relationships,
            Self::AcceptedValues { .. } => TestKind::AcceptedValues,
            Self::Singular { .. } => TestKind::Singular,
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Unique { column }
            | Self::NotNull { column }
            | Self::Relationships { column, .. }
            | Self::AcceptedValues { column, .. } => Some(column),
            Self::Singular { .. } => None,
        }
    }
}

/// A data test owned by a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    /// Unique test name (generated for generic tests)
    pub name: String,

    /// Unit the test belongs to
    pub target_unit: String,

    #[serde(default)]
    pub severity: TestSeverity,

    pub assertion: Assertion,

    /// References used by the test besides its own unit
    ///
    /// Filled from `relationships.to` and from markers in singular SQL.
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Test {
    /// Build a test with the generated `<kind>_<unit>[_<column>]` name
    pub fn generic(target_unit: impl Into<String>, assertion: Assertion) -> Self {
        let target_unit = target_unit.into();
        let name = match assertion.column() {
            Some(column) => format!("{}_{}_{}", assertion.kind(), target_unit, column),
            None => format!("{}_{}", assertion.kind(), target_unit),
        };
        let references = match &assertion {
            Assertion::Relationships { to, .. } => vec![to.clone()],
            _ => Vec::new(),
        };

        Self {
            name,
            target_unit,
            severity: TestSeverity::Error,
            assertion,
            references,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_severity(mut self, severity: TestSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }

    pub fn kind(&self) -> TestKind {
        self.assertion.kind()
    }

    pub fn target_column(&self) -> Option<&str> {
        self.assertion.column()
    }
}

/// A declarative transformation unit (a dbt "model")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Unique name, also the relation name in the warehouse
    pub name: String,

    pub kind: UnitKind,

    pub materialization: Materialization,

    /// Raw templated SQL
    pub body: String,

    /// Reference markers in body order
    pub references: Vec<Reference>,

    pub tests: Vec<Test>,

    /// Schema override; the kind's configured schema is used otherwise
    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub description: String,
}

impl Unit {
    /// Names of the units this unit depends on, first occurrence order
    pub fn unit_references(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for reference in &self.references {
            if let Reference::Unit { name } = reference {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Source references in body order
    pub fn source_references(&self) -> impl Iterator<Item = &Reference> {
        self.references
            .iter()
            .filter(|r| matches!(r, Reference::Source { .. }))
    }
}

/// Whether `value` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`)
pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
