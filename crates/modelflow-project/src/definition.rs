//! Definitions file parsing (`modelflow.yml` / `modelflow.json`)
//!
//! ```yaml
//! sources:
//!   raw:
//!     schema: raw_data
//!     tables: [orders, { name: customers, identifier: raw_customers }]
//!
//! units:
//!   stg_orders:
//!     body: select * from {{ source('raw', 'orders') }}
//!     columns:
//!       - name: order_id
//!         tests: [unique, not_null]
//!   fct_orders:
//!     materialization: table
//!     path: models/fct_orders.sql
//! ```
//!
//! `units` may also be a list of entries that carry their own `name`.

use crate::registry::RegistryError;
use indexmap::IndexMap;
use modelflow_core::{AcceptedValue, Source, TestSeverity};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Parsed definitions file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub sources: IndexMap<String, SourceDefinition>,

    #[serde(default)]
    pub units: UnitDefinitions,
}

impl ProjectFile {
    /// Load a definitions file, choosing the format from the extension
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| RegistryError::Parse(e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        serde_json::from_str(json).map_err(|e| RegistryError::Parse(e.to_string()))
    }

    /// Flatten the `sources` mapping into source records
    pub fn source_records(&self) -> Vec<Source> {
        self.sources
            .iter()
            .flat_map(|(source_name, definition)| {
                definition.tables.iter().map(move |table| {
                    Source::new(
                        source_name.clone(),
                        table.name(),
                        definition.location(source_name, table),
                    )
                })
            })
            .collect()
    }
}

/// A named group of external tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    #[serde(default)]
    pub database: Option<String>,

    /// Physical schema; defaults to the source name
    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub tables: Vec<SourceTable>,
}

impl SourceDefinition {
    /// Physical `[database.]schema.identifier` of a table
    pub fn location(&self, source_name: &str, table: &SourceTable) -> String {
        let schema = self.schema.as_deref().unwrap_or(source_name);
        match &self.database {
            Some(database) => format!("{}.{}.{}", database, schema, table.identifier()),
            None => format!("{}.{}", schema, table.identifier()),
        }
    }
}

/// Table entry: a bare name or a name with a physical identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceTable {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        identifier: Option<String>,
    },
}

impl SourceTable {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Detailed { name, .. } => name,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, identifier } => identifier.as_deref().unwrap_or(name),
        }
    }
}

/// One unit entry, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Taken from the mapping key when `units` is a mapping
    #[serde(default)]
    pub name: Option<String>,

    /// `staging`, `intermediate`, `mart` or `fact`; inferred from the name when absent
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub materialization: Option<modelflow_core::Materialization>,

    /// Inline SQL body
    #[serde(default)]
    pub body: Option<String>,

    /// SQL file holding the body
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Unit-level tests (column given in the arguments)
    #[serde(default)]
    pub tests: Vec<TestDefinition>,

    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
}

/// Documented column with its tests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tests: Vec<TestDefinition>,
}

/// A test entry: `unique` or `{ accepted_values: { values: [...] } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestDefinition {
    Bare(String),
    Keyed(IndexMap<String, TestArgs>),
}

impl TestDefinition {
    /// Test kind name and its arguments
    ///
    /// `None` when a keyed entry does not hold exactly one test.
    pub fn parts(&self) -> Option<(&str, TestArgs)> {
        match self {
            Self::Bare(kind) => Some((kind.as_str(), TestArgs::default())),
            Self::Keyed(map) if map.len() == 1 => {
                map.iter().next().map(|(kind, args)| (kind.as_str(), args.clone()))
            }
            Self::Keyed(_) => None,
        }
    }
}

/// Arguments of a test entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestArgs {
    #[serde(default, alias = "column_name")]
    pub column: Option<String>,

    /// `accepted_values`
    #[serde(default)]
    pub values: Option<Vec<AcceptedValue>>,

    /// `relationships` parent: `ref('x')`, `source('a', 'b')` or a unit name
    #[serde(default)]
    pub to: Option<String>,

    /// `relationships` parent column
    #[serde(default)]
    pub field: Option<String>,

    /// `singular` inline query
    #[serde(default)]
    pub sql: Option<String>,

    /// `singular` query file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Overrides the generated name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub severity: Option<TestSeverity>,
}

/// Unit entries in file order
///
/// Accepts either a list or a mapping. Duplicate mapping keys are kept so the
/// registry can report them instead of silently keeping the last one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitDefinitions(pub Vec<UnitDefinition>);

impl UnitDefinitions {
    pub fn into_inner(self) -> Vec<UnitDefinition> {
        self.0
    }
}

impl<'de> Deserialize<'de> for UnitDefinitions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UnitsVisitor;

        impl<'de> Visitor<'de> for UnitsVisitor {
            type Value = UnitDefinitions;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a list of unit definitions or a mapping of unit name to definition")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(UnitDefinitions::default())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut units = Vec::new();
                while let Some(unit) = seq.next_element::<UnitDefinition>()? {
                    units.push(unit);
                }
                Ok(UnitDefinitions(units))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut units = Vec::new();
                while let Some((name, mut unit)) = map.next_entry::<String, UnitDefinition>()? {
                    unit.name = Some(name);
                    units.push(unit);
                }
                Ok(UnitDefinitions(units))
            }
        }

        deserializer.deserialize_any(UnitsVisitor)
    }
}
