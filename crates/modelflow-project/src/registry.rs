//! Model registry
//!
//! Turns raw definitions (and `.sql` files discovered on disk) into a
//! validated, immutable [`Catalog`] of units and sources.

use crate::definition::{ProjectFile, TestArgs, TestDefinition, UnitDefinition};
use crate::reference::ReferenceScanner;
use indexmap::IndexMap;
use modelflow_core::{is_identifier, Assertion, Reference, Source, Test, Unit, UnitKind};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Default definitions file name inside a project directory
pub const DEFINITIONS_FILE: &str = "modelflow.yml";

/// Errors raised while loading units
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate unit name '{name}'")]
    DuplicateName { name: String },

    #[error("malformed unit '{unit}': {reason}")]
    MalformedUnit { unit: String, reason: String },

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse definitions: {0}")]
    Parse(String),
}

impl RegistryError {
    fn malformed(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedUnit {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

/// Validated units and sources, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    units: IndexMap<String, Unit>,

    /// Keyed by `source_name.table_name`
    sources: IndexMap<String, Source>,
}

impl Catalog {
    /// Validate definitions and build the catalog
    ///
    /// Relative body paths are read relative to the current directory; use
    /// [`Catalog::from_project`] to load a project directory.
    pub fn load(definitions: Vec<UnitDefinition>, sources: Vec<Source>) -> Result<Self, RegistryError> {
        let units = definitions
            .into_iter()
            .enumerate()
            .map(|(index, definition)| build_unit(index, definition))
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_units(units, sources)
    }

    /// Build a catalog from already constructed units
    pub fn from_units(units: Vec<Unit>, sources: Vec<Source>) -> Result<Self, RegistryError> {
        let mut catalog = Self::default();

        for source in sources {
            catalog.sources.insert(source.key(), source);
        }

        for unit in units {
            if !is_identifier(&unit.name) {
                return Err(RegistryError::malformed(&unit.name, "name is not a valid SQL identifier"));
            }
            if catalog.units.contains_key(&unit.name) {
                return Err(RegistryError::DuplicateName { name: unit.name });
            }
            catalog.units.insert(unit.name.clone(), unit);
        }

        tracing::debug!(
            units = catalog.units.len(),
            sources = catalog.sources.len(),
            "Loaded catalog"
        );

        Ok(catalog)
    }

    /// Parse a definitions file; body paths are relative to its directory
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let file = ProjectFile::from_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_project_file(file, base_dir)
    }

    /// Build from a parsed definitions file
    pub fn from_project_file(file: ProjectFile, base_dir: &Path) -> Result<Self, RegistryError> {
        let sources = file.source_records();
        let definitions = file
            .units
            .into_inner()
            .into_iter()
            .map(|definition| rebase(definition, base_dir))
            .collect();

        Self::load(definitions, sources)
    }

    /// Load a project directory using its `modelflow.yml`
    pub fn discover(root: &Path) -> Result<Self, RegistryError> {
        Self::from_project(root, &root.join(DEFINITIONS_FILE))
    }

    /// Load a project directory
    ///
    /// Reads the definitions file (if it exists) and picks up
    /// `models/**/*.sql` as units and `tests/**/*.sql` as singular tests.
    /// A discovered model whose name matches a definition supplies that
    /// definition's body.
    pub fn from_project(root: &Path, definitions: &Path) -> Result<Self, RegistryError> {
        let file = if definitions.exists() {
            ProjectFile::from_file(definitions)?
        } else {
            ProjectFile::default()
        };

        let base_dir = definitions.parent().unwrap_or(root);
        let sources = file.source_records();
        let mut units: Vec<UnitDefinition> = file
            .units
            .into_inner()
            .into_iter()
            .map(|definition| rebase(definition, base_dir))
            .collect();

        discover_models(root, &mut units)?;
        discover_singular_tests(root, &mut units)?;

        Self::load(units, sources)
    }

    /// Units in declaration order
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Position of a unit in declaration order
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.units.get_index_of(name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn source(&self, source_name: &str, table_name: &str) -> Option<&Source> {
        self.sources.get(&format!("{}.{}", source_name, table_name))
    }

    /// Whether a reference points at a known unit or source
    pub fn contains(&self, reference: &Reference) -> bool {
        match reference {
            Reference::Unit { name } => self.units.contains_key(name),
            Reference::Source { source_name, table_name } => {
                self.source(source_name, table_name).is_some()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Resolve relative paths of a definition against `base_dir`
fn rebase(mut definition: UnitDefinition, base_dir: &Path) -> UnitDefinition {
    if let Some(path) = definition.path.take() {
        definition.path = Some(join(base_dir, path));
    }

    let rebase_tests = |tests: &mut Vec<TestDefinition>| {
        for test in tests.iter_mut() {
            if let TestDefinition::Keyed(map) = test {
                for args in map.values_mut() {
                    if let Some(path) = args.path.take() {
                        args.path = Some(join(base_dir, path));
                    }
                }
            }
        }
    };

    rebase_tests(&mut definition.tests);
    for column in &mut definition.columns {
        rebase_tests(&mut column.tests);
    }

    definition
}

fn join(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn read_sql(path: &Path) -> Result<String, RegistryError> {
    std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Validate a single definition
fn build_unit(index: usize, definition: UnitDefinition) -> Result<Unit, RegistryError> {
    let name = definition
        .name
        .ok_or_else(|| RegistryError::malformed(format!("#{}", index + 1), "missing name"))?;

    if !is_identifier(&name) {
        return Err(RegistryError::malformed(&name, "name is not a valid SQL identifier"));
    }

    let body = match (definition.body, definition.path) {
        (Some(_), Some(_)) => {
            return Err(RegistryError::malformed(&name, "both an inline body and a body path are given"));
        }
        (Some(body), None) => body,
        (None, Some(path)) => read_sql(&path)?,
        (None, None) => return Err(RegistryError::malformed(&name, "missing body or body path")),
    };

    if body.trim().is_empty() {
        return Err(RegistryError::malformed(&name, "body is empty"));
    }

    let kind = match definition.kind.as_deref() {
        Some(value) => UnitKind::parse(value)
            .ok_or_else(|| RegistryError::malformed(&name, format!("unknown kind '{}'", value)))?,
        None => UnitKind::from_name(&name),
    };

    if let Some(schema) = &definition.schema {
        if !is_identifier(schema) {
            return Err(RegistryError::malformed(&name, format!("schema '{}' is not a valid SQL identifier", schema)));
        }
    }

    let references = ReferenceScanner::extract(&body)
        .map_err(|e| RegistryError::malformed(&name, e.to_string()))?;

    let mut tests = Vec::new();
    for test in &definition.tests {
        tests.push(build_test(&name, None, test)?);
    }
    for column in &definition.columns {
        if !is_identifier(&column.name) {
            return Err(RegistryError::malformed(
                &name,
                format!("column '{}' is not a valid SQL identifier", column.name),
            ));
        }
        for test in &column.tests {
            tests.push(build_test(&name, Some(&column.name), test)?);
        }
    }

    Ok(Unit {
        name,
        kind,
        materialization: definition.materialization.unwrap_or_default(),
        body,
        references,
        tests,
        schema: definition.schema,
        description: definition.description.unwrap_or_default(),
    })
}

/// Validate a single test entry of `unit`
fn build_test(unit: &str, column: Option<&str>, definition: &TestDefinition) -> Result<Test, RegistryError> {
    let (kind, args) = definition
        .parts()
        .ok_or_else(|| RegistryError::malformed(unit, "a test entry must name exactly one test"))?;

    let require_column = || -> Result<String, RegistryError> {
        let column = args
            .column
            .as_deref()
            .or(column)
            .ok_or_else(|| RegistryError::malformed(unit, format!("test '{}' requires a column", kind)))?;
        if !is_identifier(column) {
            return Err(RegistryError::malformed(
                unit,
                format!("test column '{}' is not a valid SQL identifier", column),
            ));
        }
        Ok(column.to_string())
    };

    let test = match kind {
        "unique" => Test::generic(unit, Assertion::Unique { column: require_column()? }),
        "not_null" => Test::generic(unit, Assertion::NotNull { column: require_column()? }),
        "accepted_values" => {
            let values = args
                .values
                .clone()
                .filter(|values| !values.is_empty())
                .ok_or_else(|| RegistryError::malformed(unit, "accepted_values requires a non-empty 'values' list"))?;
            Test::generic(unit, Assertion::AcceptedValues { column: require_column()?, values })
        }
        "relationships" => {
            let to = args
                .to
                .as_deref()
                .ok_or_else(|| RegistryError::malformed(unit, "relationships requires 'to'"))?;
            let to = ReferenceScanner::parse_reference(to)
                .map_err(|e| RegistryError::malformed(unit, format!("relationships 'to': {}", e)))?;
            let field = args
                .field
                .clone()
                .ok_or_else(|| RegistryError::malformed(unit, "relationships requires 'field'"))?;
            if !is_identifier(&field) {
                return Err(RegistryError::malformed(
                    unit,
                    format!("relationships field '{}' is not a valid SQL identifier", field),
                ));
            }
            Test::generic(unit, Assertion::Relationships { column: require_column()?, to, field })
        }
        "singular" => {
            let sql = match (&args.sql, &args.path) {
                (Some(sql), None) => sql.clone(),
                (None, Some(path)) => read_sql(path)?,
                _ => {
                    return Err(RegistryError::malformed(unit, "singular test requires exactly one of 'sql' or 'path'"));
                }
            };
            let references = ReferenceScanner::extract(&sql)
                .map_err(|e| RegistryError::malformed(unit, format!("singular test: {}", e)))?;
            Test::generic(unit, Assertion::Singular { sql }).with_references(references)
        }
        other => return Err(RegistryError::malformed(unit, format!("unknown test '{}'", other))),
    };

    let test = match args.name {
        Some(name) => test.with_name(name),
        None => test,
    };

    Ok(test.with_severity(args.severity.unwrap_or_default()))
}

fn sql_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("sql"))
        .collect();

    files.sort();
    files
}

fn file_stem(path: &Path) -> Result<String, RegistryError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| RegistryError::Io {
            path: path.display().to_string(),
            message: "file name is not valid UTF-8".to_string(),
        })
}

/// Kind from the nearest `models/` subdirectory that names one
fn kind_from_directory(models_dir: &Path, path: &Path) -> Option<UnitKind> {
    let relative = path.strip_prefix(models_dir).ok()?;
    relative
        .parent()?
        .components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(UnitKind::parse)
}

fn discover_models(root: &Path, units: &mut Vec<UnitDefinition>) -> Result<(), RegistryError> {
    let models_dir = root.join("models");

    for path in sql_files(&models_dir) {
        let name = file_stem(&path)?;
        let dir_kind = kind_from_directory(&models_dir, &path).map(|k| k.as_str().to_string());

        match units.iter_mut().find(|u| u.name.as_deref() == Some(name.as_str())) {
            Some(existing) if existing.path.as_deref() == Some(path.as_path()) => {}
            Some(existing) if existing.body.is_none() && existing.path.is_none() => {
                existing.path = Some(path);
                if existing.kind.is_none() {
                    existing.kind = dir_kind;
                }
            }
            Some(_) => return Err(RegistryError::DuplicateName { name }),
            None => {
                tracing::debug!(unit = %name, path = %path.display(), "Discovered model file");
                units.push(UnitDefinition {
                    name: Some(name),
                    kind: dir_kind,
                    path: Some(path),
                    ..UnitDefinition::default()
                });
            }
        }
    }

    Ok(())
}

/// Attach `tests/**/*.sql` to the first unit each query refers to
fn discover_singular_tests(root: &Path, units: &mut [UnitDefinition]) -> Result<(), RegistryError> {
    for path in sql_files(&root.join("tests")) {
        let name = file_stem(&path)?;
        let sql = read_sql(&path)?;

        let references = ReferenceScanner::extract(&sql)
            .map_err(|e| RegistryError::malformed(&name, format!("singular test: {}", e)))?;

        let target = references
            .iter()
            .find_map(|r| match r {
                Reference::Unit { name } => Some(name.clone()),
                Reference::Source { .. } => None,
            })
            .ok_or_else(|| RegistryError::malformed(&name, "singular test does not ref() any unit"))?;

        let unit = units
            .iter_mut()
            .find(|u| u.name.as_deref() == Some(target.as_str()))
            .ok_or_else(|| {
                RegistryError::malformed(&name, format!("singular test targets unknown unit '{}'", target))
            })?;

        let args = TestArgs {
            sql: Some(sql),
            name: Some(name),
            ..TestArgs::default()
        };

        let mut entry = IndexMap::new();
        entry.insert("singular".to_string(), args);
        unit.tests.push(TestDefinition::Keyed(entry));
    }

    Ok(())
}
