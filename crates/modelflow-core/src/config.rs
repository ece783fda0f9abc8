//! Configuration schema (modelflow.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use crate::unit::UnitKind;

/// SQL dialect used when validating compiled SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectConfig {
    /// Permissive dialect accepting most warehouse syntax
    Generic,

    /// DuckDB SQL dialect
    DuckDb,

    /// PostgreSQL SQL dialect
    Postgres,

    /// BigQuery SQL dialect
    BigQuery,

    /// Snowflake SQL dialect
    Snowflake,

    /// Generic ANSI SQL
    Ansi,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self::Generic
    }
}

/// Target schema per unit kind
///
/// A unit compiles to `{schema}.{unit_name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_staging_schema")]
    pub staging: String,

    #[serde(default = "default_intermediate_schema")]
    pub intermediate: String,

    #[serde(default = "default_marts_schema")]
    pub mart: String,

    #[serde(default = "default_marts_schema")]
    pub fact: String,
}

fn default_staging_schema() -> String {
    "staging".to_string()
}

fn default_intermediate_schema() -> String {
    "intermediate".to_string()
}

fn default_marts_schema() -> String {
    "marts".to_string()
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            staging: default_staging_schema(),
            intermediate: default_intermediate_schema(),
            mart: default_marts_schema(),
            fact: default_marts_schema(),
        }
    }
}

impl SchemaConfig {
    /// Schema that units of `kind` compile into
    pub fn schema_for(&self, kind: UnitKind) -> &str {
        match kind {
            UnitKind::Staging => &self.staging,
            UnitKind::Intermediate => &self.intermediate,
            UnitKind::Mart => &self.mart,
            UnitKind::Fact => &self.fact,
        }
    }
}

/// When a unit's tests are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestTiming {
    /// As soon as the unit (and every unit the test references) is built
    AfterUnit,

    /// Once every unit of the run has finished
    EndOfRun,
}

impl Default for TestTiming {
    fn default() -> Self {
        Self::AfterUnit
    }
}

/// Execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrent warehouse connections
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Timeout applied to every warehouse call
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    #[serde(default)]
    pub test_timing: TestTiming,

    /// Fail the run when any error-severity test fails
    #[serde(default)]
    pub strict: bool,
}

fn default_threads() -> usize {
    4
}

fn default_statement_timeout_secs() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            statement_timeout_secs: default_statement_timeout_secs(),
            test_timing: TestTiming::default(),
            strict: false,
        }
    }
}

impl ExecutionConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

/// Backoff strategy between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry policy applied to failed units and their downstream subgraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff")]
    pub backoff: Backoff,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for exponential delays
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff() -> Backoff {
    Backoff::Exponential
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Schedule settings for `modelflow schedule`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between two run cycles
    pub interval_secs: u64,
}

/// Warehouse connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Warehouse type (duckdb, postgres)
    #[serde(rename = "type")]
    pub warehouse_type: String,

    /// Connection settings (warehouse-specific)
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            warehouse_type: "duckdb".to_string(),
            settings: HashMap::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Unit definitions file, relative to the project root
    #[serde(default = "default_definitions")]
    pub definitions: PathBuf,

    /// SQL dialect for validation
    #[serde(default)]
    pub dialect: DialectConfig,

    /// Parse compiled SQL before running it
    #[serde(default = "default_true")]
    pub validate_sql: bool,

    /// Append-only run history (JSON lines), relative to the project root
    #[serde(default = "default_run_log")]
    pub run_log: PathBuf,

    #[serde(default)]
    pub schemas: SchemaConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,

    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_definitions() -> PathBuf {
    PathBuf::from("modelflow.yml")
}

fn default_run_log() -> PathBuf {
    PathBuf::from("target/run_log.jsonl")
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definitions: default_definitions(),
            dialect: DialectConfig::default(),
            validate_sql: true,
            schemas: SchemaConfig::default(),
            execution: ExecutionConfig::default(),
            retry: RetryPolicy::default(),
            schedule: None,
            run_log: default_run_log(),
            warehouse: None,
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.project_root = std::env::current_dir().unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Absolute path of the definitions file
    pub fn definitions_path(&self) -> PathBuf {
        self.project_root.join(&self.definitions)
    }

    /// Absolute path of the run log
    pub fn run_log_path(&self) -> PathBuf {
        self.project_root.join(&self.run_log)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.threads == 0 {
            return Err(ConfigError::Invalid("execution.threads must be at least 1".to_string()));
        }
        if self.execution.statement_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution.statement_timeout_secs must be at least 1".to_string(),
            ));
        }
        for (kind, schema) in [
            ("staging", &self.schemas.staging),
            ("intermediate", &self.schemas.intermediate),
            ("mart", &self.schemas.mart),
            ("fact", &self.schemas.fact),
        ] {
            if !crate::unit::is_identifier(schema) {
                return Err(ConfigError::Invalid(format!(
                    "schemas.{} = '{}' is not a valid identifier",
                    kind, schema
                )));
            }
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
