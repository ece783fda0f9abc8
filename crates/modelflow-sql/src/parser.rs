//! SQL validation using datafusion-sqlparser-rs
//!
//! Compiled bodies are parsed before they reach the warehouse so that syntax
//! errors fail the unit at compile time instead of half way through a run.

use modelflow_core::DialectConfig;
use sqlparser::ast::Statement;
use sqlparser::dialect::{
    AnsiDialect, BigQueryDialect, Dialect, DuckDbDialect, GenericDialect, PostgreSqlDialect,
    SnowflakeDialect,
};
use sqlparser::parser::{Parser, ParserError};

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect + Send + Sync>,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
        }
    }

    /// Create a parser from a dialect config
    pub fn from_dialect(dialect: &DialectConfig) -> Self {
        let dialect: Box<dyn Dialect + Send + Sync> = match dialect {
            DialectConfig::Generic => Box::new(GenericDialect {}),
            DialectConfig::DuckDb => Box::new(DuckDbDialect {}),
            DialectConfig::Postgres => Box::new(PostgreSqlDialect {}),
            DialectConfig::BigQuery => Box::new(BigQueryDialect {}),
            DialectConfig::Snowflake => Box::new(SnowflakeDialect {}),
            DialectConfig::Ansi => Box::new(AnsiDialect {}),
        };
        Self { dialect }
    }

    /// Parse SQL string into statements
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, ParserError> {
        Parser::parse_sql(&*self.dialect, sql)
    }

    /// Check that `sql` is exactly one query
    ///
    /// Unit bodies and test queries are wrapped in DDL or subqueries, so
    /// anything other than a single `SELECT` / `WITH` query is rejected.
    pub fn validate_query(&self, sql: &str) -> Result<(), String> {
        let statements = self
            .parse(sql)
            .map_err(|e| format!("failed to parse SQL: {}", e))?;

        match statements.as_slice() {
            [Statement::Query(_)] => Ok(()),
            [] => Err("no statement found".to_string()),
            [_] => Err("expected a query (SELECT or WITH)".to_string()),
            many => Err(format!("expected a single query, found {} statements", many.len())),
        }
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SqlParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlParser").finish_non_exhaustive()
    }
}
