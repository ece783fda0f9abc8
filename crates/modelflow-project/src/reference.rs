//! Reference marker scanning
//!
//! Finds `{{ ref('unit') }}` and `{{ source('source', 'table') }}` markers in
//! SQL bodies. Templates are never evaluated: any other `{{ ... }}` expression
//! or `{% ... %}` block is rejected.

use modelflow_core::Reference;
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::ops::Range;

static EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{-?(.*?)-?\}\}").expect("expression pattern is valid")
});

static COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{#.*?#\}").expect("comment pattern is valid")
});

static CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").expect("call pattern is valid")
});

/// A reference marker and its byte range in the scanned text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub reference: Reference,

    /// Range of the whole `{{ ... }}` block
    pub span: Range<usize>,
}

/// Errors raised while scanning a body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("unsupported template expression '{expression}': only ref() and source() are recognised")]
    UnsupportedExpression { expression: String },

    #[error("template control blocks are not supported (found at byte {offset})")]
    UnsupportedBlock { offset: usize },

    #[error("malformed {function}() call: '{expression}'")]
    MalformedCall { function: String, expression: String },

    #[error("unterminated template expression starting at byte {offset}")]
    Unterminated { offset: usize },
}

/// Extracts reference markers from SQL
pub struct ReferenceScanner;

impl ReferenceScanner {
    /// Remove `{# ... #}` comments
    pub fn strip_comments(sql: &str) -> Cow<'_, str> {
        COMMENT.replace_all(sql, "")
    }

    /// Extract every reference, in body order
    ///
    /// Comments are stripped first.
    pub fn extract(sql: &str) -> Result<Vec<Reference>, ScanError> {
        let stripped = Self::strip_comments(sql);
        Ok(Self::scan(&stripped)?
            .into_iter()
            .map(|marker| marker.reference)
            .collect())
    }

    /// Find markers with their spans
    ///
    /// `sql` must already be free of `{# #}` comments so that spans line up
    /// with the text the caller rewrites.
    pub fn scan(sql: &str) -> Result<Vec<Marker>, ScanError> {
        if let Some(offset) = sql.find("{%") {
            return Err(ScanError::UnsupportedBlock { offset });
        }

        let mut markers = Vec::new();
        let mut cursor = 0;

        for captures in EXPRESSION.captures_iter(sql) {
            let Some(whole) = captures.get(0) else { continue };

            if let Some(offset) = sql[cursor..whole.start()].find("{{") {
                return Err(ScanError::Unterminated { offset: cursor + offset });
            }

            let content = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let reference = Self::parse_expression(content)?;

            markers.push(Marker {
                reference,
                span: whole.range(),
            });
            cursor = whole.end();
        }

        if let Some(offset) = sql[cursor..].find("{{") {
            return Err(ScanError::Unterminated { offset: cursor + offset });
        }

        Ok(markers)
    }

    /// Parse a reference written without braces
    ///
    /// Accepts `ref('unit')`, `source('src', 'table')` and a bare unit name,
    /// the forms allowed in a `relationships` test's `to` field.
    pub fn parse_reference(value: &str) -> Result<Reference, ScanError> {
        let trimmed = value.trim();
        let trimmed = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);

        if CALL.is_match(trimmed) {
            return Self::parse_expression(trimmed);
        }

        if modelflow_core::is_identifier(trimmed) {
            return Ok(Reference::unit(trimmed));
        }

        Err(ScanError::UnsupportedExpression {
            expression: trimmed.to_string(),
        })
    }

    /// Parse the content of a `{{ ... }}` block
    fn parse_expression(content: &str) -> Result<Reference, ScanError> {
        let expression = content.trim();

        let Some(call) = CALL.captures(expression) else {
            return Err(ScanError::UnsupportedExpression {
                expression: expression.to_string(),
            });
        };

        let function = &call[1];
        let malformed = || ScanError::MalformedCall {
            function: function.to_string(),
            expression: expression.to_string(),
        };

        match function {
            "ref" => {
                let args = Self::parse_string_args(&call[2]).ok_or_else(malformed)?;
                match args.as_slice() {
                    // ref('unit') or ref('package', 'unit')
                    [name] | [_, name] if !name.is_empty() => Ok(Reference::unit(name.clone())),
                    _ => Err(malformed()),
                }
            }
            "source" => {
                let args = Self::parse_string_args(&call[2]).ok_or_else(malformed)?;
                match args.as_slice() {
                    [source_name, table_name] if !source_name.is_empty() && !table_name.is_empty() => {
                        Ok(Reference::source(source_name.clone(), table_name.clone()))
                    }
                    _ => Err(malformed()),
                }
            }
            _ => Err(ScanError::UnsupportedExpression {
                expression: expression.to_string(),
            }),
        }
    }

    /// Parse a comma separated list of quoted string literals
    ///
    /// Handles both single and double quotes.
    fn parse_string_args(args: &str) -> Option<Vec<String>> {
        let mut values = Vec::new();
        let mut chars = args.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let Some(quote) = chars.next() else {
                return Some(values);
            };
            if quote != '\'' && quote != '"' {
                return None;
            }

            let mut value = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => value.push(c),
                    None => return None,
                }
            }
            values.push(value);

            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            match chars.next() {
                None => return Some(values),
                Some(',') => continue,
                Some(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extract_ref() {
        let refs = ReferenceScanner::extract("SELECT * FROM {{ ref('users') }}").unwrap();
        assert_eq!(refs, vec![Reference::unit("users")]);
    }

    #[test]
    fn extract_source() {
        let refs = ReferenceScanner::extract("SELECT * FROM {{ source('raw', 'users') }}").unwrap();
        assert_eq!(refs, vec![Reference::source("raw", "users")]);
    }

    #[test]
    fn extract_multiple_in_order() {
        let sql = r#"
            WITH base AS (
                SELECT * FROM {{source("raw","users")}}
            ),
            filtered AS (
                SELECT * FROM {{- ref( "stg_users" ) -}}
            )
            SELECT * FROM filtered JOIN {{ ref('dim_dates') }} USING (day)
        "#;

        let refs = ReferenceScanner::extract(sql).unwrap();
        assert_eq!(
            refs,
            vec![
                Reference::source("raw", "users"),
                Reference::unit("stg_users"),
                Reference::unit("dim_dates"),
            ]
        );
    }

    #[test]
    fn two_argument_ref_keeps_unit_name() {
        let refs = ReferenceScanner::extract("select * from {{ ref('pkg', 'orders') }}").unwrap();
        assert_eq!(refs, vec![Reference::unit("orders")]);
    }

    #[test]
    fn spans_cover_whole_block() {
        let sql = "select * from {{ ref('a') }} join {{ ref('b') }}";
        let markers = ReferenceScanner::scan(sql).unwrap();

        assert_eq!(markers.len(), 2);
        assert_eq!(&sql[markers[0].span.clone()], "{{ ref('a') }}");
        assert_eq!(&sql[markers[1].span.clone()], "{{ ref('b') }}");
    }

    #[test]
    fn comments_are_ignored() {
        let sql = "{# {{ ref('old_orders') }} #}\nselect * from {{ ref('orders') }}";
        let refs = ReferenceScanner::extract(sql).unwrap();
        assert_eq!(refs, vec![Reference::unit("orders")]);
    }

    #[test]
    fn rejects_other_expressions() {
        assert!(matches!(
            ReferenceScanner::extract("select {{ var('start_date') }}"),
            Err(ScanError::UnsupportedExpression { .. })
        ));
        assert!(matches!(
            ReferenceScanner::extract("{% if is_incremental() %} select 1 {% endif %}"),
            Err(ScanError::UnsupportedBlock { .. })
        ));
    }

    #[test]
    fn rejects_malformed_calls() {
        for sql in [
            "select * from {{ ref() }}",
            "select * from {{ ref(orders) }}",
            "select * from {{ ref('orders) }}",
            "select * from {{ source('raw') }}",
            "select * from {{ ref('a', 'b', 'c') }}",
        ] {
            assert!(
                matches!(ReferenceScanner::extract(sql), Err(ScanError::MalformedCall { .. })),
                "expected malformed call for {sql}"
            );
        }
    }

    #[test]
    fn detects_unterminated_blocks() {
        assert!(matches!(
            ReferenceScanner::extract("select * from {{ ref('a')"),
            Err(ScanError::Unterminated { .. })
        ));
    }

    #[test]
    fn parse_reference_forms() {
        assert_eq!(
            ReferenceScanner::parse_reference("ref('stg_customers')").unwrap(),
            Reference::unit("stg_customers")
        );
        assert_eq!(
            ReferenceScanner::parse_reference("source('raw', 'customers')").unwrap(),
            Reference::source("raw", "customers")
        );
        assert_eq!(
            ReferenceScanner::parse_reference("stg_customers").unwrap(),
            Reference::unit("stg_customers")
        );
        assert!(ReferenceScanner::parse_reference("not a name").is_err());
    }

    #[test]
    fn plain_sql_has_no_references() {
        assert!(ReferenceScanner::extract("select 1 as one").unwrap().is_empty());
    }
}
