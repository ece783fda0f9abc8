//! Failing-rows queries for data tests
//!
//! Every test compiles to a query returning the rows that violate it; the
//! test passes when that query returns nothing.

use modelflow_core::AcceptedValue;

/// Rows sharing a non-null value with at least one other row
///
/// Every row of a duplicate group is a failing row: three rows with the same
/// key count as three failures.
pub fn unique(relation: &str, column: &str) -> String {
    format!(
        "select * from {relation} where {column} in (\n    select {column} from {relation}\n    where {column} is not null\n    group by {column}\n    having count(*) > 1\n)"
    )
}

/// Rows with a null value
pub fn not_null(relation: &str, column: &str) -> String {
    format!("select * from {relation} where {column} is null")
}

/// Non-null values outside the accepted set
pub fn accepted_values(relation: &str, column: &str, values: &[AcceptedValue]) -> String {
    let literals = values
        .iter()
        .map(AcceptedValue::to_sql_literal)
        .collect::<Vec<_>>()
        .join(", ");

    format!("select * from {relation} where {column} is not null and {column} not in ({literals})")
}

/// Non-null child values with no matching parent row
pub fn relationships(relation: &str, column: &str, parent: &str, field: &str) -> String {
    format!(
        "select child.* from {relation} as child\nleft join {parent} as parent on child.{column} = parent.{field}\nwhere child.{column} is not null and parent.{field} is null"
    )
}

/// Count the rows of a failing-rows query
pub fn count(query: &str) -> String {
    format!("select count(*) from (\n{query}\n) as mf_failures")
}
