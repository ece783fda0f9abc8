//! Materialization statement plans
//!
//! A plan is the ordered list of statements that persists a compiled unit.
//! Tables are built under a temporary name and swapped in afterwards, so the
//! previous data is only removed once the new table is fully populated.
//!
//! Plans depend on what already exists under the unit's name. A view that
//! replaces a table (or a table that replaces a view) drops the old relation
//! with the statement matching its kind. Without transactional DDL the old
//! relation is renamed to a backup first, and a failed swap renames it back.

use crate::compiler::CompiledUnit;
use modelflow_core::{Materialization, RelationKind};

/// Suffix of the table a unit is built into before the swap
pub const TMP_SUFFIX: &str = "__mf_tmp";

/// Suffix of the previous relation during a non-transactional swap
pub const BACKUP_SUFFIX: &str = "__mf_backup";

/// How a fresh relation replaces the live one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStrategy {
    /// `drop` + `rename` (or `create`) in one transaction
    Transactional { cascade: bool },

    /// Rename the live relation to a backup, put the new one in place, drop the backup
    RenameBackup { cascade: bool },
}

impl SwapStrategy {
    pub fn new(transactional_ddl: bool, drop_cascade: bool) -> Self {
        if transactional_ddl {
            Self::Transactional { cascade: drop_cascade }
        } else {
            Self::RenameBackup { cascade: drop_cascade }
        }
    }
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Execute(String),

    /// Statements that must apply atomically
    Transaction(Vec<String>),

    /// Query whose single count is the unit's `rows_affected`
    CountRows(String),

    /// Put the new relation in place; run `restore` if `statement` fails
    Replace { statement: String, restore: String },
}

/// Statements that persist one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub unit: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Plan for a compiled unit, given the kind of relation currently under its name
    pub fn for_unit(unit: &CompiledUnit, swap: SwapStrategy, existing: Option<RelationKind>) -> Self {
        let steps = match unit.materialization {
            Materialization::View => view_steps(unit, swap, existing),
            Materialization::Table => table_steps(unit, swap, existing),
        };

        Self {
            unit: unit.name.clone(),
            steps,
        }
    }

    /// All statements in order, flattening transactions
    ///
    /// Restore statements are left out since they only run on failure.
    pub fn statements(&self) -> Vec<&str> {
        self.steps
            .iter()
            .flat_map(|step| match step {
                Step::Execute(sql) | Step::CountRows(sql) => vec![sql.as_str()],
                Step::Replace { statement, .. } => vec![statement.as_str()],
                Step::Transaction(statements) => statements.iter().map(String::as_str).collect(),
            })
            .collect()
    }
}

fn drop_relation(kind: RelationKind, relation: &str, cascade: bool) -> String {
    if cascade {
        format!("drop {} if exists {} cascade", kind, relation)
    } else {
        format!("drop {} if exists {}", kind, relation)
    }
}

fn rename_relation(kind: RelationKind, relation: &str, to: &str) -> String {
    format!("alter {} {} rename to {}", kind, relation, to)
}

/// Steps that move `existing` aside, run `statement`, and drop the backup
fn backup_swap(unit: &CompiledUnit, existing: RelationKind, cascade: bool, statement: String) -> Vec<Step> {
    let backup_name = format!("{}{}", unit.name, BACKUP_SUFFIX);
    let backup = format!("{}.{}", unit.schema, backup_name);

    vec![
        Step::Execute(drop_relation(existing, &backup, cascade)),
        Step::Execute(rename_relation(existing, &unit.relation, &backup_name)),
        Step::Replace {
            statement,
            restore: rename_relation(existing, &backup, &unit.name),
        },
        Step::Execute(drop_relation(existing, &backup, cascade)),
    ]
}

fn view_steps(unit: &CompiledUnit, swap: SwapStrategy, existing: Option<RelationKind>) -> Vec<Step> {
    let create = format!("create or replace view {} as\n{}", unit.relation, unit.sql);

    match (existing, swap) {
        (Some(RelationKind::Table), SwapStrategy::Transactional { cascade }) => vec![Step::Transaction(vec![
            drop_relation(RelationKind::Table, &unit.relation, cascade),
            create,
        ])],
        (Some(RelationKind::Table), SwapStrategy::RenameBackup { cascade }) => {
            backup_swap(unit, RelationKind::Table, cascade, create)
        }
        (None | Some(RelationKind::View), _) => vec![Step::Execute(create)],
    }
}

fn table_steps(unit: &CompiledUnit, swap: SwapStrategy, existing: Option<RelationKind>) -> Vec<Step> {
    let tmp_name = format!("{}{}", unit.name, TMP_SUFFIX);
    let tmp = format!("{}.{}", unit.schema, tmp_name);
    let rename_in = rename_relation(RelationKind::Table, &tmp, &unit.name);

    let mut steps = vec![
        Step::Execute(drop_relation(RelationKind::Table, &tmp, false)),
        Step::Execute(format!("create table {} as\n{}", tmp, unit.sql)),
        Step::CountRows(format!("select count(*) from {}", tmp)),
    ];

    match (swap, existing) {
        (SwapStrategy::Transactional { cascade }, _) => {
            steps.push(Step::Transaction(vec![
                drop_relation(existing.unwrap_or(RelationKind::Table), &unit.relation, cascade),
                rename_in,
            ]));
        }
        (SwapStrategy::RenameBackup { .. }, None) => steps.push(Step::Execute(rename_in)),
        (SwapStrategy::RenameBackup { cascade }, Some(kind)) => {
            steps.extend(backup_swap(unit, kind, cascade, rename_in));
        }
    }

    steps
}
