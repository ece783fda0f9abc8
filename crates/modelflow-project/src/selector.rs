//! Unit selection (`--select`)
//!
//! - `name`: the unit alone
//! - `+name`: the unit and everything upstream of it
//! - `name+`: the unit and everything downstream of it
//! - `+name+`: both directions
//! - `kind:staging`: every unit of a kind

use crate::dag::{DependencyGraph, NodeId};
use modelflow_core::UnitKind;
use std::collections::HashSet;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("invalid selector '{0}'")]
    Invalid(String),

    #[error("selector '{selector}' matches no unit named '{unit}'")]
    UnknownUnit { selector: String, unit: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Unit {
        name: String,
        ancestors: bool,
        descendants: bool,
    },
    Kind(UnitKind),
}

impl FromStr for Selector {
    type Err = SelectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(kind) = s.strip_prefix("kind:") {
            return UnitKind::parse(kind)
                .map(Selector::Kind)
                .ok_or_else(|| SelectError::Invalid(s.to_string()));
        }

        let (ancestors, rest) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (descendants, name) = match rest.strip_suffix('+') {
            Some(name) => (true, name),
            None => (false, rest),
        };

        if !modelflow_core::is_identifier(name) {
            return Err(SelectError::Invalid(s.to_string()));
        }

        Ok(Selector::Unit {
            name: name.to_string(),
            ancestors,
            descendants,
        })
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit { name, ancestors, descendants } => write!(
                f,
                "{}{}{}",
                if *ancestors { "+" } else { "" },
                name,
                if *descendants { "+" } else { "" }
            ),
            Self::Kind(kind) => write!(f, "kind:{}", kind),
        }
    }
}

/// Union of all selectors, in topological order
///
/// An empty selector list selects the whole graph.
pub fn select(graph: &DependencyGraph, selectors: &[Selector]) -> Result<Vec<NodeId>, SelectError> {
    if selectors.is_empty() {
        return Ok(graph.order().to_vec());
    }

    let mut selected: HashSet<NodeId> = HashSet::new();

    for selector in selectors {
        match selector {
            Selector::Unit { name, ancestors, descendants } => {
                if !graph.contains(name) {
                    return Err(SelectError::UnknownUnit {
                        selector: selector.to_string(),
                        unit: name.clone(),
                    });
                }

                selected.insert(name.clone());
                if *ancestors {
                    selected.extend(graph.upstream(name));
                }
                if *descendants {
                    selected.extend(graph.downstream(name));
                }
            }
            Selector::Kind(kind) => {
                selected.extend(
                    graph
                        .order()
                        .iter()
                        .filter(|n| graph.kind(n) == Some(*kind))
                        .cloned(),
                );
            }
        }
    }

    Ok(graph.in_order(&selected))
}
