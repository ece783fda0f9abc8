//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency edges from `ref()` markers, checks
//! that every reference resolves, rejects cycles and fixes a deterministic
//! topological order.

use crate::registry::Catalog;
use indexmap::IndexMap;
use modelflow_core::{Materialization, Reference, Source, UnitKind};
use std::collections::{HashMap, HashSet, VecDeque};

/// Node identifier (unit name)
pub type NodeId = String;

/// Errors raised while resolving references
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unit '{unit}' references unknown '{identifier}'")]
    UnknownReference { identifier: String, unit: String },

    #[error("dependency cycle: {}", format_cycle(.units))]
    Cycle { units: Vec<String> },
}

fn format_cycle(units: &[String]) -> String {
    let mut path = units.join(" -> ");
    if let Some(first) = units.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

/// What the compiler needs to know about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub kind: UnitKind,
    pub materialization: Materialization,

    /// Schema override from the definition
    pub schema: Option<String>,
}

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Topological order (dependencies first)
    order: Vec<NodeId>,

    /// Forward edges: node -> nodes it depends on (parents)
    parents: HashMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> nodes that depend on it (children)
    children: HashMap<NodeId, Vec<NodeId>>,

    /// All nodes, in declaration order
    nodes: IndexMap<NodeId, NodeInfo>,

    /// Sources keyed by `source_name.table_name`
    sources: HashMap<String, Source>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Active,
    Done,
}

/// Resolve every reference of the catalog and build the graph
///
/// Unknown references are reported before cycles.
pub fn resolve(catalog: &Catalog) -> Result<DependencyGraph, ResolveError> {
    for unit in catalog.units() {
        let test_references = unit.tests.iter().flat_map(|t| t.references.iter());
        for reference in unit.references.iter().chain(test_references) {
            if !catalog.contains(reference) {
                return Err(ResolveError::UnknownReference {
                    identifier: reference.identifier(),
                    unit: unit.name.clone(),
                });
            }
        }
    }

    let mut parents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut nodes = IndexMap::new();

    for unit in catalog.units() {
        nodes.insert(
            unit.name.clone(),
            NodeInfo {
                kind: unit.kind,
                materialization: unit.materialization,
                schema: unit.schema.clone(),
            },
        );

        // Dependencies are visited in declaration order
        let mut deps: Vec<NodeId> = unit.unit_references().into_iter().map(str::to_string).collect();
        deps.sort_by_key(|dep| catalog.declaration_index(dep));

        for dep in &deps {
            children.entry(dep.clone()).or_default().push(unit.name.clone());
        }
        parents.insert(unit.name.clone(), deps);
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    let mut order = Vec::with_capacity(nodes.len());

    for name in nodes.keys() {
        visit(name, &parents, &mut marks, &mut path, &mut order)?;
    }

    let sources = catalog.sources().map(|s| (s.key(), s.clone())).collect();

    tracing::debug!(units = order.len(), "Resolved dependency graph");

    Ok(DependencyGraph {
        order,
        parents,
        children,
        nodes,
        sources,
    })
}

/// Depth-first postorder visit
fn visit<'a>(
    name: &'a str,
    parents: &'a HashMap<NodeId, Vec<NodeId>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<NodeId>,
) -> Result<(), ResolveError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Active) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            return Err(ResolveError::Cycle {
                units: path[start..].iter().map(|n| n.to_string()).collect(),
            });
        }
        None => {}
    }

    marks.insert(name, Mark::Active);
    path.push(name);

    if let Some(deps) = parents.get(name) {
        for dep in deps {
            visit(dep, parents, marks, path, order)?;
        }
    }

    path.pop();
    marks.insert(name, Mark::Done);
    order.push(name.to_string());

    Ok(())
}

impl DependencyGraph {
    /// All units in topological order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    pub fn kind(&self, node_id: &str) -> Option<UnitKind> {
        self.nodes.get(node_id).map(|n| n.kind)
    }

    /// Source by logical names
    pub fn source(&self, source_name: &str, table_name: &str) -> Option<&Source> {
        self.sources.get(&format!("{}.{}", source_name, table_name))
    }

    /// Whether a unit or source reference resolves in this graph
    pub fn resolves(&self, reference: &Reference) -> bool {
        match reference {
            Reference::Unit { name } => self.contains(name),
            Reference::Source { source_name, table_name } => {
                self.source(source_name, table_name).is_some()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> Vec<&NodeId> {
        self.parents
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> Vec<&NodeId> {
        self.children
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get all downstream nodes (transitive closure of children)
    ///
    /// This is what has to be rebuilt when `node_id` changes; returned in
    /// topological order.
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        let reached = Self::closure(node_id, &self.children);
        self.in_order(&reached)
    }

    /// Get all upstream nodes (transitive closure of parents), in topological order
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        let reached = Self::closure(node_id, &self.parents);
        self.in_order(&reached)
    }

    /// Check if there's a path from source to target
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        Self::closure(source, &self.children).contains(target)
    }

    /// Group nodes into waves that can run concurrently
    ///
    /// A node's level is one more than the deepest of its parents.
    pub fn levels(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<NodeId>> = Vec::new();

        for node in &self.order {
            let level = self
                .parents
                .get(node)
                .into_iter()
                .flatten()
                .filter_map(|p| depth.get(p.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);

            depth.insert(node, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node.clone());
        }

        levels
    }

    /// Filter `nodes` into topological order
    pub fn in_order(&self, nodes: &HashSet<NodeId>) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|n| nodes.contains(*n))
            .cloned()
            .collect()
    }

    /// BFS over one edge direction, excluding the start node
    fn closure(start: &str, edges: &HashMap<NodeId, Vec<NodeId>>) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&NodeId> = edges.get(start).into_iter().flatten().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }

            if let Some(next) = edges.get(current) {
                queue.extend(next.iter().filter(|n| !visited.contains(*n)));
            }
        }

        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::UnitDefinition;
    use pretty_assertions::assert_eq;

    fn catalog(units: &[(&str, &str)]) -> Catalog {
        let definitions = units
            .iter()
            .map(|(name, body)| UnitDefinition {
                name: Some(name.to_string()),
                body: Some(body.to_string()),
                ..UnitDefinition::default()
            })
            .collect();

        Catalog::load(definitions, vec![Source::new("raw", "orders", "raw.orders")]).unwrap()
    }

    fn position(order: &[NodeId], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let catalog = catalog(&[
            ("fct_orders", "select * from {{ ref('stg_orders') }} join {{ ref('stg_customers') }} using (id)"),
            ("stg_customers", "select 1 as id"),
            ("stg_orders", "select * from {{ source('raw', 'orders') }}"),
            ("orders_report", "select * from {{ ref('fct_orders') }}"),
        ]);

        let graph = resolve(&catalog).unwrap();
        let order = graph.order();

        assert_eq!(order.len(), 4);
        for unit in catalog.units() {
            for dep in unit.unit_references() {
                assert!(position(order, dep) < position(order, &unit.name));
            }
        }

        // Dependencies are visited in declaration order
        assert_eq!(order, &["stg_customers", "stg_orders", "fct_orders", "orders_report"]);
    }

    #[test]
    fn order_is_deterministic() {
        let units = [
            ("a", "select 1"),
            ("b", "select * from {{ ref('a') }}"),
            ("c", "select * from {{ ref('a') }}"),
            ("d", "select * from {{ ref('c') }} join {{ ref('b') }} using (x)"),
        ];

        let first = resolve(&catalog(&units)).unwrap();
        let second = resolve(&catalog(&units)).unwrap();
        assert_eq!(first.order(), second.order());
        assert_eq!(first.order(), &["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_is_reported_in_path_order() {
        let catalog = catalog(&[
            ("a", "select * from {{ ref('b') }}"),
            ("b", "select * from {{ ref('c') }}"),
            ("c", "select * from {{ ref('a') }}"),
        ]);

        let err = resolve(&catalog).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Cycle {
                units: vec!["a".into(), "b".into(), "c".into()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let catalog = catalog(&[("a", "select * from {{ ref('a') }}")]);
        assert_eq!(
            resolve(&catalog).unwrap_err(),
            ResolveError::Cycle { units: vec!["a".into()] }
        );
    }

    #[test]
    fn unknown_references_are_reported() {
        let err = resolve(&catalog(&[("a", "select * from {{ ref('missing') }}")])).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownReference {
                identifier: "missing".into(),
                unit: "a".into()
            }
        );

        let err = resolve(&catalog(&[("a", "select * from {{ source('raw', 'payments') }}")])).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownReference { identifier, .. } if identifier == "raw.payments"));
    }

    #[test]
    fn traversal_queries() {
        let graph = resolve(&catalog(&[
            ("a", "select 1"),
            ("b", "select * from {{ ref('a') }}"),
            ("c", "select * from {{ ref('b') }}"),
            ("d", "select 2"),
        ]))
        .unwrap();

        assert_eq!(graph.parents("b"), vec!["a"]);
        assert_eq!(graph.children("a"), vec!["b"]);
        assert_eq!(graph.downstream("a"), vec!["b", "c"]);
        assert_eq!(graph.upstream("c"), vec!["a", "b"]);
        assert!(graph.has_path("a", "c"));
        assert!(!graph.has_path("c", "a"));
        assert!(!graph.has_path("a", "d"));
        assert!(graph.downstream("d").is_empty());
        assert_eq!(graph.kind("a"), Some(UnitKind::Mart));
        assert!(graph.source("raw", "orders").is_some());
    }

    #[test]
    fn levels_group_independent_units() {
        let graph = resolve(&catalog(&[
            ("a", "select 1"),
            ("b", "select 2"),
            ("c", "select * from {{ ref('a') }} join {{ ref('b') }} using (x)"),
            ("d", "select * from {{ ref('c') }}"),
        ]))
        .unwrap();

        assert_eq!(
            graph.levels(),
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }
}
