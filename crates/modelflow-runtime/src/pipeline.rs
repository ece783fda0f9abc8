//! Project pipeline
//!
//! Ties loading, resolution and compilation together and hands the compiled
//! units to the executor:
//!
//! 1. Load the catalog and resolve the DAG (errors here abort before any
//!    warehouse work)
//! 2. Compile the selected units in topological order; a unit that fails to
//!    compile becomes a failed result and its dependents are skipped
//! 3. Create the target schemas and execute

use crate::error::{with_timeout, ExecutionError};
use crate::executor::Executor;
use modelflow_core::{Config, Materialization, RunResult};
use modelflow_project::{
    resolve, select, Catalog, DependencyGraph, NodeId, RegistryError, ResolveError, SelectError, Selector,
};
use modelflow_sql::{CompiledUnit, Compiler, SqlParser};
use modelflow_warehouse::WarehousePool;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Errors that stop a run before it touches the warehouse
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Select(#[from] SelectError),
}

/// Compiled units ready to execute
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Units that compiled, in topological order
    pub units: Vec<CompiledUnit>,

    /// Units that failed to compile
    pub failures: Vec<RunResult>,

    /// Every planned unit, in topological order
    pub order: Vec<NodeId>,
}

impl RunPlan {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Target schemas, first use first
    pub fn schemas(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.units
            .iter()
            .map(|u| u.schema.as_str())
            .filter(|schema| seen.insert(*schema))
            .collect()
    }

    pub fn unit(&self, name: &str) -> Option<&CompiledUnit> {
        self.units.iter().find(|u| u.name == name)
    }
}

/// A loaded and resolved project
#[derive(Debug)]
pub struct Pipeline {
    catalog: Catalog,
    graph: DependencyGraph,
    compiler: Compiler,
}

impl Pipeline {
    /// Resolve `catalog` into a DAG
    pub fn new(catalog: Catalog, compiler: Compiler) -> Result<Self, PipelineError> {
        let graph = resolve(&catalog)?;
        tracing::info!(units = graph.len(), "Resolved project");
        Ok(Self { catalog, graph, compiler })
    }

    /// Load the project a configuration points at
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let catalog = Catalog::from_project(&config.project_root, &config.definitions_path())?;

        let mut compiler = Compiler::new(config.schemas.clone());
        if config.validate_sql {
            compiler = compiler.with_validation(SqlParser::from_dialect(&config.dialect));
        }

        Self::new(catalog, compiler)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Units matched by `selectors` (every unit when empty), in topological order
    pub fn select(&self, selectors: &[Selector]) -> Result<Vec<NodeId>, PipelineError> {
        Ok(select(&self.graph, selectors)?)
    }

    /// `names` plus every view a cascading drop of them removes, in topological order
    ///
    /// Replacing a relation with `drop ... cascade` also drops the views built
    /// on it, and the views built on those. A run over `names` has to recreate
    /// them. Tables stop the walk since they hold their own data.
    pub fn with_cascade_dependents(&self, names: &[NodeId]) -> Vec<NodeId> {
        let mut wanted: HashSet<NodeId> = names.iter().cloned().collect();
        let mut stack: Vec<NodeId> = names.to_vec();

        while let Some(name) = stack.pop() {
            for child in self.graph.children(&name) {
                let is_view = self
                    .graph
                    .node(child)
                    .is_some_and(|node| node.materialization == Materialization::View);
                if is_view && wanted.insert(child.clone()) {
                    stack.push(child.clone());
                }
            }
        }

        self.graph.in_order(&wanted)
    }

    /// Compile every unit
    pub fn plan_all(&self) -> RunPlan {
        self.compile(self.graph.order().to_vec())
    }

    /// Compile the named units; names outside the graph are ignored
    pub fn plan(&self, names: &[NodeId]) -> RunPlan {
        let wanted: HashSet<NodeId> = names.iter().cloned().collect();
        self.compile(self.graph.in_order(&wanted))
    }

    fn compile(&self, order: Vec<NodeId>) -> RunPlan {
        let mut plan = RunPlan {
            order,
            ..RunPlan::default()
        };

        for compiled in self.compiler.compile_all(&self.catalog, &self.graph, &plan.order) {
            match compiled {
                Ok(unit) => plan.units.push(unit),
                Err(e) => {
                    tracing::error!(unit = %e.unit(), error = %e, "Compilation failed");
                    let mut failed = RunResult::failed(e.unit(), e.to_string(), 0);
                    failed.attempts = 0;
                    plan.failures.push(failed);
                }
            }
        }

        plan
    }

    /// Create every schema the plan writes to
    pub async fn ensure_schemas(pool: &WarehousePool, plan: &RunPlan, timeout: Duration) -> Result<(), ExecutionError> {
        let conn = tokio::time::timeout(timeout, pool.checkout())
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))?
            .map_err(ExecutionError::Pool)?;

        for schema in plan.schemas() {
            tracing::debug!(schema = %schema, "Ensuring schema");
            with_timeout(timeout, conn.ensure_schema(schema)).await?;
        }
        Ok(())
    }

    /// Execute a plan, returning one result per planned unit in topological order
    pub async fn execute(&self, executor: &Executor, plan: &RunPlan) -> Vec<RunResult> {
        let timeout = executor.options().statement_timeout;

        let mut results = match Self::ensure_schemas(executor.pool(), plan, timeout).await {
            Ok(()) => executor.run_seeded(&plan.units, plan.failures.clone()).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create target schemas");
                let message = format!("could not create target schemas: {}", e);
                plan.units
                    .iter()
                    .map(|u| RunResult::failed(&u.name, message.clone(), 0))
                    .chain(plan.failures.iter().cloned())
                    .collect()
            }
        };

        let position: HashMap<&str, usize> = plan
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        results.sort_by_key(|r| position.get(r.unit.as_str()).copied().unwrap_or(usize::MAX));
        results
    }
}
