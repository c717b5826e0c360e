//! Task graph construction and dependency resolution
//!
//! A task depends on every task it names in its inputs, and on every task
//! that declares one of its file inputs as an output. [`build_plan`] walks
//! those edges depth-first from the requested targets and emits tasks in
//! post-order, so dependencies always precede dependents. [`TaskGraph`] keeps
//! the whole registry in a petgraph `DiGraph` for queries that look the other
//! way (dependents) and for graph export.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::Serialize;

use crate::error::{MillError, Result};
use crate::registry::Registry;
use crate::task::Task;

/// Direct dependencies of `task`, as registry indices in registration order
pub(crate) fn dependency_indices(registry: &Registry, task: &Task) -> Result<Vec<usize>> {
    let mut deps = Vec::new();

    for name in task.task_inputs() {
        let idx = registry
            .index_of(name)
            .ok_or_else(|| registry.unknown(name))?;
        deps.push(idx);
    }

    for path in task.file_inputs() {
        if let Some(producer) = registry.by_output(path) {
            if let Some(idx) = registry.index_of(&producer.name) {
                deps.push(idx);
            }
        }
    }

    deps.sort_unstable();
    deps.dedup();
    Ok(deps)
}

/// One task of an execution plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: String,
    /// Plan positions of this task's direct dependencies
    pub deps: Vec<usize>,
}

/// Dependency-respecting order over the transitive closure of some targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    entries: Vec<PlanEntry>,
}

impl ExecutionPlan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    InProgress,
    Done,
}

struct PlanBuilder<'a> {
    registry: &'a Registry,
    marks: Vec<Mark>,
    path: Vec<usize>,
    plan_pos: HashMap<usize, usize>,
    entries: Vec<PlanEntry>,
}

impl PlanBuilder<'_> {
    fn visit(&mut self, idx: usize) -> Result<()> {
        match self.marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = self.path.iter().position(|&i| i == idx).unwrap_or(0);
                let all = self.registry.all();
                let mut cycle: Vec<String> = self.path[start..]
                    .iter()
                    .map(|&i| all[i].name.clone())
                    .collect();
                cycle.push(all[idx].name.clone());
                return Err(MillError::CyclicDependency { cycle });
            }
            Mark::New => {}
        }

        self.marks[idx] = Mark::InProgress;
        self.path.push(idx);

        let task = Arc::clone(&self.registry.all()[idx]);
        let deps = dependency_indices(self.registry, &task)?;
        for &dep in &deps {
            self.visit(dep)?;
        }

        self.path.pop();
        self.marks[idx] = Mark::Done;

        let entry = PlanEntry {
            name: task.name.clone(),
            deps: deps.iter().map(|d| self.plan_pos[d]).collect(),
        };
        self.plan_pos.insert(idx, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

/// Build the execution plan for `targets`, in the order they were requested
pub fn build_plan<S: AsRef<str>>(registry: &Registry, targets: &[S]) -> Result<ExecutionPlan> {
    let roots = targets
        .iter()
        .map(|t| {
            registry
                .index_of(t.as_ref())
                .ok_or_else(|| registry.unknown(t.as_ref()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut builder = PlanBuilder {
        registry,
        marks: vec![Mark::New; registry.len()],
        path: Vec::new(),
        plan_pos: HashMap::new(),
        entries: Vec::new(),
    };

    for root in roots {
        builder.visit(root)?;
    }

    Ok(ExecutionPlan {
        entries: builder.entries,
    })
}

/// A task node of an exported subgraph
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub doc: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub phony: bool,
}

/// Nodes and edges of the graph under a target
#[derive(Debug, Clone, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    /// `(dependency, dependent)` pairs
    pub edges: Vec<(String, String)>,
}

/// The whole registry as a dependency graph
///
/// Node `i` is the task registered `i`-th; edges go from a dependency to its
/// dependent.
#[derive(Debug)]
pub struct TaskGraph<'a> {
    registry: &'a Registry,
    graph: DiGraph<usize, ()>,
}

impl<'a> TaskGraph<'a> {
    /// Build the graph; fails only on task inputs naming unknown tasks
    pub fn new(registry: &'a Registry) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(registry.len(), registry.len());

        for idx in 0..registry.len() {
            graph.add_node(idx);
        }

        for (idx, task) in registry.all().iter().enumerate() {
            for dep in dependency_indices(registry, task)? {
                // Edge goes from dependency TO dependent (dep must run first)
                graph.add_edge(NodeIndex::new(dep), NodeIndex::new(idx), ());
            }
        }

        Ok(Self { registry, graph })
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.registry
            .index_of(name)
            .map(NodeIndex::new)
            .ok_or_else(|| self.registry.unknown(name))
    }

    fn tasks_of(&self, mut nodes: Vec<NodeIndex>) -> Vec<&'a Arc<Task>> {
        nodes.sort_unstable();
        nodes.dedup();
        let all = self.registry.all();
        nodes.into_iter().map(|n| &all[self.graph[n]]).collect()
    }

    /// Direct dependencies of a task
    pub fn dependencies(&self, name: &str) -> Result<Vec<&'a Arc<Task>>> {
        let node = self.node(name)?;
        Ok(self.tasks_of(
            self.graph
                .neighbors_directed(node, Direction::Incoming)
                .collect(),
        ))
    }

    /// Tasks that depend directly on the given task
    pub fn dependents(&self, name: &str) -> Result<Vec<&'a Arc<Task>>> {
        let node = self.node(name)?;
        Ok(self.tasks_of(
            self.graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect(),
        ))
    }

    /// Every task that transitively depends on the given task (excluding it)
    pub fn transitive_dependents(&self, name: &str) -> Result<Vec<&'a Arc<Task>>> {
        let start = self.node(name)?;
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.push(node);
            }
        }
        Ok(self.tasks_of(found))
    }

    /// Every task the given task transitively depends on (excluding it)
    pub fn transitive_dependencies(&self, name: &str) -> Result<Vec<&'a Arc<Task>>> {
        let start = self.node(name)?;
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.push(node);
            }
        }
        Ok(self.tasks_of(found))
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// One cycle of the graph as an ordered task list, if any
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        if !self.is_cyclic() {
            return None;
        }
        let names: Vec<&str> = self.registry.all().iter().map(|t| t.name.as_str()).collect();
        match build_plan(self.registry, &names) {
            Err(MillError::CyclicDependency { cycle }) => Some(cycle),
            _ => None,
        }
    }

    /// Nodes and edges of the subgraph reachable from `target`
    pub fn subgraph(&self, target: &str) -> Result<Subgraph> {
        let plan = build_plan(self.registry, &[target])?;

        let mut nodes = Vec::with_capacity(plan.len());
        let mut edges = Vec::new();

        for entry in plan.entries() {
            let task = self.registry.get(&entry.name)?;
            nodes.push(GraphNode {
                name: task.name.clone(),
                doc: task.doc.clone(),
                inputs: task.file_inputs().map(PathBuf::from).collect(),
                outputs: task.all_outputs().map(PathBuf::from).collect(),
                phony: task.is_phony(),
            });
            for &dep in &entry.deps {
                edges.push((plan.entries()[dep].name.clone(), entry.name.clone()));
            }
        }

        Ok(Subgraph { nodes, edges })
    }
}
