//! Dependency graph of a workflow
//!
//! [`ExecutionPlan::build`] rejects malformed definitions before any step
//! runs: empty workflows, duplicate or blank step ids, unknown
//! dependencies, cycles and branch targets that do not depend on their
//! branch step. During execution, [`ExecutionPlan::resolve`] decides which
//! pending steps are ready and which can never run.

use std::collections::{BTreeMap, HashMap, HashSet};

use flowline_common::types::{StepResult, StepStatus, StepType, WorkflowDefinition};
use flowline_common::{FlowlineError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::branch::BranchSpec;

/// Steps to start and steps to skip after one resolution pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub ready: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    /// Step ids in a topological order, ties broken by definition order
    order: Vec<String>,
    branches: HashMap<String, BranchSpec>,
}

impl ExecutionPlan {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        if definition.steps.is_empty() {
            return Err(FlowlineError::configuration(format!(
                "workflow '{}' has no steps",
                definition.id
            )));
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for step in &definition.steps {
            if step.id.trim().is_empty() {
                return Err(FlowlineError::configuration("step id must not be empty"));
            }
            if nodes.contains_key(&step.id) {
                return Err(FlowlineError::configuration(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            nodes.insert(step.id.clone(), graph.add_node(step.id.clone()));
        }

        for step in &definition.steps {
            let target = nodes[&step.id];
            for dep in &step.depends_on {
                let source = nodes.get(dep).ok_or_else(|| {
                    FlowlineError::configuration(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                graph.update_edge(*source, target, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            FlowlineError::configuration(format!(
                "workflow '{}' has a dependency cycle through step '{}'",
                definition.id, graph[cycle.node_id()]
            ))
        })?;

        // Stable order: repeatedly take the earliest-defined step whose
        // dependencies are already placed.
        let position: HashMap<&str, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut order = Vec::with_capacity(sorted.len());
        let mut placed: HashSet<NodeIndex> = HashSet::new();
        while order.len() < sorted.len() {
            let next = sorted
                .iter()
                .filter(|n| !placed.contains(*n))
                .filter(|n| {
                    graph
                        .neighbors_directed(**n, Direction::Incoming)
                        .all(|dep| placed.contains(&dep))
                })
                .min_by_key(|n| position.get(graph[**n].as_str()).copied().unwrap_or(usize::MAX))
                .copied();
            let Some(next) = next else {
                break;
            };
            placed.insert(next);
            order.push(graph[next].clone());
        }

        let mut branches = HashMap::new();
        for step in definition.steps.iter().filter(|s| s.step_type == StepType::Branch) {
            let spec = BranchSpec::parse(&step.configuration).map_err(|e| {
                FlowlineError::configuration(format!("branch step '{}': {}", step.id, e))
            })?;
            for target in spec.targets() {
                let depends = definition
                    .step(target)
                    .is_some_and(|t| t.depends_on.iter().any(|d| d == &step.id));
                if !depends {
                    return Err(FlowlineError::configuration(format!(
                        "branch target '{}' of step '{}' must depend on it",
                        target, step.id
                    )));
                }
            }
            branches.insert(step.id.clone(), spec);
        }

        Ok(Self {
            graph,
            nodes,
            order,
            branches,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn branch(&self, step_id: &str) -> Option<&BranchSpec> {
        self.branches.get(step_id)
    }

    fn neighbors(&self, step_id: &str, direction: Direction) -> Vec<String> {
        let Some(node) = self.nodes.get(step_id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort_by_key(|id| self.order.iter().position(|o| o == id));
        ids
    }

    /// Direct dependencies of `step_id`, in plan order
    pub fn dependencies(&self, step_id: &str) -> Vec<String> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Steps depending directly on `step_id`, in plan order
    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// True when `dep` is a branch that ran and did not select `step_id`
    fn deselected(&self, dep: &str, step_id: &str, results: &BTreeMap<String, StepResult>) -> bool {
        let Some(spec) = self.branches.get(dep) else {
            return false;
        };
        if !spec.targets().any(|t| t == step_id) {
            return false;
        }
        let selected = results
            .get(dep)
            .and_then(|r| r.output.as_ref())
            .and_then(|o| o.selected_branches.as_ref());
        selected.is_some_and(|chosen| !chosen.iter().any(|c| c == step_id))
    }

    /// Classify pending steps.
    ///
    /// A pending step is ready once every dependency completed and no
    /// branch it depends on deselected it. It is skipped when a dependency
    /// ended without completing, or was itself skipped in this pass.
    pub fn resolve(&self, results: &BTreeMap<String, StepResult>) -> Resolution {
        let mut resolution = Resolution::default();
        let mut skipped: HashSet<&str> = HashSet::new();

        for step_id in &self.order {
            let pending = results
                .get(step_id)
                .is_some_and(|r| r.status == StepStatus::Pending);
            if !pending {
                continue;
            }

            let deps = self.dependencies(step_id);
            let blocked = deps.iter().any(|dep| {
                skipped.contains(dep.as_str())
                    || self.deselected(dep, step_id, results)
                    || results.get(dep).is_some_and(|r| {
                        r.status.is_terminal() && r.status != StepStatus::Completed
                    })
            });
            if blocked {
                skipped.insert(step_id.as_str());
                resolution.skipped.push(step_id.clone());
                continue;
            }

            let satisfied = deps.iter().all(|dep| {
                results
                    .get(dep)
                    .is_some_and(|r| r.status == StepStatus::Completed)
            });
            if satisfied {
                resolution.ready.push(step_id.clone());
            }
        }
        resolution
    }
}
