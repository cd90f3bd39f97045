use crate::error::{Result, WorkflowError};
use crate::types::{StepDeclaration, StepId};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Dependency graph over the steps of one workflow
pub struct DependencyGraph {
    graph: DiGraph<StepId, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
    /// Declared dependencies per step, in declaration order
    dependencies: HashMap<StepId, Vec<StepId>>,
    order: Vec<StepId>,
}

impl DependencyGraph {
    /// Build the graph from a flat step list.
    ///
    /// Duplicate ids and dependencies on unknown steps are configuration
    /// errors. Cycles are accepted here and surface when scheduling stalls.
    pub fn build(steps: &[StepDeclaration]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();
        let mut dependencies = HashMap::new();
        let mut order = Vec::with_capacity(steps.len());

        // Add all steps as nodes
        for step in steps {
            if step_indices.contains_key(&step.step_id) {
                return Err(WorkflowError::DuplicateStep {
                    step_id: step.step_id.clone(),
                });
            }
            let node = graph.add_node(step.step_id.clone());
            step_indices.insert(step.step_id.clone(), node);
            order.push(step.step_id.clone());
        }

        // Add dependency edges
        for step in steps {
            let step_idx = step_indices[&step.step_id];
            for dep_id in &step.dependencies {
                let dep_idx = step_indices.get(dep_id).ok_or_else(|| {
                    WorkflowError::MissingDependency {
                        step_id: step.step_id.clone(),
                        dependency_id: dep_id.clone(),
                    }
                })?;

                // Edge from dependency to dependent (dep -> step)
                graph.add_edge(*dep_idx, step_idx, ());
            }
            dependencies.insert(step.step_id.clone(), step.dependencies.clone());
        }

        Ok(Self {
            graph,
            step_indices,
            dependencies,
            order,
        })
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.step_indices.contains_key(step_id)
    }

    /// Declared dependencies of a step
    pub fn dependencies(&self, step_id: &StepId) -> &[StepId] {
        self.dependencies
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// A step is ready once every declared dependency has completed
    pub fn is_ready(&self, step_id: &StepId, completed_steps: &HashSet<StepId>) -> bool {
        self.dependencies(step_id)
            .iter()
            .all(|dep| completed_steps.contains(dep))
    }

    /// Dependencies of a step that have not completed yet
    pub fn missing_dependencies(
        &self,
        step_id: &StepId,
        completed_steps: &HashSet<StepId>,
    ) -> Vec<StepId> {
        self.dependencies(step_id)
            .iter()
            .filter(|dep| !completed_steps.contains(*dep))
            .cloned()
            .collect()
    }

    /// Every strongly connected component that forms a cycle, members in
    /// declaration order
    pub fn cycles(&self) -> Vec<Vec<StepId>> {
        let mut cycles: Vec<Vec<StepId>> = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut ids: Vec<StepId> = scc.into_iter().map(|n| self.graph[n].clone()).collect();
                ids.sort_by_key(|id| self.position(id));
                ids
            })
            .collect();
        cycles.sort_by_key(|ids| self.position(&ids[0]));
        cycles
    }

    /// The cycle a step belongs to, if any
    pub fn cycle_containing(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        self.cycles().into_iter().find(|cycle| cycle.contains(step_id))
    }

    fn position(&self, step_id: &StepId) -> usize {
        self.order
            .iter()
            .position(|id| id == step_id)
            .unwrap_or(usize::MAX)
    }
}
