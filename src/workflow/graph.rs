//! Step graph arena
//!
//! Steps of one workflow held in an indexed collection ordered by `step_order`.
//! Branch targets stay as step ids on the records and are resolved through the
//! arena, so a missing target is an `Option` miss rather than a dangling
//! reference. Authoring validates the graph with petgraph: branch targets must
//! exist, only condition steps may branch, and the default edges plus branch
//! edges must form a DAG so every execution terminates.
//!
//! Branch arms are exclusive: a step that is the branch target of some
//! condition is entered only through that branch. Default sequencing never
//! falls into a branch target, so the true arm of a condition ends instead of
//! running into the false arm laid out after it.

use crate::error::{EngineError, EngineResult};
use crate::workflow::types::WorkflowStep;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Indexed, order-sorted view of a workflow's steps
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Steps sorted by `step_order`
    steps: Vec<WorkflowStep>,
    /// step id -> position in `steps`
    by_id: HashMap<String, usize>,
    /// Ids referenced as a branch target by some enabled condition step
    branch_targets: HashSet<String>,
}

impl StepGraph {
    pub fn new(mut steps: Vec<WorkflowStep>) -> Self {
        steps.sort_by_key(|step| step.step_order);
        let by_id = steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.id.clone(), index))
            .collect();
        let branch_targets = steps
            .iter()
            .filter(|step| step.is_active && step.action.is_condition())
            .flat_map(|step| [step.on_true_step_id.clone(), step.on_false_step_id.clone()])
            .flatten()
            .collect();
        Self {
            steps,
            by_id,
            branch_targets,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    /// Entry point of an execution: the lowest `step_order`
    pub fn first(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }

    /// Step whose `step_order` equals `order`
    pub fn at_order(&self, order: i64) -> Option<&WorkflowStep> {
        self.steps
            .binary_search_by_key(&order, |step| step.step_order)
            .ok()
            .map(|index| &self.steps[index])
    }

    /// Default successor: the step with the smallest `step_order` greater than `order`
    pub fn next_after(&self, order: i64) -> Option<&WorkflowStep> {
        let index = self.steps.partition_point(|step| step.step_order <= order);
        self.steps.get(index)
    }

    /// Where an execution goes after finishing the step at `order` without branching
    ///
    /// `None` (completion) when there is no later step or when the next step is a
    /// branch arm, which may only be entered through its condition. Arms of a
    /// disabled condition are ordinary steps in the sequence.
    pub fn fall_through(&self, order: i64) -> Option<&WorkflowStep> {
        self.next_after(order)
            .filter(|next| !self.branch_targets.contains(&next.id))
    }

    pub fn is_branch_target(&self, id: &str) -> bool {
        self.branch_targets.contains(id)
    }

    pub fn by_id(&self, id: &str) -> Option<&WorkflowStep> {
        self.by_id.get(id).map(|&index| &self.steps[index])
    }

    /// Resolve an optional branch target id to its step
    pub fn branch_target(&self, target: Option<&str>) -> Option<&WorkflowStep> {
        target.and_then(|id| self.by_id(id))
    }

    /// Validate structural invariants of the step set
    pub fn validate(&self) -> EngineResult<()> {
        for pair in self.steps.windows(2) {
            if pair[0].step_order == pair[1].step_order {
                return Err(EngineError::invalid(format!(
                    "steps '{}' and '{}' share step_order {}",
                    pair[0].id, pair[1].id, pair[0].step_order
                )));
            }
        }

        for step in &self.steps {
            let targets = [step.on_true_step_id.as_deref(), step.on_false_step_id.as_deref()];
            if !step.action.is_condition() && targets.iter().any(Option::is_some) {
                return Err(EngineError::invalid(format!(
                    "only condition steps may declare branch targets (step '{}' is {})",
                    step.id,
                    step.step_type()
                )));
            }
            for target in targets.into_iter().flatten() {
                if target == step.id {
                    return Err(EngineError::invalid(format!(
                        "condition step '{}' branches to itself",
                        step.id
                    )));
                }
                if !self.by_id.contains_key(target) {
                    return Err(EngineError::invalid(format!(
                        "branch target '{}' of step '{}' is not a step of this workflow",
                        target, step.id
                    )));
                }
            }
        }

        if is_cyclic_directed(&self.to_digraph()) {
            return Err(EngineError::invalid(
                "step graph contains a cycle; branch targets must point forward",
            ));
        }

        Ok(())
    }

    /// Build the control-flow graph: fall-through edges for non-condition steps, branch edges for conditions
    fn to_digraph(&self) -> DiGraph<usize, ()> {
        let mut graph = DiGraph::with_capacity(self.steps.len(), self.steps.len() * 2);
        let nodes: Vec<NodeIndex> = (0..self.steps.len()).map(|index| graph.add_node(index)).collect();

        for (index, step) in self.steps.iter().enumerate() {
            if step.action.is_condition() {
                // a disabled condition passes through in order but may be re-enabled
                let next_index = self
                    .next_after(step.step_order)
                    .and_then(|next| self.by_id.get(&next.id));
                if let (false, Some(&next_index)) = (step.is_active, next_index) {
                    graph.add_edge(nodes[index], nodes[next_index], ());
                }
                for target in [step.on_true_step_id.as_deref(), step.on_false_step_id.as_deref()]
                    .into_iter()
                    .flatten()
                {
                    if let Some(&target_index) = self.by_id.get(target) {
                        graph.add_edge(nodes[index], nodes[target_index], ());
                    }
                }
            } else if let Some(next) = self.fall_through(step.step_order) {
                if let Some(&next_index) = self.by_id.get(&next.id) {
                    graph.add_edge(nodes[index], nodes[next_index], ());
                }
            }
        }

        graph
    }
}
