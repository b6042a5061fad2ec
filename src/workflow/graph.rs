//! In-memory workflow graph.
//!
//! Step rows are loaded once per execution into an arena of typed nodes with
//! index edges. Structural defects are rejected here, before any step runs.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::error::WorkflowError;
use crate::workflow::model::{
    ActionConfig, ConditionConfig, EndConfig, EndStatus, StepKind, WorkflowStep,
};

/// Typed step behaviour.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Parse,
    Condition(ConditionConfig),
    Action(ActionConfig),
    End(EndStatus),
}

impl Step {
    fn from_row(row: &WorkflowStep) -> Result<Self, WorkflowError> {
        let bad_config = |e: serde_json::Error| {
            WorkflowError::Config(format!(
                "step {} ({}) has invalid config: {e}",
                row.id,
                row.kind.as_str()
            ))
        };
        Ok(match row.kind {
            StepKind::Parse => Step::Parse,
            StepKind::Condition => {
                Step::Condition(serde_json::from_value(row.config.clone()).map_err(bad_config)?)
            }
            StepKind::ApiAction => {
                Step::Action(serde_json::from_value(row.config.clone()).map_err(bad_config)?)
            }
            StepKind::End => {
                let end: EndConfig =
                    serde_json::from_value(row.config.clone()).map_err(bad_config)?;
                Step::End(end.status)
            }
        })
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Step::End(_))
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: Uuid,
    pub order: i64,
    pub step: Step,
    pub enabled: bool,
    pub on_success: Option<usize>,
    pub on_failure: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    entry: usize,
}

impl WorkflowGraph {
    /// Validate step rows and link them into a graph.
    pub fn build(workflow_id: Uuid, rows: &[WorkflowStep]) -> Result<Self, WorkflowError> {
        if rows.is_empty() {
            return Err(WorkflowError::Config(format!(
                "workflow {workflow_id} has no steps"
            )));
        }

        let mut index = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if index.insert(row.id, i).is_some() {
                return Err(WorkflowError::Config(format!("duplicate step id {}", row.id)));
            }
        }

        let resolve = |from: Uuid, edge: Option<Uuid>| -> Result<Option<usize>, WorkflowError> {
            match edge {
                None => Ok(None),
                Some(target) => index.get(&target).copied().map(Some).ok_or_else(|| {
                    WorkflowError::Config(format!("step {from} points at unknown step {target}"))
                }),
            }
        };

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let step = Step::from_row(row)?;
            let on_success = resolve(row.id, row.next_on_success)?;
            let on_failure = resolve(row.id, row.next_on_failure)?;

            let has_edge = on_success.is_some() || on_failure.is_some();
            if step.is_end() && has_edge {
                return Err(WorkflowError::Config(format!(
                    "end step {} must not have outgoing edges",
                    row.id
                )));
            }
            if !step.is_end() && !has_edge {
                return Err(WorkflowError::Config(format!(
                    "step {} ({}) has no outgoing edge",
                    row.id,
                    row.kind.as_str()
                )));
            }

            nodes.push(Node {
                id: row.id,
                order: row.order,
                step,
                enabled: row.is_enabled,
                on_success,
                on_failure,
            });
        }

        let targets: HashSet<usize> = nodes
            .iter()
            .flat_map(|n| [n.on_success, n.on_failure])
            .flatten()
            .collect();
        let entry = (0..nodes.len())
            .filter(|i| !targets.contains(i))
            .min_by_key(|&i| nodes[i].order);
        // Every step has an incoming edge, so the steps close on themselves.
        let Some(entry) = entry else {
            let first = nodes
                .iter()
                .min_by_key(|n| n.order)
                .map(|n| n.id)
                .unwrap_or_default();
            return Err(WorkflowError::Cycle {
                workflow_id,
                step_id: first,
            });
        };

        Ok(Self { nodes, entry })
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Closest enabled `end{failure}` reachable from `from`, breadth-first,
    /// failure edges explored before success edges.
    pub fn nearest_failure_end(&self, from: usize) -> Option<usize> {
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            let node = &self.nodes[current];
            if current != from && node.enabled && node.step == Step::End(EndStatus::Failure) {
                return Some(current);
            }
            for next in [node.on_failure, node.on_success].into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        None
    }
}
