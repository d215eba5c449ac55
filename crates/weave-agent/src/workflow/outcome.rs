use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weave_core::error::{ErrorKind, WeaveError};
use weave_core::types::{ExecutionId, NodeStatus};

use super::state::WorkflowState;

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub node_id: String,
    pub kind: ErrorKind,
    /// Underlying causes, outermost first.
    pub causes: Vec<String>,
}

impl FailureReport {
    pub fn new(node_id: impl Into<String>, kind: ErrorKind, causes: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            causes,
        }
    }

    pub fn from_error(node_id: impl Into<String>, err: &WeaveError) -> Self {
        Self::new(node_id, err.kind(), err.cause_chain())
    }

    pub fn cancelled(node_id: impl Into<String>) -> Self {
        Self::from_error(node_id, &WeaveError::Cancelled)
    }

    /// One report for a composite whose children all failed.
    pub fn combined(node_id: impl Into<String>, failures: &BTreeMap<String, FailureReport>) -> Self {
        let kind = failures
            .values()
            .next()
            .map(|f| f.kind)
            .unwrap_or(ErrorKind::Unknown);
        let causes = failures
            .values()
            .flat_map(|f| f.causes.iter().map(move |c| format!("{}: {}", f.node_id, c)))
            .collect();
        Self::new(node_id, kind, causes)
    }
}

/// Mixed results of a composite node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Child id -> value, for every child that produced one.
    pub results: Map<String, Value>,
    /// Failing node id -> report.
    pub failures: BTreeMap<String, FailureReport>,
    /// Ids of loops that ran out of iterations.
    pub exhausted: Vec<String>,
}

impl Aggregate {
    /// Fold a nested aggregate's failures and exhausted loops into this one.
    pub(crate) fn absorb(&mut self, nested: &Aggregate) {
        for (id, report) in &nested.failures {
            self.failures.insert(id.clone(), report.clone());
        }
        self.exhausted.extend(nested.exhausted.iter().cloned());
    }
}

/// Terminal outcome of a node or a whole workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed(Value),
    Failed(FailureReport),
    PartiallyCompleted(Aggregate),
    LoopExhausted {
        node_id: String,
        iterations: usize,
        last: Value,
    },
}

impl WorkflowOutcome {
    pub fn status(&self) -> NodeStatus {
        match self {
            WorkflowOutcome::Completed(_) => NodeStatus::Completed,
            WorkflowOutcome::Failed(report) if report.kind == ErrorKind::Cancelled => {
                NodeStatus::Cancelled
            }
            WorkflowOutcome::Failed(_) => NodeStatus::Failed,
            WorkflowOutcome::PartiallyCompleted(_) => NodeStatus::PartiallyCompleted,
            WorkflowOutcome::LoopExhausted { .. } => NodeStatus::LoopExhausted,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, WorkflowOutcome::Completed(_))
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            WorkflowOutcome::Failed(report) => Some(report),
            _ => None,
        }
    }

    /// Value stored in state for this node, if it produced one.
    pub fn value(&self) -> Option<Value> {
        match self {
            WorkflowOutcome::Completed(v) => Some(v.clone()),
            WorkflowOutcome::PartiallyCompleted(agg) => Some(Value::Object(agg.results.clone())),
            WorkflowOutcome::LoopExhausted { last, .. } => Some(last.clone()),
            WorkflowOutcome::Failed(_) => None,
        }
    }
}

/// Everything known about a finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: ExecutionId,
    pub outcome: WorkflowOutcome,
    pub state: WorkflowState,
    pub elapsed_ms: u64,
}
