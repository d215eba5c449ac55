use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use weave_core::error::{Result, WeaveError};

use super::condition::Termination;

/// A node in a workflow tree.
///
/// Trees are owned, so cycles cannot be expressed. Node ids must be unique
/// across the whole tree; see [`WorkflowNode::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowNode {
    /// One agent invocation.
    Leaf {
        id: String,
        agent: String,
        /// Rendered against the workflow scope to produce the agent's task.
        #[serde(default = "default_input_template")]
        input_template: String,
        /// Tried in order on connectivity failures. Overrides configured fallbacks.
        #[serde(default)]
        fallbacks: Vec<String>,
    },
    /// Children in strict order.
    Sequential {
        id: String,
        children: Vec<WorkflowNode>,
        /// Keep going past failed children and report what succeeded.
        #[serde(default)]
        best_effort: bool,
    },
    /// Children concurrently, joined at a barrier.
    Parallel {
        id: String,
        children: Vec<WorkflowNode>,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
    /// Repeat `child` until `until` holds, at most `max_iterations` times.
    Loop {
        id: String,
        child: Box<WorkflowNode>,
        #[serde(default)]
        until: Termination,
        max_iterations: usize,
    },
}

fn default_input_template() -> String {
    "{{task}}".to_string()
}

impl WorkflowNode {
    pub fn leaf(id: impl Into<String>, agent: impl Into<String>, input_template: impl Into<String>) -> Self {
        WorkflowNode::Leaf {
            id: id.into(),
            agent: agent.into(),
            input_template: input_template.into(),
            fallbacks: Vec::new(),
        }
    }

    pub fn sequential(id: impl Into<String>, children: Vec<WorkflowNode>) -> Self {
        WorkflowNode::Sequential {
            id: id.into(),
            children,
            best_effort: false,
        }
    }

    pub fn best_effort(id: impl Into<String>, children: Vec<WorkflowNode>) -> Self {
        WorkflowNode::Sequential {
            id: id.into(),
            children,
            best_effort: true,
        }
    }

    pub fn parallel(id: impl Into<String>, children: Vec<WorkflowNode>) -> Self {
        WorkflowNode::Parallel {
            id: id.into(),
            children,
            max_concurrency: None,
        }
    }

    pub fn looping(
        id: impl Into<String>,
        child: WorkflowNode,
        until: Termination,
        max_iterations: usize,
    ) -> Self {
        WorkflowNode::Loop {
            id: id.into(),
            child: Box::new(child),
            until,
            max_iterations,
        }
    }

    /// Set leaf fallbacks. No effect on other node types.
    pub fn with_fallbacks(mut self, names: Vec<String>) -> Self {
        if let WorkflowNode::Leaf { fallbacks, .. } = &mut self {
            *fallbacks = names;
        }
        self
    }

    /// Cap concurrent children of a parallel node. No effect on other node types.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        if let WorkflowNode::Parallel { max_concurrency, .. } = &mut self {
            *max_concurrency = Some(limit);
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            WorkflowNode::Leaf { id, .. }
            | WorkflowNode::Sequential { id, .. }
            | WorkflowNode::Parallel { id, .. }
            | WorkflowNode::Loop { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowNode::Leaf { .. } => "leaf",
            WorkflowNode::Sequential { .. } => "sequential",
            WorkflowNode::Parallel { .. } => "parallel",
            WorkflowNode::Loop { .. } => "loop",
        }
    }

    pub fn children(&self) -> Vec<&WorkflowNode> {
        match self {
            WorkflowNode::Leaf { .. } => Vec::new(),
            WorkflowNode::Sequential { children, .. } | WorkflowNode::Parallel { children, .. } => {
                children.iter().collect()
            }
            WorkflowNode::Loop { child, .. } => vec![child.as_ref()],
        }
    }

    /// Ids of this node and every descendant, depth-first.
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id().to_string()];
        for child in self.children() {
            ids.extend(child.subtree_ids());
        }
        ids
    }

    /// Every agent name the tree refers to, fallbacks included.
    pub fn agent_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        if let WorkflowNode::Leaf {
            agent, fallbacks, ..
        } = self
        {
            names.insert(agent.clone());
            names.extend(fallbacks.iter().cloned());
        }
        for child in self.children() {
            names.extend(child.agent_names());
        }
        names
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        self.validate_into(&mut seen)
    }

    fn validate_into(&self, seen: &mut HashSet<String>) -> Result<()> {
        let id = self.id();
        if id.trim().is_empty() {
            return Err(WeaveError::InvalidWorkflow(format!(
                "{} node has an empty id",
                self.kind()
            )));
        }
        if !seen.insert(id.to_string()) {
            return Err(WeaveError::InvalidWorkflow(format!("duplicate node id '{}'", id)));
        }

        match self {
            WorkflowNode::Leaf { agent, .. } if agent.trim().is_empty() => {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "leaf '{}' names no agent",
                    id
                )));
            }
            WorkflowNode::Parallel {
                max_concurrency: Some(0),
                ..
            } => {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "parallel '{}' has max_concurrency 0",
                    id
                )));
            }
            WorkflowNode::Loop {
                max_iterations: 0, ..
            } => {
                return Err(WeaveError::InvalidWorkflow(format!(
                    "loop '{}' has max_iterations 0",
                    id
                )));
            }
            _ => {}
        }

        for child in self.children() {
            child.validate_into(seen)?;
        }
        Ok(())
    }
}
