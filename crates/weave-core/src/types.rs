use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique workflow execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversational message handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Input for one agent invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTask {
    /// The rendered task description.
    pub prompt: String,
    /// Structured context explicitly shared with the agent.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Prior conversation, already fitted to the context budget.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl AgentTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

/// Structured result of a successful agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Set when the agent asks for the work to be handed to a peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationRequest>,
}

impl AgentOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_delegation(mut self, request: DelegationRequest) -> Self {
        self.delegation = Some(request);
        self
    }

    /// JSON view stored in workflow state: `{"output": text, ..data}`.
    pub fn to_value(&self) -> Value {
        let mut obj = self.data.clone();
        obj.entry("output")
            .or_insert_with(|| Value::String(self.output.clone()));
        Value::Object(obj)
    }
}

/// Request from one agent to hand work to a named peer.
///
/// Immutable once built; the delegation manager consumes it by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    target: String,
    #[serde(default)]
    input: Map<String, Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl DelegationRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            input: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Task text for the target, taken from the `task` input key.
    pub fn task(&self) -> Option<&str> {
        self.input.get("task").and_then(|v| v.as_str())
    }
}

/// Audit record for one delegation hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub origin: String,
    pub target: String,
    pub at: DateTime<Utc>,
    /// 1-based position in the delegation chain.
    pub depth: usize,
}

/// Recorded status of an executed workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    PartiallyCompleted,
    LoopExhausted,
    Cancelled,
}

/// Progress events published while a workflow runs.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    WorkflowStarted {
        execution_id: ExecutionId,
        root: String,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
    },
    NodeFinished {
        execution_id: ExecutionId,
        node_id: String,
        status: NodeStatus,
        elapsed_ms: u64,
    },
    AttemptFailed {
        agent: String,
        attempt: u32,
        error: String,
    },
    Delegated {
        execution_id: ExecutionId,
        provenance: Provenance,
    },
    WorkflowFinished {
        execution_id: ExecutionId,
        status: NodeStatus,
        elapsed_ms: u64,
    },
}
