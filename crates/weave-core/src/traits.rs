use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};
use crate::types::{AgentOutput, AgentTask};

/// An opaque task executor addressed by name.
pub trait Agent: Send + Sync + 'static {
    /// Unique name used for registration and delegation.
    fn name(&self) -> &str;

    /// Human-readable description. Also used as the context preamble.
    fn description(&self) -> &str {
        ""
    }

    /// Run one task and return a structured result or a typed failure.
    fn run(&self, task: AgentTask) -> BoxFuture<'_, std::result::Result<AgentOutput, AgentError>>;
}

/// Structural check applied to an agent's output before it is accepted.
///
/// A rejection is treated as a validation failure and triggers a repair attempt.
pub trait OutputValidator: Send + Sync + 'static {
    fn validate(&self, output: &AgentOutput) -> std::result::Result<(), String>;
}

impl<F> OutputValidator for F
where
    F: Fn(&AgentOutput) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    fn validate(&self, output: &AgentOutput) -> std::result::Result<(), String> {
        self(output)
    }
}

/// Materializes a leaf's input template against the accumulated workflow scope.
pub trait TemplateRenderer: Send + Sync + 'static {
    fn render(&self, template: &str, scope: &Map<String, Value>) -> Result<String>;
}
