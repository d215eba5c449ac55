//! Scripted agents and fixtures shared by the Weave test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weave_core::error::AgentError;
use weave_core::traits::Agent;
use weave_core::types::{AgentOutput, AgentTask, DelegationRequest};

/// What a [`MockAgent`] does on one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(AgentOutput),
    Err(AgentError),
    /// Return the task prompt as output.
    Echo,
}

/// Agent driven by a script of replies. Once the script runs out, the
/// default reply repeats forever.
pub struct MockAgent {
    name: String,
    description: String,
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    tasks: Mutex<Vec<AgentTask>>,
}

impl MockAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            script: Mutex::new(VecDeque::new()),
            default: Reply::Echo,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `text`.
    pub fn replying(mut self, text: impl Into<String>) -> Self {
        self.default = Reply::Ok(AgentOutput::text(text));
        self
    }

    /// Always answer with `output`.
    pub fn returning(mut self, output: AgentOutput) -> Self {
        self.default = Reply::Ok(output);
        self
    }

    /// Always fail with `error`.
    pub fn failing(mut self, error: AgentError) -> Self {
        self.default = Reply::Err(error);
        self
    }

    /// Always hand the task to `target`.
    pub fn delegating_to(self, target: &str) -> Self {
        let request = DelegationRequest::new(target)
            .with_input("task", Value::String(format!("continue from {}", self.name)));
        let output = AgentOutput::text(format!("{} delegates", self.name)).with_delegation(request);
        self.returning(output)
    }

    /// Queue a one-off reply ahead of the default.
    pub fn then(self, reply: Reply) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(reply);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of times `run` was called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every task received, in call order.
    pub fn tasks(&self) -> Vec<AgentTask> {
        self.tasks.lock().expect("tasks lock").clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.tasks().into_iter().map(|t| t.prompt).collect()
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn run(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutput, AgentError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.tasks.lock().expect("tasks lock").push(task.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.next_reply() {
                Reply::Ok(output) => Ok(output),
                Reply::Err(e) => Err(e),
                Reply::Echo => Ok(AgentOutput::text(task.prompt)),
            }
        })
    }
}

/// Shorthand for a transient connectivity failure.
pub fn connectivity(msg: &str) -> AgentError {
    AgentError::Connectivity(msg.to_string())
}

/// Shorthand for a rate limit that asks for no wait.
pub fn rate_limited_now() -> AgentError {
    AgentError::RateLimited {
        retry_after: Some(Duration::ZERO),
    }
}
