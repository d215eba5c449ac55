use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weave_core::config::EngineConfig;
use weave_core::error::{ErrorKind, Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::traits::{OutputValidator, TemplateRenderer};
use weave_core::types::{AgentTask, ExecutionId, Message, Provenance, WorkflowEvent};

use super::condition::Termination;
use super::handle::ExecutionHandle;
use super::node::WorkflowNode;
use super::outcome::{Aggregate, ExecutionResult, FailureReport, WorkflowOutcome};
use super::state::{LogEntry, WorkflowState};
use crate::context::ContextWindowManager;
use crate::delegation::{CallingContext, DelegationManager};
use crate::recovery::RecoveryPolicy;
use crate::registry::AgentRegistry;
use crate::summarizer::Summarizer;
use crate::template::PlaceholderRenderer;
use crate::tokens::TokenEstimator;

/// Per-execution overrides of [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_retries: Option<u32>,
    pub max_concurrency: Option<usize>,
    pub timeout: Option<Duration>,
    pub agent_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }
}

/// Executes workflow trees against a registry of agents.
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    renderer: Arc<dyn TemplateRenderer>,
    context: ContextWindowManager,
    validators: HashMap<String, Arc<dyn OutputValidator>>,
    event_bus: Arc<EventBus>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let context = ContextWindowManager::from_config(&config.context);
        Self {
            registry,
            config,
            renderer: Arc::new(PlaceholderRenderer::new()),
            context,
            validators: HashMap::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.context = self.context.with_estimator(estimator);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.context = self.context.with_summarizer(summarizer);
        self
    }

    /// Check every output of `agent` with `validator`.
    pub fn with_validator(
        mut self,
        agent: impl Into<String>,
        validator: Arc<dyn OutputValidator>,
    ) -> Self {
        self.validators.insert(agent.into(), validator);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run a workflow to completion.
    pub async fn run(
        &self,
        workflow: &WorkflowNode,
        initial: Map<String, Value>,
        options: RunOptions,
    ) -> Result<ExecutionResult> {
        workflow.validate()?;
        let (snapshots, _) = watch::channel(WorkflowState::new());
        Ok(self
            .drive(
                ExecutionId::new(),
                workflow,
                initial,
                options,
                CancellationToken::new(),
                snapshots,
                WorkflowState::new(),
            )
            .await)
    }

    /// Start a workflow in the background and return a handle to it.
    pub fn submit(
        self: &Arc<Self>,
        workflow: WorkflowNode,
        initial: Map<String, Value>,
        options: RunOptions,
    ) -> Result<ExecutionHandle> {
        workflow.validate()?;
        let id = ExecutionId::new();
        let cancel = CancellationToken::new();
        let (snapshots, inspector) = watch::channel(WorkflowState::new());

        let engine = Arc::clone(self);
        let task_id = id.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            engine
                .drive(
                    task_id,
                    &workflow,
                    initial,
                    options,
                    task_cancel,
                    snapshots,
                    WorkflowState::new(),
                )
                .await
        });

        Ok(ExecutionHandle::new(id, cancel, inspector, task))
    }

    /// Execute `workflow` starting from `state`.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        id: ExecutionId,
        workflow: &WorkflowNode,
        initial: Map<String, Value>,
        options: RunOptions,
        cancel: CancellationToken,
        snapshots: watch::Sender<WorkflowState>,
        mut state: WorkflowState,
    ) -> ExecutionResult {
        let start = Instant::now();
        let engine_cfg = &self.config.engine;
        let timeout = options.timeout.or(engine_cfg.timeout());
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(engine_cfg.max_concurrency)
            .max(1);

        let recovery = RecoveryPolicy::new(self.config.recovery.clone())
            .with_max_retries(options.max_retries.unwrap_or(self.config.recovery.max_retries))
            .with_attempt_timeout(options.agent_timeout.or(engine_cfg.agent_timeout()))
            .with_cancel_grace(engine_cfg.cancel_grace())
            .with_event_bus(self.event_bus.clone());
        let delegation = DelegationManager::new(self.registry.clone())
            .with_max_depth(engine_cfg.max_delegation_depth)
            .with_recovery(recovery.clone())
            .with_validators(self.validators.clone());

        let run = Run {
            engine: self,
            id: id.clone(),
            initial,
            recovery,
            delegation,
            permits: Semaphore::new(max_concurrency),
            cancel: cancel.clone(),
            snapshots,
        };

        info!(
            execution_id = %id,
            root = %workflow.id(),
            nodes = workflow.node_count(),
            max_concurrency,
            "Workflow started"
        );
        self.event_bus.publish(WorkflowEvent::WorkflowStarted {
            execution_id: id.clone(),
            root: workflow.id().to_string(),
        });

        let outcome = {
            let driver = run.execute(workflow, &mut state, Frame::default());
            tokio::pin!(driver);
            match timeout {
                Some(limit) => tokio::select! {
                    outcome = &mut driver => outcome,
                    _ = tokio::time::sleep(limit) => {
                        warn!(
                            execution_id = %id,
                            timeout_ms = limit.as_millis() as u64,
                            "Workflow timed out, cancelling"
                        );
                        cancel.cancel();
                        driver.await
                    }
                },
                None => driver.await,
            }
        };

        state.terminate();
        run.snapshots.send_replace(state.clone());

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let status = outcome.status();
        match &outcome {
            WorkflowOutcome::Failed(report) => error!(
                execution_id = %id,
                node_id = %report.node_id,
                kind = %report.kind,
                elapsed_ms,
                "Workflow failed"
            ),
            _ => info!(execution_id = %id, ?status, elapsed_ms, "Workflow finished"),
        }
        self.event_bus.publish(WorkflowEvent::WorkflowFinished {
            execution_id: id.clone(),
            status,
            elapsed_ms,
        });

        ExecutionResult {
            id,
            outcome,
            state,
            elapsed_ms,
        }
    }
}

/// Locals visible to templates, plus where the node runs.
#[derive(Debug, Clone, Default)]
struct Frame {
    /// Value of the previous sibling in a sequence, or the previous loop iteration.
    previous: Option<Value>,
    /// Value of the enclosing loop's last iteration.
    accumulated: Option<Value>,
    iteration: Option<usize>,
    /// Inside a parallel branch: the state is a private copy.
    isolated: bool,
}

/// One in-flight execution.
struct Run<'e> {
    engine: &'e WorkflowEngine,
    id: ExecutionId,
    initial: Map<String, Value>,
    recovery: RecoveryPolicy,
    delegation: DelegationManager,
    permits: Semaphore,
    cancel: CancellationToken,
    snapshots: watch::Sender<WorkflowState>,
}

impl Run<'_> {
    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        state: &'a mut WorkflowState,
        frame: Frame,
    ) -> BoxFuture<'a, WorkflowOutcome> {
        Box::pin(async move {
            let node_id = node.id();
            let started = Instant::now();

            let (outcome, delegations) = if self.cancel.is_cancelled() {
                (WorkflowOutcome::Failed(FailureReport::cancelled(node_id)), Vec::new())
            } else {
                debug!(execution_id = %self.id, node_id, kind = node.kind(), "Node started");
                self.engine.event_bus.publish(WorkflowEvent::NodeStarted {
                    execution_id: self.id.clone(),
                    node_id: node_id.to_string(),
                });

                match node {
                    WorkflowNode::Leaf {
                        id,
                        agent,
                        input_template,
                        fallbacks,
                    } => self.leaf(id, agent, input_template, fallbacks, state, &frame).await,
                    WorkflowNode::Sequential {
                        id,
                        children,
                        best_effort,
                    } => (
                        self.sequential(id, children, *best_effort, state, &frame).await,
                        Vec::new(),
                    ),
                    WorkflowNode::Parallel {
                        id,
                        children,
                        max_concurrency,
                    } => (
                        self.parallel(id, children, *max_concurrency, state, &frame).await,
                        Vec::new(),
                    ),
                    WorkflowNode::Loop {
                        id,
                        child,
                        until,
                        max_iterations,
                    } => (
                        self.looped(id, child, until, *max_iterations, state, &frame).await,
                        Vec::new(),
                    ),
                }
            };

            if let Some(value) = outcome.value() {
                state.set_result(node_id, value);
            }
            let status = outcome.status();
            state.record(LogEntry {
                node_id: node_id.to_string(),
                status,
                iteration: frame.iteration,
                at: Utc::now(),
                delegations,
            });

            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(execution_id = %self.id, node_id, ?status, elapsed_ms, "Node finished");
            self.engine.event_bus.publish(WorkflowEvent::NodeFinished {
                execution_id: self.id.clone(),
                node_id: node_id.to_string(),
                status,
                elapsed_ms,
            });
            if !frame.isolated {
                self.snapshots.send_replace(state.clone());
            }
            outcome
        })
    }

    /// Template scope: initial context, then node results, then locals.
    fn scope(&self, state: &WorkflowState, frame: &Frame) -> Map<String, Value> {
        let mut scope = self.initial.clone();
        for (k, v) in state.results() {
            scope.insert(k.clone(), v.clone());
        }
        if let Some(previous) = &frame.previous {
            scope.insert("previous".into(), previous.clone());
        }
        if let Some(accumulated) = &frame.accumulated {
            scope.insert("accumulated".into(), accumulated.clone());
        }
        if let Some(iteration) = frame.iteration {
            scope.insert("iteration".into(), Value::from(iteration));
        }
        scope
    }

    async fn leaf(
        &self,
        id: &str,
        agent_name: &str,
        template: &str,
        fallbacks: &[String],
        state: &mut WorkflowState,
        frame: &Frame,
    ) -> (WorkflowOutcome, Vec<Provenance>) {
        let fail = |err: WeaveError| {
            (
                WorkflowOutcome::Failed(FailureReport::from_error(id, &err)),
                Vec::new(),
            )
        };

        if state.is_terminal(id) {
            warn!(node_id = id, "Leaf already executed in this scope");
            return (
                WorkflowOutcome::Failed(FailureReport::new(
                    id,
                    ErrorKind::Invalid,
                    vec![format!("node '{}' already executed in this scope", id)],
                )),
                Vec::new(),
            );
        }

        let registry = &self.engine.registry;
        let Some(agent) = registry.get(agent_name) else {
            return fail(WeaveError::AgentNotFound(agent_name.to_string()));
        };

        let scope = self.scope(state, frame);
        let prompt = match self.engine.renderer.render(template, &scope) {
            Ok(prompt) => prompt,
            Err(e) => return fail(e),
        };

        let ctx_cfg = &self.engine.config.context;
        let history = self.engine.context.optimize(
            state.transcript(),
            agent.description(),
            &prompt,
            ctx_cfg.max_tokens,
            ctx_cfg.reserve_tokens,
            ctx_cfg.prioritize_recent,
        );
        let task = AgentTask::new(prompt.clone())
            .with_context(scope.clone())
            .with_messages(history);

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.ok(),
            _ = self.cancel.cancelled() => return fail(WeaveError::Cancelled),
        };

        let policy = self.recovery.for_agent(
            agent_name,
            registry,
            fallbacks,
            self.engine.validators.get(agent_name).cloned(),
        );
        info!(execution_id = %self.id, node_id = id, agent = agent_name, "Invoking agent");
        let output = match policy
            .invoke(&agent, task, &self.cancel)
            .await
            .into_result(agent_name)
        {
            Ok(output) => output,
            Err(e) => {
                warn!(node_id = id, agent = agent_name, error = %e, "Leaf failed");
                return fail(e);
            }
        };

        let (output, provenance) = match output.delegation.clone() {
            Some(request) => {
                let ctx = CallingContext::new(agent_name, prompt.clone())
                    .with_vars(scope)
                    .with_cancel(self.cancel.clone());
                let delegated = self.delegation.delegate(request, &ctx).await;
                let hops = match &delegated {
                    Ok(delegated) => delegated.provenance.as_slice(),
                    Err(e) => e.provenance(),
                };
                for hop in hops {
                    self.engine.event_bus.publish(WorkflowEvent::Delegated {
                        execution_id: self.id.clone(),
                        provenance: hop.clone(),
                    });
                }
                match delegated {
                    Ok(delegated) => (delegated.output, delegated.provenance),
                    Err(e) => {
                        warn!(node_id = id, agent = agent_name, error = %e, "Delegation failed");
                        let hops = e.provenance().to_vec();
                        return (
                            WorkflowOutcome::Failed(FailureReport::from_error(id, &e)),
                            hops,
                        );
                    }
                }
            }
            None => (output, Vec::new()),
        };

        state.push_transcript(Message::user(prompt));
        state.push_transcript(Message::assistant(output.output.clone()));
        (WorkflowOutcome::Completed(output.to_value()), provenance)
    }

    async fn sequential(
        &self,
        id: &str,
        children: &[WorkflowNode],
        best_effort: bool,
        state: &mut WorkflowState,
        frame: &Frame,
    ) -> WorkflowOutcome {
        let mut child_frame = frame.clone();
        let mut aggregate = Aggregate::default();
        let mut partial = false;
        let mut last = Value::Null;

        for child in children {
            let outcome = self.execute(child, state, child_frame.clone()).await;
            let value = match outcome {
                WorkflowOutcome::Completed(value) => value,
                WorkflowOutcome::PartiallyCompleted(nested) => {
                    partial = true;
                    aggregate.absorb(&nested);
                    Value::Object(nested.results)
                }
                WorkflowOutcome::LoopExhausted { node_id, last, .. } => {
                    partial = true;
                    aggregate.exhausted.push(node_id);
                    last
                }
                WorkflowOutcome::Failed(report) => {
                    if !best_effort || report.kind == ErrorKind::Cancelled {
                        return WorkflowOutcome::Failed(report);
                    }
                    aggregate.failures.insert(child.id().to_string(), report);
                    continue;
                }
            };
            aggregate.results.insert(child.id().to_string(), value.clone());
            child_frame.previous = Some(value.clone());
            last = value;
        }

        if !children.is_empty() && aggregate.results.is_empty() && !aggregate.failures.is_empty() {
            return WorkflowOutcome::Failed(FailureReport::combined(id, &aggregate.failures));
        }
        if partial || !aggregate.failures.is_empty() {
            return WorkflowOutcome::PartiallyCompleted(aggregate);
        }
        WorkflowOutcome::Completed(last)
    }

    async fn parallel(
        &self,
        id: &str,
        children: &[WorkflowNode],
        max_concurrency: Option<usize>,
        state: &mut WorkflowState,
        frame: &Frame,
    ) -> WorkflowOutcome {
        if children.is_empty() {
            return WorkflowOutcome::Completed(Value::Object(Map::new()));
        }

        let limit = Semaphore::new(max_concurrency.unwrap_or(children.len()).max(1));
        let mark = state.mark();
        let base: &WorkflowState = state;
        let branch_frame = Frame {
            isolated: true,
            ..frame.clone()
        };

        let branches = children.iter().map(|child| {
            let mut branch = base.clone();
            let frame = branch_frame.clone();
            let limit = &limit;
            async move {
                let _permit = limit.acquire().await.ok();
                let outcome = self.execute(child, &mut branch, frame).await;
                (child, outcome, branch)
            }
        });
        let joined = join_all(branches).await;
        debug!(node_id = id, branches = joined.len(), "Parallel barrier reached");

        let mut aggregate = Aggregate::default();
        let mut partial = false;
        for (child, outcome, branch) in joined {
            state.merge_branch(branch, &child.subtree_ids(), mark);
            let child_id = child.id().to_string();
            match outcome {
                WorkflowOutcome::Completed(value) => {
                    aggregate.results.insert(child_id, value);
                }
                WorkflowOutcome::PartiallyCompleted(nested) => {
                    partial = true;
                    aggregate.absorb(&nested);
                    aggregate.results.insert(child_id, Value::Object(nested.results));
                }
                WorkflowOutcome::LoopExhausted { node_id, last, .. } => {
                    partial = true;
                    aggregate.exhausted.push(node_id);
                    aggregate.results.insert(child_id, last);
                }
                WorkflowOutcome::Failed(report) => {
                    aggregate.failures.insert(child_id, report);
                }
            }
        }

        if aggregate.results.is_empty() {
            return WorkflowOutcome::Failed(FailureReport::combined(id, &aggregate.failures));
        }
        if partial || !aggregate.failures.is_empty() {
            return WorkflowOutcome::PartiallyCompleted(aggregate);
        }
        WorkflowOutcome::Completed(Value::Object(aggregate.results))
    }

    async fn looped(
        &self,
        id: &str,
        child: &WorkflowNode,
        until: &Termination,
        max_iterations: usize,
        state: &mut WorkflowState,
        frame: &Frame,
    ) -> WorkflowOutcome {
        let subtree = child.subtree_ids();
        let mut accumulated: Option<Value> = None;

        for iteration in 1..=max_iterations {
            if iteration > 1 {
                state.reopen(&subtree);
            }
            let child_frame = Frame {
                previous: accumulated.clone().or_else(|| frame.previous.clone()),
                accumulated: accumulated.clone(),
                iteration: Some(iteration),
                isolated: frame.isolated,
            };

            let value = match self.execute(child, state, child_frame).await {
                WorkflowOutcome::Completed(value) => value,
                WorkflowOutcome::LoopExhausted { last, .. } => last,
                other @ (WorkflowOutcome::Failed(_) | WorkflowOutcome::PartiallyCompleted(_)) => {
                    debug!(node_id = id, iteration, "Loop iteration did not complete, stopping");
                    return other;
                }
            };

            let done = until.is_satisfied(&value, iteration);
            if done {
                debug!(node_id = id, iteration, "Loop condition satisfied");
                return WorkflowOutcome::Completed(value);
            }
            accumulated = Some(value);
        }

        warn!(node_id = id, max_iterations, "Loop exhausted without satisfying its condition");
        WorkflowOutcome::LoopExhausted {
            node_id: id.to_string(),
            iterations: max_iterations,
            last: accumulated.unwrap_or(Value::Null),
        }
    }
}
