use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weave_core::config::RecoveryConfig;
use weave_core::error::{AgentError, AttemptRecord, ErrorKind, Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::traits::{Agent, OutputValidator};
use weave_core::types::{AgentOutput, AgentTask, WorkflowEvent};

use crate::registry::AgentRegistry;

/// Instruction sent instead of the original task after a validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairDirective {
    original_task: String,
    error: String,
}

impl RepairDirective {
    pub fn new(original_task: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            original_task: original_task.into(),
            error: error.into(),
        }
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn render(&self) -> String {
        format!(
            "Your previous response failed validation: {}\n\n\
             Original task:\n{}\n\n\
             Return a corrected response that addresses the validation error.",
            self.error, self.original_task
        )
    }
}

/// How the next attempt should be made.
#[derive(Debug, Clone, Default)]
pub struct AttemptPlan {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Index into the policy's fallbacks, or `None` for the primary agent.
    pub fallback: Option<usize>,
    pub repair: Option<RepairDirective>,
}

/// Result of a guarded invocation.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Succeeded {
        output: AgentOutput,
        history: Vec<AttemptRecord>,
    },
    /// The retry budget ran out.
    Exhausted {
        last: AgentError,
        retries: u32,
        history: Vec<AttemptRecord>,
    },
    Cancelled {
        history: Vec<AttemptRecord>,
    },
}

impl RecoveryOutcome {
    /// Every failed attempt, in order.
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            RecoveryOutcome::Succeeded { history, .. }
            | RecoveryOutcome::Exhausted { history, .. }
            | RecoveryOutcome::Cancelled { history } => history,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryOutcome::Succeeded { .. })
    }

    /// Convert into the output or a terminal error carrying the attempt history.
    ///
    /// A cancellation that interrupted earlier failed attempts keeps them.
    pub fn into_result(self, agent: &str) -> Result<AgentOutput> {
        match self {
            RecoveryOutcome::Succeeded { output, .. } => Ok(output),
            RecoveryOutcome::Exhausted { last, history, .. } => Err(WeaveError::AgentExecution {
                agent: agent.to_string(),
                attempts: history,
                last,
            }),
            RecoveryOutcome::Cancelled { history }
                if history.iter().all(|r| r.kind == ErrorKind::Cancelled) =>
            {
                Err(WeaveError::Cancelled)
            }
            RecoveryOutcome::Cancelled { history } => Err(WeaveError::Interrupted {
                agent: agent.to_string(),
                attempts: history,
            }),
        }
    }
}

/// Retry, fallback, and repair policy around a single agent invocation.
///
/// - Rate limits wait `retry_after` (or exponential backoff) and count against retries.
/// - Connectivity failures move to the next unused fallback without counting;
///   with no fallback left they count and the primary is retried.
/// - The first validation failure is retried with a [`RepairDirective`] without
///   counting; later validation failures count.
/// - Cancellation stops immediately. Anything else counts.
#[derive(Clone)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
    fallbacks: Vec<Arc<dyn Agent>>,
    validator: Option<Arc<dyn OutputValidator>>,
    attempt_timeout: Option<Duration>,
    cancel_grace: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            fallbacks: Vec::new(),
            validator: None,
            attempt_timeout: None,
            cancel_grace: Duration::ZERO,
            event_bus: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Arc<dyn Agent>>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attempts running longer than `timeout` fail as connectivity failures.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// How long an in-flight attempt is awaited after cancellation before it is dropped.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Specialize this policy for one agent.
    ///
    /// Fallbacks come from `override_fallbacks` when non-empty, otherwise from
    /// the configured fallback table. Names missing from the registry are skipped.
    pub fn for_agent(
        &self,
        agent: &str,
        registry: &AgentRegistry,
        override_fallbacks: &[String],
        validator: Option<Arc<dyn OutputValidator>>,
    ) -> Self {
        let names = if override_fallbacks.is_empty() {
            self.config
                .fallbacks
                .get(agent)
                .map(Vec::as_slice)
                .unwrap_or_default()
        } else {
            override_fallbacks
        };
        let fallbacks = names
            .iter()
            .filter(|name| name.as_str() != agent)
            .filter_map(|name| {
                let found = registry.get(name);
                if found.is_none() {
                    warn!(agent = %agent, fallback = %name, "Fallback agent not registered, skipping");
                }
                found
            })
            .collect();

        let mut policy = self.clone();
        policy.fallbacks = fallbacks;
        policy.validator = validator;
        policy
    }

    /// Invoke `agent` with `task` under this policy.
    pub async fn invoke(
        &self,
        agent: &Arc<dyn Agent>,
        task: AgentTask,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        let original = task.prompt.clone();
        self.execute(agent.name(), &original, cancel, |plan| {
            let target = plan
                .fallback
                .and_then(|i| self.fallbacks.get(i).cloned())
                .unwrap_or_else(|| agent.clone());
            let mut task = task.clone();
            if let Some(repair) = &plan.repair {
                task.prompt = repair.render();
            }
            async move { target.run(task).await }
        })
        .await
    }

    /// Drive `attempt` until it succeeds, the retry budget runs out, or `cancel` fires.
    pub async fn execute<F, Fut>(
        &self,
        agent: &str,
        original_task: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> RecoveryOutcome
    where
        F: FnMut(AttemptPlan) -> Fut,
        Fut: Future<Output = std::result::Result<AgentOutput, AgentError>>,
    {
        let max_retries = self.config.max_retries;
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut plan = AttemptPlan::default();
        let mut counted_failures = 0u32;
        let mut next_fallback = 0usize;

        loop {
            if cancel.is_cancelled() {
                return RecoveryOutcome::Cancelled { history };
            }
            plan.attempt += 1;
            let served_by = self.served_by(agent, &plan);

            let err = match self.attempt_once(&mut attempt, plan.clone(), cancel).await {
                Ok(output) => {
                    if !history.is_empty() {
                        info!(
                            agent = %served_by,
                            attempts = plan.attempt,
                            "Agent succeeded after recovery"
                        );
                    }
                    return RecoveryOutcome::Succeeded { output, history };
                }
                Err(e) => e,
            };

            let counted = match &err {
                AgentError::Cancelled => {
                    history.push(self.record(&plan, &served_by, &err, false));
                    return RecoveryOutcome::Cancelled { history };
                }
                AgentError::RateLimited { .. } | AgentError::Other(_) => true,
                AgentError::Connectivity(_) => {
                    if next_fallback < self.fallbacks.len() {
                        plan.fallback = Some(next_fallback);
                        next_fallback += 1;
                        false
                    } else {
                        plan.fallback = None;
                        true
                    }
                }
                AgentError::Validation(msg) => {
                    let first = plan.repair.is_none();
                    plan.repair = Some(RepairDirective::new(original_task, msg.clone()));
                    !first
                }
            };
            history.push(self.record(&plan, &served_by, &err, counted));

            if counted {
                counted_failures += 1;
                if counted_failures > max_retries {
                    warn!(
                        agent = %agent,
                        attempts = history.len(),
                        error = %err,
                        "Agent retries exhausted"
                    );
                    return RecoveryOutcome::Exhausted {
                        last: err,
                        retries: max_retries,
                        history,
                    };
                }
            }

            if let AgentError::RateLimited { retry_after } = &err {
                let wait = retry_after
                    .unwrap_or_else(|| self.config.backoff(counted_failures.saturating_sub(1)));
                debug!(agent = %agent, wait_ms = wait.as_millis() as u64, "Waiting out rate limit");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return RecoveryOutcome::Cancelled { history },
                }
            }
        }
    }

    async fn attempt_once<F, Fut>(
        &self,
        attempt: &mut F,
        plan: AttemptPlan,
        cancel: &CancellationToken,
    ) -> std::result::Result<AgentOutput, AgentError>
    where
        F: FnMut(AttemptPlan) -> Fut,
        Fut: Future<Output = std::result::Result<AgentOutput, AgentError>>,
    {
        let timeout = self.attempt_timeout;
        let call = attempt(plan);
        let guarded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(AgentError::Connectivity(format!(
                        "attempt timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
                None => call.await,
            }
        };
        tokio::pin!(guarded);

        let result = tokio::select! {
            r = &mut guarded => r,
            _ = cancel.cancelled() => {
                // Let the agent wind down, but discard whatever it returns.
                let _ = tokio::time::timeout(self.cancel_grace, &mut guarded).await;
                Err(AgentError::Cancelled)
            }
        };

        let output = result?;
        if let Some(validator) = &self.validator {
            validator.validate(&output).map_err(AgentError::Validation)?;
        }
        Ok(output)
    }

    fn served_by(&self, agent: &str, plan: &AttemptPlan) -> String {
        plan.fallback
            .and_then(|i| self.fallbacks.get(i))
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| agent.to_string())
    }

    fn record(
        &self,
        plan: &AttemptPlan,
        served_by: &str,
        err: &AgentError,
        counted: bool,
    ) -> AttemptRecord {
        warn!(
            agent = %served_by,
            attempt = plan.attempt,
            kind = %err.kind(),
            counted,
            error = %err,
            "Agent attempt failed"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(WorkflowEvent::AttemptFailed {
                agent: served_by.to_string(),
                attempt: plan.attempt,
                error: err.to_string(),
            });
        }
        AttemptRecord {
            attempt: plan.attempt,
            agent: served_by.to_string(),
            kind: err.kind(),
            error: err.to_string(),
            counted,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::error::ErrorKind;
    use weave_test_utils::{connectivity, rate_limited_now, MockAgent, Reply};

    fn policy(max_retries: u32) -> RecoveryPolicy {
        RecoveryPolicy::default().with_max_retries(max_retries)
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let agent = MockAgent::new("a").replying("ok").into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(3)
            .invoke(&dyn_agent, AgentTask::new("task"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
        assert!(outcome.history().is_empty());
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_always_rate_limited_exhausts_with_full_chain() {
        let agent = MockAgent::new("busy").failing(rate_limited_now()).into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(3)
            .invoke(&dyn_agent, AgentTask::new("task"), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Exhausted { retries: 3, .. }));
        let err = outcome.into_result("busy").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.cause_chain().len(), 4);
        assert_eq!(agent.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_hint_backs_off_exponentially() {
        let limited = AgentError::RateLimited { retry_after: None };
        let agent = MockAgent::new("a")
            .then(Reply::Err(limited.clone()))
            .then(Reply::Err(limited))
            .replying("ok")
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();

        let start = tokio::time::Instant::now();
        let outcome = policy(3)
            .invoke(&dyn_agent, AgentTask::new("task"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
        // 1s + 2s
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(outcome.history().len(), 2);
    }

    #[tokio::test]
    async fn test_connectivity_uses_fallback_without_counting() {
        let primary = MockAgent::new("primary").failing(connectivity("reset")).into_arc();
        let backup = MockAgent::new("backup").replying("from backup").into_arc();
        let dyn_primary: Arc<dyn Agent> = primary.clone();

        let outcome = policy(0)
            .with_fallbacks(vec![backup.clone() as Arc<dyn Agent>])
            .invoke(&dyn_primary, AgentTask::new("task"), &CancellationToken::new())
            .await;

        match outcome {
            RecoveryOutcome::Succeeded { output, history } => {
                assert_eq!(output.output, "from backup");
                assert_eq!(history.len(), 1);
                assert!(!history[0].counted);
                assert_eq!(history[0].agent, "primary");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_without_fallback_counts() {
        let agent = MockAgent::new("a").failing(connectivity("down")).into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(1)
            .invoke(&dyn_agent, AgentTask::new("task"), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RecoveryOutcome::Exhausted { .. }));
        assert_eq!(agent.calls(), 2);
        assert!(outcome.history().iter().all(|r| r.counted));
    }

    #[tokio::test]
    async fn test_validation_failure_retries_with_repair_directive() {
        let agent = MockAgent::new("writer")
            .then(Reply::Err(AgentError::Validation("missing title".into())))
            .replying("fixed")
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();

        let outcome = policy(0)
            .invoke(&dyn_agent, AgentTask::new("write the intro"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
        assert!(!outcome.history()[0].counted);

        let prompts = agent.prompts();
        assert_eq!(prompts[0], "write the intro");
        assert!(prompts[1].contains("missing title"));
        assert!(prompts[1].contains("write the intro"));
    }

    #[tokio::test]
    async fn test_validator_rejection_triggers_repair() {
        let agent = MockAgent::new("writer")
            .then(Reply::Ok(AgentOutput::text("no title")))
            .returning(AgentOutput::text("ok").with_data("title", json!("Intro")))
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let validator = |out: &AgentOutput| {
            if out.data.contains_key("title") {
                Ok(())
            } else {
                Err("title is required".to_string())
            }
        };

        let outcome = policy(0)
            .with_validator(Arc::new(validator))
            .invoke(&dyn_agent, AgentTask::new("draft"), &CancellationToken::new())
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.history()[0].kind, ErrorKind::ValidationFailure);
        assert!(agent.prompts()[1].contains("title is required"));
    }

    #[tokio::test]
    async fn test_failed_repairs_count() {
        let agent = MockAgent::new("writer")
            .failing(AgentError::Validation("still wrong".into()))
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(2)
            .invoke(&dyn_agent, AgentTask::new("draft"), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RecoveryOutcome::Exhausted { .. }));
        // One free repair plus three counted attempts.
        assert_eq!(agent.calls(), 4);
        let counted: Vec<bool> = outcome.history().iter().map(|r| r.counted).collect();
        assert_eq!(counted, vec![false, true, true, true]);
    }

    #[tokio::test]
    async fn test_other_failures_recorded_then_success() {
        let agent = MockAgent::new("a")
            .then(Reply::Err(AgentError::Other("first".into())))
            .then(Reply::Err(AgentError::Other("second".into())))
            .replying("third time lucky")
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(3)
            .invoke(&dyn_agent, AgentTask::new("t"), &CancellationToken::new())
            .await;
        let errors: Vec<&str> = outcome.history().iter().map(|r| r.error.as_str()).collect();
        assert_eq!(errors, vec!["first", "second"]);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_for_agent_resolves_configured_fallbacks() {
        let mut config = RecoveryConfig::default();
        config
            .fallbacks
            .insert("writer".into(), vec!["ghost".into(), "writer-lite".into()]);
        let mut registry = AgentRegistry::new();
        registry
            .register(MockAgent::new("writer").failing(connectivity("down")).into_arc())
            .unwrap();
        registry
            .register(MockAgent::new("writer-lite").replying("lite").into_arc())
            .unwrap();

        let policy = RecoveryPolicy::new(config).for_agent("writer", &registry, &[], None);
        let writer = registry.get("writer").unwrap();
        let outcome = policy
            .invoke(&writer, AgentTask::new("t"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.into_result("writer").unwrap().output, "lite");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let agent = MockAgent::new("a").replying("ok").into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = policy(3).invoke(&dyn_agent, AgentTask::new("t"), &cancel).await;
        assert!(matches!(outcome, RecoveryOutcome::Cancelled { .. }));
        assert_eq!(agent.calls(), 0);
        assert!(matches!(outcome.into_result("a"), Err(WeaveError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_wait() {
        let agent = MockAgent::new("a")
            .failing(AgentError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            })
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = policy(5).invoke(&dyn_agent, AgentTask::new("t"), &cancel).await;
        assert!(matches!(outcome, RecoveryOutcome::Cancelled { .. }));
        assert_eq!(agent.calls(), 1);

        let err = outcome.into_result("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let chain = err.cause_chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].starts_with("attempt 1 on 'a': rate limited"));
        assert_eq!(chain[1], "Workflow cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_connectivity_failure() {
        let agent = MockAgent::new("slow")
            .with_delay(Duration::from_secs(30))
            .replying("late")
            .into_arc();
        let dyn_agent: Arc<dyn Agent> = agent.clone();
        let outcome = policy(0)
            .with_attempt_timeout(Some(Duration::from_secs(1)))
            .invoke(&dyn_agent, AgentTask::new("t"), &CancellationToken::new())
            .await;
        match outcome {
            RecoveryOutcome::Exhausted { last, .. } => {
                assert_eq!(last.kind(), ErrorKind::ConnectivityFailure)
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
}
