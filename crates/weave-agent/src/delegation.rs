use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weave_core::error::{Result, WeaveError};
use weave_core::traits::OutputValidator;
use weave_core::types::{AgentOutput, AgentTask, DelegationRequest, Provenance};

use crate::recovery::RecoveryPolicy;
use crate::registry::AgentRegistry;

/// Where a delegation originates.
#[derive(Clone)]
pub struct CallingContext {
    /// Agent that asked for the hand-off.
    pub origin: String,
    /// Task the origin was working on. Used when the request names no task.
    pub task: String,
    /// Context shared with the target, merged under the request's input.
    pub vars: Map<String, Value>,
    /// Hops already taken to reach the origin.
    pub depth: usize,
    pub cancel: CancellationToken,
}

impl CallingContext {
    pub fn new(origin: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            task: task.into(),
            vars: Map::new(),
            depth: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Final result of a delegation chain.
#[derive(Debug, Clone)]
pub struct Delegated {
    pub output: AgentOutput,
    /// One record per hop, in order.
    pub provenance: Vec<Provenance>,
}

/// Routes delegation requests to registered peers.
///
/// Chains are followed iteratively: when a target itself asks to delegate,
/// the next hop starts from that target one level deeper.
pub struct DelegationManager {
    registry: Arc<AgentRegistry>,
    max_depth: usize,
    recovery: RecoveryPolicy,
    validators: HashMap<String, Arc<dyn OutputValidator>>,
}

impl DelegationManager {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            max_depth: 10,
            recovery: RecoveryPolicy::default(),
            validators: HashMap::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Policy applied to every target invocation.
    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_validators(mut self, validators: HashMap<String, Arc<dyn OutputValidator>>) -> Self {
        self.validators = validators;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Hand `request` to its target and follow any further delegation.
    ///
    /// A missing target fails with `AgentNotFound`; a target failure is
    /// wrapped with the hop's origin, target and timestamp. Once at least one
    /// hop has completed, any failure also carries those hops.
    pub async fn delegate(
        &self,
        request: DelegationRequest,
        ctx: &CallingContext,
    ) -> Result<Delegated> {
        let mut provenance = Vec::new();
        match self.follow(request, ctx, &mut provenance).await {
            Ok(output) => Ok(Delegated { output, provenance }),
            Err(e) if provenance.is_empty() => Err(e),
            Err(e) => Err(WeaveError::DelegationChain {
                hops: provenance,
                source: Box::new(e),
            }),
        }
    }

    /// Walk the chain, recording each completed hop into `provenance`.
    async fn follow(
        &self,
        request: DelegationRequest,
        ctx: &CallingContext,
        provenance: &mut Vec<Provenance>,
    ) -> Result<AgentOutput> {
        let mut request = request;
        let mut origin = ctx.origin.clone();
        let mut task = ctx.task.clone();
        let mut vars = ctx.vars.clone();
        let mut depth = ctx.depth;

        loop {
            depth += 1;
            if depth > self.max_depth {
                warn!(
                    origin = %origin,
                    target = %request.target(),
                    depth,
                    max = self.max_depth,
                    "Delegation depth exceeded"
                );
                return Err(WeaveError::DelegationDepthExceeded {
                    depth,
                    max: self.max_depth,
                });
            }

            let target = request.target().to_string();
            let agent = self
                .registry
                .get(&target)
                .ok_or_else(|| WeaveError::AgentNotFound(target.clone()))?;

            let at = Utc::now();
            info!(origin = %origin, target = %target, depth, "Delegating");

            let mut input = vars;
            for (k, v) in request.input() {
                input.insert(k.clone(), v.clone());
            }
            let prompt = request.task().map(str::to_string).unwrap_or(task);
            let agent_task = AgentTask::new(prompt.clone()).with_context(input.clone());

            let policy = self.recovery.for_agent(
                &target,
                &self.registry,
                &[],
                self.validators.get(&target).cloned(),
            );
            let output = policy
                .invoke(&agent, agent_task, &ctx.cancel)
                .await
                .into_result(&target)
                .map_err(|e| match e {
                    WeaveError::Cancelled => WeaveError::Cancelled,
                    other => WeaveError::Delegation {
                        origin: origin.clone(),
                        target: target.clone(),
                        at,
                        source: Box::new(other),
                    },
                })?;
            provenance.push(Provenance {
                origin: origin.clone(),
                target: target.clone(),
                at,
                depth,
            });

            match output.delegation.clone() {
                Some(next) => {
                    origin = target;
                    task = prompt;
                    vars = input;
                    request = next;
                }
                None => return Ok(output),
            }
        }
    }
}
