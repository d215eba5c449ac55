use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Provenance;

/// Coarse classification used for recovery decisions and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    ConnectivityFailure,
    ValidationFailure,
    AgentNotFound,
    DuplicateRegistration,
    DelegationDepthExceeded,
    LoopExhausted,
    Cancelled,
    /// Malformed agent, workflow, template or config.
    Invalid,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ConnectivityFailure => "connectivity_failure",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::DuplicateRegistration => "duplicate_registration",
            ErrorKind::DelegationDepthExceeded => "delegation_depth_exceeded",
            ErrorKind::LoopExhausted => "loop_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Typed failure returned by an agent's `run`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("output validation failed: {0}")]
    Validation(String),

    #[error("agent cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::RateLimited { .. } => ErrorKind::RateLimited,
            AgentError::Connectivity(_) => ErrorKind::ConnectivityFailure,
            AgentError::Validation(_) => ErrorKind::ValidationFailure,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Other(_) => ErrorKind::Unknown,
        }
    }
}

/// One failed attempt of a guarded agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Agent that served the attempt (primary or fallback).
    pub agent: String,
    pub kind: ErrorKind,
    pub error: String,
    /// Whether this failure consumed one of the retries.
    pub counted: bool,
}

#[derive(Debug, Clone, Error)]
pub enum WeaveError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    // Registry errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    // Delegation errors
    #[error("Delegation depth exceeded: hop {depth} over limit {max}")]
    DelegationDepthExceeded { depth: usize, max: usize },

    #[error("Delegation {origin} -> {target} failed: {source}")]
    Delegation {
        origin: String,
        target: String,
        at: DateTime<Utc>,
        source: Box<WeaveError>,
    },

    /// A delegation chain broke after completing `hops`.
    #[error("Delegation chain failed after {} hops: {source}", .hops.len())]
    DelegationChain {
        hops: Vec<Provenance>,
        source: Box<WeaveError>,
    },

    // Execution errors
    #[error("Agent '{agent}' failed after {} attempts: {last}", .attempts.len())]
    AgentExecution {
        agent: String,
        attempts: Vec<AttemptRecord>,
        last: AgentError,
    },

    #[error("Loop '{node}' exhausted after {iterations} iterations")]
    LoopExhausted { node: String, iterations: usize },

    #[error("Workflow cancelled")]
    Cancelled,

    /// Cancelled while recovering from earlier failed attempts.
    #[error("Agent '{agent}' cancelled after {} failed attempts", .attempts.len())]
    Interrupted {
        agent: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Execution task failed: {0}")]
    Internal(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),
}

impl WeaveError {
    /// Classify this error, looking through delegation wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeaveError::Agent(e) => e.kind(),
            WeaveError::AgentNotFound(_) => ErrorKind::AgentNotFound,
            WeaveError::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            WeaveError::DelegationDepthExceeded { .. } => ErrorKind::DelegationDepthExceeded,
            WeaveError::Delegation { source, .. } | WeaveError::DelegationChain { source, .. } => {
                source.kind()
            }
            WeaveError::AgentExecution { last, .. } => last.kind(),
            WeaveError::LoopExhausted { .. } => ErrorKind::LoopExhausted,
            WeaveError::Cancelled | WeaveError::Interrupted { .. } => ErrorKind::Cancelled,
            WeaveError::Internal(_) => ErrorKind::Unknown,
            WeaveError::InvalidAgent(_)
            | WeaveError::InvalidWorkflow(_)
            | WeaveError::Template(_)
            | WeaveError::Config(_)
            | WeaveError::ConfigNotFound(_) => ErrorKind::Invalid,
        }
    }

    /// Delegation hops completed before this error, if any.
    pub fn provenance(&self) -> &[Provenance] {
        match self {
            WeaveError::DelegationChain { hops, .. } => hops,
            _ => &[],
        }
    }

    /// Every underlying cause, outermost first.
    ///
    /// Exhausted or interrupted retries contribute one entry per attempt.
    pub fn cause_chain(&self) -> Vec<String> {
        match self {
            WeaveError::Delegation {
                origin,
                target,
                at,
                source,
            } => {
                let mut chain = vec![format!(
                    "delegation {} -> {} at {}",
                    origin,
                    target,
                    at.to_rfc3339()
                )];
                chain.extend(source.cause_chain());
                chain
            }
            WeaveError::DelegationChain { hops, source } => {
                let mut chain: Vec<String> = hops
                    .iter()
                    .map(|hop| {
                        format!(
                            "hop {}: {} -> {} at {}",
                            hop.depth,
                            hop.origin,
                            hop.target,
                            hop.at.to_rfc3339()
                        )
                    })
                    .collect();
                chain.extend(source.cause_chain());
                chain
            }
            WeaveError::AgentExecution { attempts, .. } => attempts.iter().map(describe).collect(),
            WeaveError::Interrupted { attempts, .. } => {
                let mut chain: Vec<String> = attempts.iter().map(describe).collect();
                chain.push(WeaveError::Cancelled.to_string());
                chain
            }
            other => vec![other.to_string()],
        }
    }
}

fn describe(attempt: &AttemptRecord) -> String {
    format!(
        "attempt {} on '{}': {}",
        attempt.attempt, attempt.agent, attempt.error
    )
}

pub type Result<T> = std::result::Result<T, WeaveError>;
