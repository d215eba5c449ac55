use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WeaveError};

/// Top-level Weave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutionConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

/// Workflow driver limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Longest allowed delegation chain.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,
    /// Workflow-wide cap on concurrently running agent invocations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long an in-flight agent is awaited after cancellation before it is dropped.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Per-attempt agent timeout. Elapsed attempts count as connectivity failures.
    #[serde(default)]
    pub agent_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: default_max_delegation_depth(),
            max_concurrency: default_max_concurrency(),
            cancel_grace_ms: default_cancel_grace_ms(),
            timeout_secs: None,
            agent_timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent_timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_delegation_depth() -> usize { 10 }
fn default_max_concurrency() -> usize { 8 }
fn default_cancel_grace_ms() -> u64 { 500 }

/// Retry configuration for guarded agent invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Agent name -> fallback agent names, tried in order on connectivity failures.
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            fallbacks: HashMap::new(),
        }
    }
}

impl RecoveryConfig {
    /// Backoff before retry number `retry` (0-based): `initial * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 60_000 }

/// Context window budget for agent inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Slack kept free for the agent's response.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    /// Recency-first pruning when true, pair-preserving otherwise.
    #[serde(default = "default_prioritize_recent")]
    pub prioritize_recent: bool,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            reserve_tokens: default_reserve_tokens(),
            prioritize_recent: default_prioritize_recent(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_max_tokens() -> usize { 8000 }
fn default_reserve_tokens() -> usize { 1024 }
fn default_prioritize_recent() -> bool { true }
fn default_chars_per_token() -> usize { 4 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: EngineConfig =
            toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(WeaveError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.context.chars_per_token == 0 {
            return Err(WeaveError::Config(
                "context.chars_per_token must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.max_delegation_depth, 10);
        assert_eq!(config.recovery.max_retries, 3);
        assert!(config.context.prioritize_recent);
        assert!(config.engine.timeout().is_none());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.context.max_tokens, 8000);
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[recovery]
max_retries = 5

[recovery.fallbacks]
writer = ["writer-lite", "writer-local"]

[context]
prioritize_recent = false
"#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.recovery.initial_backoff_ms, 1000);
        assert_eq!(
            config.recovery.fallbacks.get("writer").map(|v| v.len()),
            Some(2)
        );
        assert!(!config.context.prioritize_recent);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RecoveryConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(1000));
        assert_eq!(config.backoff(1), Duration::from_millis(2000));
        assert_eq!(config.backoff(2), Duration::from_millis(4000));
        assert_eq!(config.backoff(3), Duration::from_millis(5000));
        assert_eq!(config.backoff(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = EngineConfig::from_toml_str("[engine]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, WeaveError::Config(_)));
    }

    #[test]
    fn test_expand_env_vars_missing_kept() {
        let out = expand_env_vars("key = \"${WEAVE_SURELY_UNSET_VAR}\"");
        assert_eq!(out, "key = \"${WEAVE_SURELY_UNSET_VAR}\"");
    }
}
