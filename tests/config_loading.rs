use std::io::Write;

use weave_agent::WorkflowNode;
use weave_core::config::EngineConfig;
use weave_core::error::WeaveError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_delegation_depth = 4
max_concurrency = 2
cancel_grace_ms = 250
timeout_secs = 600
agent_timeout_secs = 30

[recovery]
max_retries = 5
initial_backoff_ms = 200
max_backoff_ms = 10000

[recovery.fallbacks]
writer = ["writer-lite", "writer-local"]

[context]
max_tokens = 4000
reserve_tokens = 500
prioritize_recent = false
chars_per_token = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_delegation_depth, 4);
    assert_eq!(config.engine.max_concurrency, 2);
    assert_eq!(config.engine.cancel_grace().as_millis(), 250);
    assert_eq!(config.engine.timeout().map(|d| d.as_secs()), Some(600));
    assert_eq!(config.engine.agent_timeout().map(|d| d.as_secs()), Some(30));
    assert_eq!(config.recovery.max_retries, 5);
    assert_eq!(config.recovery.backoff(1).as_millis(), 400);
    assert_eq!(
        config.recovery.fallbacks.get("writer"),
        Some(&vec!["writer-lite".to_string(), "writer-local".to_string()])
    );
    assert_eq!(config.context.max_tokens, 4000);
    assert_eq!(config.context.reserve_tokens, 500);
    assert!(!config.context.prioritize_recent);
    assert_eq!(config.context.chars_per_token, 3);
}

#[test]
fn test_load_config_expands_env_vars() {
    std::env::set_var("WEAVE_TEST_MAX_RETRIES", "7");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[recovery]\nmax_retries = ${WEAVE_TEST_MAX_RETRIES}\n")
        .expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.recovery.max_retries, 7);
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = EngineConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WeaveError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_concurrency = ").expect("write toml");
    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeaveError::Config(_)));
}

#[test]
fn test_workflow_definition_in_toml() {
    let toml_content = r#"
type = "sequential"
id = "article"

[[children]]
type = "leaf"
id = "draft"
agent = "writer"
input_template = "Write about {{topic}}"
fallbacks = ["writer-lite"]

[[children]]
type = "loop"
id = "polish"
max_iterations = 3

[children.until]
type = "expr"
expr = 'output contains "LGTM"'

[children.child]
type = "leaf"
id = "review"
agent = "reviewer"
input_template = "Review: {{previous}}"
"#;

    let workflow: WorkflowNode = toml::from_str(toml_content).expect("parse workflow");
    workflow.validate().expect("valid workflow");
    assert_eq!(workflow.id(), "article");
    assert_eq!(workflow.node_count(), 4);
    let agents: Vec<String> = workflow.agent_names().into_iter().collect();
    assert_eq!(agents, vec!["reviewer", "writer", "writer-lite"]);
}
