use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weave_core::types::{Message, NodeStatus, Provenance};

/// One executed node in the workflow log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub node_id: String,
    pub status: NodeStatus,
    /// Enclosing loop iteration (1-based), if any.
    #[serde(default)]
    pub iteration: Option<usize>,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegations: Vec<Provenance>,
}

/// Accumulated state of one workflow execution.
///
/// Owned by the driver while the workflow runs; callers observe clones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    results: Map<String, Value>,
    log: Vec<LogEntry>,
    terminal: BTreeSet<String>,
    transcript: Vec<Message>,
    terminated: bool,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest result of a node.
    pub fn result(&self, node_id: &str) -> Option<&Value> {
        self.results.get(node_id)
    }

    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    pub fn set_result(&mut self, node_id: impl Into<String>, value: Value) {
        self.results.insert(node_id.into(), value);
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Log entries for one node, oldest first.
    pub fn entries_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.log.iter().filter(move |e| e.node_id == node_id)
    }

    /// Append a log entry and mark the node terminal.
    pub fn record(&mut self, entry: LogEntry) {
        self.terminal.insert(entry.node_id.clone());
        self.log.push(entry);
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.terminal.contains(node_id)
    }

    /// Clear terminal marks so the nodes may run again in a new iteration.
    pub fn reopen<'a>(&mut self, node_ids: impl IntoIterator<Item = &'a String>) {
        for id in node_ids {
            self.terminal.remove(id);
        }
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn push_transcript(&mut self, message: Message) {
        self.transcript.push(message);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
    }

    pub(crate) fn mark(&self) -> BranchMark {
        BranchMark {
            log_len: self.log.len(),
            transcript_len: self.transcript.len(),
        }
    }

    /// Fold a parallel branch back in. Only results for `owned` ids are taken;
    /// log and transcript entries added after `mark` are appended.
    pub(crate) fn merge_branch(&mut self, branch: WorkflowState, owned: &[String], mark: BranchMark) {
        let WorkflowState {
            mut results,
            log,
            terminal,
            transcript,
            ..
        } = branch;
        for id in owned {
            if let Some(value) = results.remove(id) {
                self.results.insert(id.clone(), value);
            }
            if terminal.contains(id) {
                self.terminal.insert(id.clone());
            }
        }
        self.log.extend(log.into_iter().skip(mark.log_len));
        self.transcript
            .extend(transcript.into_iter().skip(mark.transcript_len));
    }
}

/// Lengths of the append-only parts of a state at fan-out time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BranchMark {
    log_len: usize,
    transcript_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, status: NodeStatus) -> LogEntry {
        LogEntry {
            node_id: id.into(),
            status,
            iteration: None,
            at: Utc::now(),
            delegations: Vec::new(),
        }
    }

    #[test]
    fn test_record_marks_terminal_and_reopen_clears() {
        let mut state = WorkflowState::new();
        state.record(entry("a", NodeStatus::Completed));
        assert!(state.is_terminal("a"));
        state.reopen(&["a".to_string()]);
        assert!(!state.is_terminal("a"));
        assert_eq!(state.log().len(), 1);
    }

    #[test]
    fn test_merge_branch_takes_owned_keys_only() {
        let mut state = WorkflowState::new();
        state.set_result("before", json!("x"));
        state.push_transcript(Message::user("shared"));
        let mark = state.mark();

        let mut branch = state.clone();
        branch.set_result("child", json!("y"));
        branch.set_result("before", json!("overwritten"));
        branch.record(entry("child", NodeStatus::Completed));
        branch.push_transcript(Message::assistant("branch reply"));

        state.merge_branch(branch, &["child".to_string()], mark);
        assert_eq!(state.result("before"), Some(&json!("x")));
        assert_eq!(state.result("child"), Some(&json!("y")));
        assert!(state.is_terminal("child"));
        assert_eq!(state.log().len(), 1);
        assert_eq!(state.transcript().len(), 2);
    }

    #[test]
    fn test_serializes_for_checkpointing() {
        let mut state = WorkflowState::new();
        state.set_result("a", json!({"output": "done"}));
        state.record(entry("a", NodeStatus::Completed));
        let raw = serde_json::to_string(&state).unwrap();
        let restored: WorkflowState = serde_json::from_str(&raw).unwrap();
        assert!(restored.is_terminal("a"));
        assert_eq!(restored.entries_for("a").count(), 1);
    }
}
