//! Workflow engine: hierarchical composition of agent invocations.
//!
//! A workflow is a tree of [`WorkflowNode`]s. Leaves invoke one agent each;
//! sequential, parallel and loop nodes compose their children. Results are
//! accumulated in a [`WorkflowState`] keyed by node id, and templates on later
//! leaves can refer to earlier results by id.

pub mod condition;
pub mod engine;
pub mod handle;
pub mod node;
pub mod outcome;
pub mod state;

pub use condition::{evaluate_condition, Termination, TerminationFn};
pub use engine::{RunOptions, WorkflowEngine};
pub use handle::ExecutionHandle;
pub use node::WorkflowNode;
pub use outcome::{Aggregate, ExecutionResult, FailureReport, WorkflowOutcome};
pub use state::{LogEntry, WorkflowState};
