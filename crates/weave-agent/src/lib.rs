pub mod chunker;
pub mod context;
pub mod delegation;
pub mod recovery;
pub mod registry;
pub mod summarizer;
pub mod template;
pub mod tokens;
pub mod workflow;

pub use chunker::Chunks;
pub use context::{ContextEntry, ContextWindow, ContextWindowManager};
pub use delegation::{CallingContext, Delegated, DelegationManager};
pub use recovery::{AttemptPlan, RecoveryOutcome, RecoveryPolicy, RepairDirective};
pub use registry::AgentRegistry;
pub use summarizer::{LeadSentenceSummarizer, Summarizer};
pub use template::PlaceholderRenderer;
pub use tokens::{BpeEstimator, CharEstimator, TokenEstimator};
pub use workflow::{
    Aggregate, ExecutionHandle, ExecutionResult, FailureReport, RunOptions, Termination,
    WorkflowEngine, WorkflowNode, WorkflowOutcome, WorkflowState,
};
