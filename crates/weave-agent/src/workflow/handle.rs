use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use weave_core::error::{Result, WeaveError};
use weave_core::types::ExecutionId;

use super::outcome::ExecutionResult;
use super::state::WorkflowState;

/// Handle to a submitted workflow execution.
pub struct ExecutionHandle {
    id: ExecutionId,
    cancel: CancellationToken,
    snapshots: watch::Receiver<WorkflowState>,
    task: JoinHandle<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        id: ExecutionId,
        cancel: CancellationToken,
        snapshots: watch::Receiver<WorkflowState>,
        task: JoinHandle<ExecutionResult>,
    ) -> Self {
        Self {
            id,
            cancel,
            snapshots,
            task,
        }
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// Request cooperative cancellation. Agents already running get a grace
    /// period; nothing new starts.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(execution_id = %self.id, "Cancellation requested");
            self.cancel.cancel();
        }
    }

    /// Latest published state snapshot.
    pub fn inspect(&self) -> WorkflowState {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next published snapshot. Returns `None` once the execution
    /// has finished and no further snapshots will arrive.
    pub async fn changed(&mut self) -> Option<WorkflowState> {
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow_and_update().clone())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the execution to finish.
    pub async fn wait(self) -> Result<ExecutionResult> {
        self.task
            .await
            .map_err(|e| WeaveError::Internal(e.to_string()))
    }
}
