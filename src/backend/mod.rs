//! Execution back-ends.
//!
//! Both back-ends implement the same contract: take a task descriptor,
//! return an [`ExecutionResult`]. Selection is per-task (descriptor
//! override) with the agent's configured mode as the default.

mod api;
mod process;

pub use api::ModelApiBackend;
pub use process::ProcessExecBackend;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::task::{ExecutionResult, TaskDescriptor};

/// An intermediate progress estimate for a running task.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub task_id: String,
    /// 0..=100.
    pub percent: u8,
}

/// A task execution strategy.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Execute the task to completion.
    ///
    /// Back-ends never return an error: failures are encoded in the result
    /// (`success = false` plus `error`). Progress updates are best-effort;
    /// a closed or full channel is ignored.
    async fn execute(
        &self,
        task: &TaskDescriptor,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> ExecutionResult;
}
