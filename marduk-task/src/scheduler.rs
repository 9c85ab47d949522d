//! Dispatcher capability and batch execution.
//!
//! The executor owns nothing: it pulls an admissible batch from the task
//! manager, hands each task to the dispatcher (the worker channel in
//! production), and writes statuses back.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use marduk_core::error::Result;

use crate::manager::{NextTaskOptions, TaskManager};
use crate::message::{TaskMessage, TaskStatus};
use crate::resource::ResourceMonitor;

/// Where tasks go to be executed.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Dispatch one task and return its result payload.
    async fn dispatch(&self, task: &TaskMessage) -> Result<Value>;
}

/// Outcome of one dispatched task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: u64,
    pub result: std::result::Result<Value, String>,
}

/// Batch executor over the task manager.
pub struct TaskExecutor {
    resources: Arc<ResourceMonitor>,
    batch_size: usize,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(resources: Arc<ResourceMonitor>, batch_size: usize) -> Self {
        Self {
            resources,
            batch_size: batch_size.max(1),
        }
    }

    /// Pull a batch, dispatch it, and record the outcomes.
    ///
    /// A dispatch failure marks the task failed and counts the attempt; the
    /// batch keeps going.
    pub async fn execute_batch(
        &self,
        manager: &mut TaskManager,
        dispatcher: &dyn TaskDispatcher,
    ) -> Vec<TaskResult> {
        let batch = manager.get_task_batch(self.batch_size, &NextTaskOptions::default());
        debug!(size = batch.len(), "executing task batch");

        let mut results = Vec::with_capacity(batch.len());
        for task in batch {
            let category = task.category_or_default();
            self.resources.task_started(category);
            manager.mark_attempt(task.task_id);

            let outcome = dispatcher.dispatch(&task).await;
            self.resources.task_finished(category);

            match outcome {
                Ok(value) => {
                    if let Err(err) = manager.update_task_status(task.task_id, TaskStatus::Completed)
                    {
                        warn!(task_id = task.task_id, %err, "failed to record completion");
                    }
                    results.push(TaskResult {
                        task_id: task.task_id,
                        result: Ok(value),
                    });
                }
                Err(err) => {
                    manager.record_failure(task.task_id);
                    if let Err(status_err) =
                        manager.update_task_status(task.task_id, TaskStatus::Failed)
                    {
                        warn!(task_id = task.task_id, %status_err, "failed to record failure");
                    }
                    warn!(task_id = task.task_id, %err, "task dispatch failed");
                    results.push(TaskResult {
                        task_id: task.task_id,
                        result: Err(err.to_string()),
                    });
                }
            }
        }
        results
    }
}
