//! Prerequisite-gated task buffer.

use tracing::debug;

use crate::message::{MemoryState, TaskMessage, TaskStatus};

/// Holds tasks whose condition names an unsatisfied prerequisite.
#[derive(Debug, Default)]
pub struct DeferredTaskHandler {
    deferred: Vec<TaskMessage>,
}

impl DeferredTaskHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a task. Insertion order is activation order.
    pub fn add_task(&mut self, mut task: TaskMessage) {
        task.status = TaskStatus::Deferred;
        self.deferred.push(task);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deferred.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Buffered tasks in insertion order.
    #[must_use]
    pub fn tasks(&self) -> &[TaskMessage] {
        &self.deferred
    }

    /// Remove and return every task whose prerequisite is satisfied by the
    /// memory state, flipped back to pending, in insertion order.
    pub fn activate_tasks(&mut self, state: &MemoryState) -> Vec<TaskMessage> {
        let mut activated = Vec::new();
        let mut remaining = Vec::with_capacity(self.deferred.len());

        for mut task in self.deferred.drain(..) {
            let satisfied = task
                .condition
                .as_ref()
                .is_some_and(|condition| state.satisfies(condition.prerequisite()));
            if satisfied {
                task.status = TaskStatus::Pending;
                task.status_updated_at = chrono::Utc::now();
                debug!(task_id = task.task_id, "deferred task activated");
                activated.push(task);
            } else {
                remaining.push(task);
            }
        }

        self.deferred = remaining;
        activated
    }
}
