//! Task messages, insights, and the memory state used for deferred
//! activation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::TaskCategory;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
    Deferred,
    Failed,
}

/// A gate on task activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskCondition {
    /// Blocked until the prerequisite label appears in the memory state.
    Deferred { prerequisite: String },
}

impl TaskCondition {
    #[must_use]
    pub fn prerequisite(&self) -> &str {
        match self {
            TaskCondition::Deferred { prerequisite } => prerequisite,
        }
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Stays snake_case on the wire, matching the worker protocol.
    #[serde(rename = "task_id")]
    pub task_id: u64,
    /// Always `"task"` on the wire.
    #[serde(rename = "type")]
    pub message_type: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Priority in `[0, 10]`; recomputed by the manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    /// Urgency in `[0, 10]` supplied by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TaskCategory>,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<TaskCondition>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<u64>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependents: BTreeSet<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inherited_priority_boost: f64,
    #[serde(default)]
    pub is_system_critical: bool,
    #[serde(default)]
    pub has_relevant_context: bool,
    /// Fraction of a resource unit this task consumes, `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_cost: Option<f64>,
    /// e.g. `HIGH+2`; parsed by the priority model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_priority_expression: Option<String>,
}

impl TaskMessage {
    #[must_use]
    pub fn new(task_id: u64, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            message_type: "task".to_string(),
            query: query.into(),
            target: None,
            priority: None,
            urgency: None,
            category: None,
            status: TaskStatus::Pending,
            created_at: now,
            status_updated_at: now,
            condition: None,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            retry_count: 0,
            last_execution_attempt: None,
            inherited_priority_boost: 0.0,
            is_system_critical: false,
            has_relevant_context: false,
            resource_cost: None,
            user_priority_expression: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority.clamp(0.0, 10.0));
        self
    }

    #[must_use]
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = Some(urgency.clamp(0.0, 10.0));
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = u64>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: TaskCondition) -> Self {
        self.status = TaskStatus::Deferred;
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn critical(mut self) -> Self {
        self.is_system_critical = true;
        self
    }

    /// Category with the default applied.
    #[must_use]
    pub fn category_or_default(&self) -> TaskCategory {
        self.category.unwrap_or(TaskCategory::Default)
    }

    /// Whether this task is gated on a prerequisite.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.condition.is_some()
    }
}

/// A distilled observation feeding goal generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Insight {
    Error {
        error: String,
        error_code: String,
        context: String,
        #[serde(default)]
        requires_research: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    Success {
        task: String,
        unlocked_paths: Vec<String>,
    },
    Reflection {
        content: String,
    },
}

/// What the agent knows to be finished; consulted by deferred activation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryState {
    pub completed_topics: BTreeSet<String>,
}

impl MemoryState {
    #[must_use]
    pub fn with_topics(topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            completed_topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn satisfies(&self, prerequisite: &str) -> bool {
        self.completed_topics.contains(prerequisite)
    }
}
