//! The deliberation cycle: self-notes in, dispatched batches out.
//!
//! One cycle loads the previous notes, derives insights, turns them into
//! task messages, routes conditioned tasks through the deferred handler,
//! activates whatever the memory state satisfies, prioritizes, dispatches a
//! batch, and writes fresh notes for the next cycle.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info, warn};

use marduk_core::error::{Error, Result};

use crate::category::TaskCategory;
use crate::deferred::DeferredTaskHandler;
use crate::manager::{PrioritizeOptions, TaskManager};
use crate::message::{Insight, MemoryState, TaskCondition, TaskMessage};
use crate::scheduler::{TaskDispatcher, TaskExecutor, TaskResult};

/// Cycle settings.
#[derive(Debug, Clone)]
pub struct DeliberationConfig {
    /// JSON file holding the previous cycle's self-notes.
    pub notes_path: PathBuf,
    /// Tasks dispatched per cycle.
    pub batch_size: usize,
}

impl DeliberationConfig {
    #[must_use]
    pub fn new(notes_path: impl Into<PathBuf>) -> Self {
        Self {
            notes_path: notes_path.into(),
            batch_size: 5,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub insights: usize,
    pub generated: usize,
    pub deferred: usize,
    pub activated: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Driver of the deliberation loop.
pub struct DeliberationCycle {
    config: DeliberationConfig,
}

impl DeliberationCycle {
    #[must_use]
    pub fn new(config: DeliberationConfig) -> Self {
        Self { config }
    }

    /// Load prior self-notes; an absent file means an empty list.
    pub async fn load_notes(&self) -> Vec<String> {
        match fs::read(&self.config.notes_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(%err, "self-notes file unreadable, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// Persist notes for the next cycle.
    pub async fn save_notes(&self, notes: &[String]) -> Result<()> {
        if let Some(parent) = self.config.notes_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Persistence(format!("create {}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(notes)?;
        fs::write(&self.config.notes_path, bytes)
            .await
            .map_err(|e| Error::Persistence(format!("write self-notes: {e}")))?;
        Ok(())
    }

    /// Derive base insights: the two canonical seeds plus one reflection per
    /// note.
    #[must_use]
    pub fn derive_insights(&self, notes: &[String]) -> Vec<Insight> {
        let mut insights = vec![
            Insight::Error {
                error: "task pipeline reported an unhandled failure".to_string(),
                error_code: "TASK_EXECUTION".to_string(),
                context: "scheduler".to_string(),
                requires_research: true,
                field: None,
                topic: Some("error-recovery".to_string()),
            },
            Insight::Success {
                task: "previous deliberation batch".to_string(),
                unlocked_paths: vec!["review-completed-goals".to_string()],
            },
        ];
        insights.extend(notes.iter().map(|note| Insight::Reflection {
            content: note.clone(),
        }));
        insights
    }

    /// Turn insights into task messages, allocating ids from the manager.
    pub fn generate_tasks(
        &self,
        manager: &mut TaskManager,
        insights: &[Insight],
    ) -> Vec<TaskMessage> {
        let mut tasks = Vec::new();
        for insight in insights {
            match insight {
                Insight::Error {
                    error,
                    error_code,
                    requires_research,
                    topic,
                    ..
                } => {
                    let id = manager.allocate_task_id();
                    tasks.push(
                        TaskMessage::new(id, format!("Investigate error: {error} ({error_code})"))
                            .with_urgency(8.0)
                            .with_category(TaskCategory::System),
                    );
                    if *requires_research {
                        if let Some(topic) = topic {
                            let id = manager.allocate_task_id();
                            tasks.push(
                                TaskMessage::new(id, format!("Study {topic}"))
                                    .with_category(TaskCategory::Ai)
                                    .with_condition(TaskCondition::Deferred {
                                        prerequisite: format!("research-completed:{topic}"),
                                    }),
                            );
                        }
                    }
                }
                Insight::Success { unlocked_paths, .. } => {
                    for path in unlocked_paths {
                        let id = manager.allocate_task_id();
                        tasks.push(
                            TaskMessage::new(id, format!("Follow up on {path}"))
                                .with_category(TaskCategory::Default),
                        );
                    }
                }
                Insight::Reflection { content } => {
                    debug!(%content, "carrying reflection forward");
                }
            }
        }
        tasks
    }

    /// Run one full cycle.
    pub async fn run_cycle(
        &self,
        manager: &mut TaskManager,
        deferred: &mut DeferredTaskHandler,
        executor: &TaskExecutor,
        dispatcher: &dyn TaskDispatcher,
        memory_state: &MemoryState,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let notes = self.load_notes().await;
        let insights = self.derive_insights(&notes);
        report.insights = insights.len();

        let tasks = self.generate_tasks(manager, &insights);
        report.generated = tasks.len();
        for task in tasks {
            if task.is_deferred() {
                report.deferred += 1;
                deferred.add_task(task);
            } else {
                manager.add_task(task)?;
            }
        }

        let activated = deferred.activate_tasks(memory_state);
        report.activated = activated.len();
        for task in activated {
            manager.add_task(task)?;
        }

        let _ = manager.prioritize_tasks(PrioritizeOptions::default());
        let results = executor.execute_batch(manager, dispatcher).await;
        report.dispatched = results.len();
        report.completed = results.iter().filter(|r| r.result.is_ok()).count();
        report.failed = results.len() - report.completed;

        let notes = Self::summarize(&results);
        self.save_notes(&notes).await?;

        info!(
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            "deliberation cycle finished"
        );
        Ok(report)
    }

    fn summarize(results: &[TaskResult]) -> Vec<String> {
        results
            .iter()
            .map(|r| match &r.result {
                Ok(_) => format!("task {} completed", r.task_id),
                Err(err) => format!("task {} failed: {err}", r.task_id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceMonitor;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct EchoDispatcher;

    #[async_trait]
    impl TaskDispatcher for EchoDispatcher {
        async fn dispatch(&self, task: &TaskMessage) -> marduk_core::Result<serde_json::Value> {
            Ok(serde_json::json!({ "echo": task.query }))
        }
    }

    fn cycle(dir: &TempDir) -> DeliberationCycle {
        DeliberationCycle::new(DeliberationConfig::new(dir.path().join("notes.json")))
    }

    #[tokio::test]
    async fn test_missing_notes_are_empty() {
        let dir = TempDir::new().unwrap();
        assert!(cycle(&dir).load_notes().await.is_empty());
    }

    #[tokio::test]
    async fn test_notes_round_trip() {
        let dir = TempDir::new().unwrap();
        let cycle = cycle(&dir);
        cycle
            .save_notes(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(cycle.load_notes().await.len(), 2);
    }

    #[test]
    fn test_insight_derivation_shape() {
        let dir = TempDir::new().unwrap();
        let cycle = cycle(&dir);
        let insights = cycle.derive_insights(&["remember this".to_string()]);

        assert_eq!(insights.len(), 3);
        assert!(matches!(insights[0], Insight::Error { .. }));
        assert!(matches!(insights[1], Insight::Success { .. }));
        assert!(matches!(insights[2], Insight::Reflection { .. }));
    }

    #[test]
    fn test_error_insight_spawns_deferred_study_task() {
        let dir = TempDir::new().unwrap();
        let cycle = cycle(&dir);
        let mut manager = TaskManager::new(Arc::new(ResourceMonitor::new()));

        let insights = vec![Insight::Error {
            error: "parse failure".to_string(),
            error_code: "E_PARSE".to_string(),
            context: "loader".to_string(),
            requires_research: true,
            field: None,
            topic: Some("grammar".to_string()),
        }];
        let tasks = cycle.generate_tasks(&mut manager, &insights);

        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].query.contains("Investigate error"));
        assert!(tasks[1].is_deferred());
        assert_eq!(
            tasks[1].condition.as_ref().unwrap().prerequisite(),
            "research-completed:grammar"
        );
    }

    #[test]
    fn test_success_insight_spawns_one_task_per_path() {
        let dir = TempDir::new().unwrap();
        let cycle = cycle(&dir);
        let mut manager = TaskManager::new(Arc::new(ResourceMonitor::new()));

        let insights = vec![Insight::Success {
            task: "done".to_string(),
            unlocked_paths: vec!["path-a".to_string(), "path-b".to_string()],
        }];
        let tasks = cycle.generate_tasks(&mut manager, &insights);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.query.starts_with("Follow up on")));
    }

    #[tokio::test]
    async fn test_full_cycle_dispatches_and_saves_notes() {
        let dir = TempDir::new().unwrap();
        let cycle = cycle(&dir);
        let resources = Arc::new(ResourceMonitor::new());
        let mut manager = TaskManager::new(Arc::clone(&resources));
        let mut deferred = DeferredTaskHandler::new();
        let executor = TaskExecutor::new(resources, 5);

        // The study task's prerequisite is already satisfied, so it
        // activates in the same cycle.
        let state = MemoryState::with_topics(["research-completed:error-recovery"]);
        let report = cycle
            .run_cycle(&mut manager, &mut deferred, &executor, &EchoDispatcher, &state)
            .await
            .unwrap();

        assert_eq!(report.insights, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.activated, 1);
        assert!(report.dispatched > 0);
        assert_eq!(report.failed, 0);
        assert!(deferred.is_empty());

        let notes = cycle.load_notes().await;
        assert_eq!(notes.len(), report.dispatched);
    }
}
