//! The task graph: priority maintenance, dependency inheritance, and
//! scheduling queries.
//!
//! Tasks are arena-stored in a `BTreeMap` keyed by integer id with
//! adjacency sets (`dependencies`, `dependents`) instead of owning
//! references, so cycles cannot create ownership loops. All passes are
//! synchronous and deterministic; ties always break on ascending id.
//!
//! Every prioritization pass recomputes from the producer-assigned base
//! priority snapshot taken at `add_task`, never from the previous computed
//! total, so repeated passes over an unchanged task set are stable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use marduk_core::error::{Error, Result};

use crate::category::TaskCategory;
use crate::message::{TaskMessage, TaskStatus};
use crate::priority::{
    aging_bonus, compute_priority, decay_multiplier, LoadContext, PriorityWeights,
};
use crate::resource::ResourceMonitor;

/// Switches for one prioritization pass.
#[derive(Debug, Clone, Copy)]
pub struct PrioritizeOptions {
    pub apply_aging: bool,
    pub apply_inheritance: bool,
    pub apply_decay: bool,
    pub include_context: bool,
}

impl Default for PrioritizeOptions {
    fn default() -> Self {
        Self {
            apply_aging: true,
            apply_inheritance: true,
            apply_decay: true,
            include_context: true,
        }
    }
}

/// Filters for `get_next_task` / `get_task_batch`.
#[derive(Debug, Clone)]
pub struct NextTaskOptions {
    pub exclude_ids: BTreeSet<u64>,
    /// Minimum category resource availability.
    pub resource_threshold: f64,
    /// Minimum computed priority.
    pub priority_threshold: f64,
    pub include_deferred: bool,
}

impl Default for NextTaskOptions {
    fn default() -> Self {
        Self {
            exclude_ids: BTreeSet::new(),
            resource_threshold: 0.3,
            priority_threshold: 0.0,
            include_deferred: false,
        }
    }
}

/// Owner of every task after `add_task`.
pub struct TaskManager {
    tasks: BTreeMap<u64, TaskMessage>,
    /// Producer-assigned priority per task, frozen at `add_task`. The base
    /// input of every recompute; the computed total never feeds back in.
    base_priorities: HashMap<u64, Option<f64>>,
    weights: PriorityWeights,
    resources: Arc<ResourceMonitor>,
    next_id: u64,
}

impl TaskManager {
    #[must_use]
    pub fn new(resources: Arc<ResourceMonitor>) -> Self {
        Self::with_weights(resources, PriorityWeights::default())
    }

    #[must_use]
    pub fn with_weights(resources: Arc<ResourceMonitor>, weights: PriorityWeights) -> Self {
        Self {
            tasks: BTreeMap::new(),
            base_priorities: HashMap::new(),
            weights,
            resources,
            next_id: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Allocate the next unused task id.
    pub fn allocate_task_id(&mut self) -> u64 {
        let floor = self.tasks.keys().next_back().copied().unwrap_or(0);
        self.next_id = self.next_id.max(floor) + 1;
        self.next_id
    }

    #[must_use]
    pub fn get_task(&self, id: u64) -> Option<&TaskMessage> {
        self.tasks.get(&id)
    }

    /// All tasks in id order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskMessage> {
        self.tasks.values().cloned().collect()
    }

    /// Register a task and wire the dependency adjacency both ways.
    pub fn add_task(&mut self, task: TaskMessage) -> Result<()> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(Error::Validation(format!(
                "task {} is already registered",
                task.task_id
            )));
        }

        let id = task.task_id;
        let mut task = task;
        // Late-arriving dependency targets: anyone already pointing at us.
        for (other_id, other) in &self.tasks {
            if other.dependencies.contains(&id) {
                task.dependents.insert(*other_id);
            }
        }
        for dep in task.dependencies.clone() {
            if let Some(dep_task) = self.tasks.get_mut(&dep) {
                dep_task.dependents.insert(id);
            }
        }
        self.base_priorities.insert(id, task.priority);
        self.tasks.insert(id, task);
        Ok(())
    }

    fn base_priority(&self, id: u64) -> Option<f64> {
        self.base_priorities.get(&id).copied().flatten()
    }

    /// Drive the status machine.
    ///
    /// `pending → {completed, deferred, failed}`, `deferred → pending`,
    /// `failed → pending`. Completion notifies dependents: a deferred
    /// dependent whose dependencies are all complete flips to pending.
    pub fn update_task_status(&mut self, id: u64, status: TaskStatus) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(Error::Validation(format!("unknown task {id}")));
        };

        let allowed = matches!(
            (task.status, status),
            (TaskStatus::Pending, TaskStatus::Completed)
                | (TaskStatus::Pending, TaskStatus::Deferred)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Deferred, TaskStatus::Pending)
                | (TaskStatus::Failed, TaskStatus::Pending)
        ) || task.status == status;
        if !allowed {
            return Err(Error::Validation(format!(
                "invalid status transition {:?} -> {status:?} for task {id}",
                task.status
            )));
        }

        task.status = status;
        task.status_updated_at = Utc::now();
        let dependents: Vec<u64> = task.dependents.iter().copied().collect();

        if status == TaskStatus::Completed {
            for dependent_id in dependents {
                self.unblock_if_ready(dependent_id);
            }
        }
        Ok(())
    }

    /// Flip a failed task back to pending for another attempt.
    pub fn retry_task(&mut self, id: u64, reset_retry_count: bool) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(Error::Validation(format!("unknown task {id}")));
        };
        if task.status != TaskStatus::Failed {
            return Err(Error::Validation(format!(
                "task {id} is not failed, cannot retry"
            )));
        }
        task.status = TaskStatus::Pending;
        task.status_updated_at = Utc::now();
        if reset_retry_count {
            task.retry_count = 0;
        }
        Ok(())
    }

    /// Stamp an execution attempt.
    pub fn mark_attempt(&mut self, id: u64) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.last_execution_attempt = Some(Utc::now());
        }
    }

    /// Count a failed attempt.
    pub fn record_failure(&mut self, id: u64) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.retry_count = task.retry_count.saturating_add(1);
        }
    }

    fn unblock_if_ready(&mut self, id: u64) {
        let ready = {
            let Some(task) = self.tasks.get(&id) else {
                return;
            };
            task.status == TaskStatus::Deferred
                && task.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_none_or(|d| d.status == TaskStatus::Completed)
                })
        };
        if ready {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Pending;
                task.status_updated_at = Utc::now();
                debug!(task_id = id, "dependencies satisfied, task unblocked");
            }
        }
    }

    /// Recompute every priority and return a stable descending-priority
    /// sort (ties ascend by id).
    ///
    /// The recompute is pure: base comes from the `add_task` snapshot and
    /// aging/decay are functions of task age, so calling this repeatedly on
    /// an unchanged task set yields the same priorities.
    pub fn prioritize_tasks(&mut self, options: PrioritizeOptions) -> Vec<TaskMessage> {
        if options.apply_inheritance {
            self.apply_priority_inheritance();
        }

        let now = Utc::now();
        let system_load = self.resources.system_load();
        let ids: Vec<u64> = self.tasks.keys().copied().collect();
        for id in ids {
            let task = &self.tasks[&id];
            let load = LoadContext {
                system_load,
                category_load: self.resources.category_load(task.category_or_default()),
            };
            let mut priority = compute_priority(
                task,
                self.base_priority(id),
                &self.weights,
                load,
                options.include_context,
                now,
            );
            if options.apply_aging {
                priority = (priority + aging_bonus(task, now)).min(10.0);
            }
            if options.apply_decay {
                let multiplier = decay_multiplier(task, &self.weights, now);
                if multiplier < 1.0 {
                    priority = (priority * multiplier).max(1.0);
                }
            }
            if let Some(task) = self.tasks.get_mut(&id) {
                task.priority = Some(priority);
            }
        }

        let mut sorted = self.tasks();
        sorted.sort_by(|a, b| {
            b.priority
                .unwrap_or(0.0)
                .partial_cmp(&a.priority.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.task_id.cmp(&b.task_id))
        });
        sorted
    }

    /// Two-pass inheritance: direct dependency boosts plus 60 % transitive
    /// propagation along the dependents adjacency. Criticality propagates
    /// from dependencies to dependents until a fixpoint.
    ///
    /// Gaps are measured between base-priority snapshots so boosts stay
    /// stable across repeated passes.
    pub fn apply_priority_inheritance(&mut self) {
        let effective: HashMap<u64, f64> = self
            .tasks
            .keys()
            .map(|id| {
                (
                    *id,
                    self.base_priority(*id).unwrap_or(self.weights.base_factor),
                )
            })
            .collect();

        // Pass 1: boost each task by the gap to its strongest dependency.
        let ids: Vec<u64> = self.tasks.keys().copied().collect();
        for id in &ids {
            let task = &self.tasks[id];
            let own = effective[id];
            let max_dep = task
                .dependencies
                .iter()
                .filter_map(|dep| effective.get(dep))
                .fold(f64::NEG_INFINITY, |acc, p| acc.max(*p));

            let boost = if max_dep.is_finite() && max_dep > own {
                (max_dep - own) * self.weights.dependency_factor
            } else {
                0.0
            };
            if let Some(task) = self.tasks.get_mut(id) {
                task.inherited_priority_boost = boost;
            }
        }

        // Pass 2: dependents of a boosted task receive 60 % of its boost.
        for id in &ids {
            let (boost, dependents) = {
                let task = &self.tasks[id];
                (
                    task.inherited_priority_boost,
                    task.dependents.iter().copied().collect::<Vec<u64>>(),
                )
            };
            if boost <= 0.0 {
                continue;
            }
            for dependent in dependents {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.inherited_priority_boost =
                        task.inherited_priority_boost.max(0.6 * boost);
                }
            }
        }

        // Criticality flows dependency -> dependent, transitively.
        loop {
            let mut newly_critical = Vec::new();
            for (id, task) in &self.tasks {
                if task.is_system_critical {
                    continue;
                }
                let inherited = task.dependencies.iter().any(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.is_system_critical)
                });
                if inherited {
                    newly_critical.push(*id);
                }
            }
            if newly_critical.is_empty() {
                break;
            }
            for id in newly_critical {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.is_system_critical = true;
                }
            }
        }
    }

    /// Highest-priority admissible task.
    #[must_use]
    pub fn get_next_task(
        &self,
        category: Option<TaskCategory>,
        options: &NextTaskOptions,
    ) -> Option<TaskMessage> {
        self.tasks
            .values()
            .filter(|task| self.admissible(task, category, options))
            .max_by(|a, b| {
                a.priority
                    .unwrap_or(0.0)
                    .partial_cmp(&b.priority.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // On ties, the smaller id wins the max.
                    .then(b.task_id.cmp(&a.task_id))
            })
            .cloned()
    }

    /// Up to `count` admissible tasks without duplicates, best first.
    #[must_use]
    pub fn get_task_batch(&self, count: usize, options: &NextTaskOptions) -> Vec<TaskMessage> {
        let mut options = options.clone();
        let mut batch = Vec::new();
        while batch.len() < count {
            let Some(task) = self.get_next_task(None, &options) else {
                break;
            };
            options.exclude_ids.insert(task.task_id);
            batch.push(task);
        }
        batch
    }

    fn admissible(
        &self,
        task: &TaskMessage,
        category: Option<TaskCategory>,
        options: &NextTaskOptions,
    ) -> bool {
        let status_ok = task.status == TaskStatus::Pending
            || (options.include_deferred && task.status == TaskStatus::Deferred);
        if !status_ok || options.exclude_ids.contains(&task.task_id) {
            return false;
        }
        if let Some(category) = category {
            if task.category_or_default() != category {
                return false;
            }
        }
        if task.priority.unwrap_or(0.0) < options.priority_threshold {
            return false;
        }
        let task_category = task.category_or_default();
        self.resources.availability(task_category) >= options.resource_threshold
            && self.resources.can_start(task_category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TaskManager {
        TaskManager::new(Arc::new(ResourceMonitor::new()))
    }

    #[test]
    fn test_add_task_wires_dependents() {
        let mut manager = manager();
        manager.add_task(TaskMessage::new(1, "a")).unwrap();
        manager
            .add_task(TaskMessage::new(2, "b").with_dependencies([1]))
            .unwrap();

        assert!(manager.get_task(1).unwrap().dependents.contains(&2));
        // Duplicate ids are rejected.
        assert!(manager.add_task(TaskMessage::new(1, "dup")).is_err());
    }

    #[test]
    fn test_priority_inheritance_scenario() {
        let mut manager = manager();
        manager
            .add_task(TaskMessage::new(1, "a").with_priority(9.0).critical())
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "b").with_priority(3.0).with_dependencies([1]))
            .unwrap();

        let before = manager.get_task(2).unwrap().priority.unwrap();
        let _ = manager.prioritize_tasks(PrioritizeOptions::default());

        let b = manager.get_task(2).unwrap();
        assert!((b.inherited_priority_boost - 6.0).abs() < 1e-9);
        assert!(b.is_system_critical, "criticality must propagate");
        assert!(b.priority.unwrap() >= before + 6.0 - 1e-9);
        assert!(b.priority.unwrap() <= 10.0);
    }

    #[test]
    fn test_transitive_inheritance() {
        let mut manager = manager();
        manager
            .add_task(TaskMessage::new(1, "root").with_priority(9.0))
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "mid").with_priority(3.0).with_dependencies([1]))
            .unwrap();
        manager
            .add_task(TaskMessage::new(3, "leaf").with_priority(2.5).with_dependencies([2]))
            .unwrap();

        manager.apply_priority_inheritance();
        let mid_boost = manager.get_task(2).unwrap().inherited_priority_boost;
        let leaf_boost = manager.get_task(3).unwrap().inherited_priority_boost;
        assert!((mid_boost - 6.0).abs() < 1e-9);
        // Leaf takes the larger of its own gap (0.5) and 60% of mid's boost.
        assert!((leaf_boost - 3.6).abs() < 1e-9);
    }

    #[test]
    fn test_inheritance_never_lowers_priority() {
        let mut manager = manager();
        manager
            .add_task(TaskMessage::new(1, "weak dep").with_priority(1.0))
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "strong").with_priority(8.0).with_dependencies([1]))
            .unwrap();

        manager.apply_priority_inheritance();
        assert_eq!(manager.get_task(2).unwrap().inherited_priority_boost, 0.0);
    }

    #[test]
    fn test_status_machine() {
        let mut manager = manager();
        manager.add_task(TaskMessage::new(1, "a")).unwrap();

        manager.update_task_status(1, TaskStatus::Failed).unwrap();
        // failed -> completed is not a legal edge.
        assert!(manager.update_task_status(1, TaskStatus::Completed).is_err());

        manager.record_failure(1);
        manager.retry_task(1, false).unwrap();
        assert_eq!(manager.get_task(1).unwrap().status, TaskStatus::Pending);
        assert_eq!(manager.get_task(1).unwrap().retry_count, 1);

        manager.update_task_status(1, TaskStatus::Failed).unwrap();
        manager.retry_task(1, true).unwrap();
        assert_eq!(manager.get_task(1).unwrap().retry_count, 0);
    }

    #[test]
    fn test_completion_unblocks_deferred_dependents() {
        let mut manager = manager();
        manager.add_task(TaskMessage::new(1, "a")).unwrap();
        manager.add_task(TaskMessage::new(2, "b")).unwrap();
        let mut gated = TaskMessage::new(3, "c").with_dependencies([1, 2]);
        gated.status = TaskStatus::Deferred;
        manager.add_task(gated).unwrap();

        manager.update_task_status(1, TaskStatus::Completed).unwrap();
        assert_eq!(manager.get_task(3).unwrap().status, TaskStatus::Deferred);

        manager.update_task_status(2, TaskStatus::Completed).unwrap();
        assert_eq!(manager.get_task(3).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_prioritize_is_deterministic_with_id_ties() {
        let mut manager = manager();
        manager
            .add_task(TaskMessage::new(2, "same").with_priority(5.0))
            .unwrap();
        manager
            .add_task(TaskMessage::new(1, "same").with_priority(5.0))
            .unwrap();

        let sorted = manager.prioritize_tasks(PrioritizeOptions::default());
        assert_eq!(sorted[0].task_id, 1);
        assert_eq!(sorted[1].task_id, 2);
    }

    #[test]
    fn test_priorities_clamped_after_prioritize() {
        let mut manager = manager();
        for i in 0..10 {
            let mut task = TaskMessage::new(i, "q")
                .with_priority(f64::from(i as u32))
                .with_urgency(10.0)
                .critical();
            task.user_priority_expression = Some("CRITICAL+5".to_string());
            manager.add_task(task).unwrap();
        }
        for task in manager.prioritize_tasks(PrioritizeOptions::default()) {
            let priority = task.priority.unwrap();
            assert!((0.0..=10.0).contains(&priority));
        }
    }

    #[test]
    fn test_repeated_prioritization_is_stable() {
        let mut manager = manager();
        // Urgency contributes +2.0 per recompute under default weights; a
        // ratcheting implementation would walk 7 -> 9 -> 10 across passes.
        manager
            .add_task(TaskMessage::new(1, "urgent").with_urgency(4.0))
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "pinned").with_priority(3.0))
            .unwrap();

        let first: Vec<f64> = manager
            .prioritize_tasks(PrioritizeOptions::default())
            .iter()
            .map(|t| t.priority.unwrap())
            .collect();
        for _ in 0..3 {
            let again: Vec<f64> = manager
                .prioritize_tasks(PrioritizeOptions::default())
                .iter()
                .map(|t| t.priority.unwrap())
                .collect();
            for (a, b) in first.iter().zip(&again) {
                assert!((a - b).abs() < 0.01, "priority ratcheted: {a} -> {b}");
            }
        }
    }

    #[test]
    fn test_aging_raises_old_pending_tasks() {
        let mut manager = manager();
        let mut old = TaskMessage::new(1, "old").with_priority(2.0);
        old.created_at = Utc::now() - chrono::Duration::minutes(60);
        manager.add_task(old).unwrap();
        manager
            .add_task(TaskMessage::new(2, "fresh").with_priority(2.0))
            .unwrap();

        let sorted = manager.prioritize_tasks(PrioritizeOptions::default());
        assert_eq!(sorted[0].task_id, 1);

        let aged = manager.get_task(1).unwrap().priority.unwrap();
        let fresh = manager.get_task(2).unwrap().priority.unwrap();
        // 60 minutes hits the +3 aging cap.
        assert!(aged - fresh >= 3.0 - 1e-9);
    }

    #[test]
    fn test_decay_floors_at_one() {
        // 30 days old: decay saturates at 90 % and the floor holds.
        let mut manager = manager();
        let mut ancient = TaskMessage::new(1, "ancient").with_priority(1.2);
        ancient.created_at = Utc::now() - chrono::Duration::days(30);
        manager.add_task(ancient).unwrap();

        let _ = manager.prioritize_tasks(PrioritizeOptions::default());
        let decayed = manager.get_task(1).unwrap().priority.unwrap();
        assert_eq!(decayed, 1.0);
    }

    #[test]
    fn test_decay_spares_critical_tasks() {
        let mut manager = manager();
        let mut old = TaskMessage::new(1, "old").with_priority(6.0);
        old.created_at = Utc::now() - chrono::Duration::days(30);
        manager.add_task(old).unwrap();
        let mut guard = TaskMessage::new(2, "guard").with_priority(6.0).critical();
        guard.created_at = Utc::now() - chrono::Duration::days(30);
        manager.add_task(guard).unwrap();

        let _ = manager.prioritize_tasks(PrioritizeOptions::default());
        let old = manager.get_task(1).unwrap().priority.unwrap();
        let guard = manager.get_task(2).unwrap().priority.unwrap();
        assert!(old < guard);
        assert!(old >= 1.0);
    }

    #[test]
    fn test_get_next_task_respects_filters() {
        let mut manager = manager();
        manager
            .add_task(TaskMessage::new(1, "low").with_priority(2.0))
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "high").with_priority(9.0))
            .unwrap();

        let next = manager.get_next_task(None, &NextTaskOptions::default()).unwrap();
        assert_eq!(next.task_id, 2);

        let mut exclude = NextTaskOptions::default();
        exclude.exclude_ids.insert(2);
        assert_eq!(
            manager.get_next_task(None, &exclude).unwrap().task_id,
            1
        );

        let threshold = NextTaskOptions {
            priority_threshold: 5.0,
            exclude_ids: [2].into(),
            ..Default::default()
        };
        assert!(manager.get_next_task(None, &threshold).is_none());
    }

    #[test]
    fn test_resource_threshold_blocks_busy_categories() {
        let resources = Arc::new(ResourceMonitor::new());
        resources.record_category_load(TaskCategory::Cpu, 0.9);
        let mut manager = TaskManager::new(Arc::clone(&resources));
        manager
            .add_task(
                TaskMessage::new(1, "heavy")
                    .with_priority(9.0)
                    .with_category(TaskCategory::Cpu),
            )
            .unwrap();
        manager
            .add_task(TaskMessage::new(2, "light").with_priority(1.0))
            .unwrap();

        // Cpu availability is 0.1 < 0.3, so the lighter default-category
        // task wins despite its priority.
        let next = manager.get_next_task(None, &NextTaskOptions::default()).unwrap();
        assert_eq!(next.task_id, 2);
    }

    #[test]
    fn test_batch_has_no_duplicates() {
        let mut manager = manager();
        for i in 1..=5 {
            manager
                .add_task(TaskMessage::new(i, "q").with_priority(f64::from(i as u32)))
                .unwrap();
        }

        let batch = manager.get_task_batch(3, &NextTaskOptions::default());
        let ids: Vec<u64> = batch.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_allocate_task_id_is_monotonic() {
        let mut manager = manager();
        let first = manager.allocate_task_id();
        manager.add_task(TaskMessage::new(first, "a")).unwrap();
        let second = manager.allocate_task_id();
        assert!(second > first);
    }
}
