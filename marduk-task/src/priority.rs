//! The weighted priority model and the user-priority expression parser.
//!
//! A task's priority is a clamped weighted sum of components; every
//! component is clamped to `[0, 10]` before summing and the final value is
//! clamped to `[0, 10]` after the category multiplier and bounds.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::message::{TaskMessage, TaskStatus};

/// Weights and thresholds of the priority model.
#[derive(Debug, Clone)]
pub struct PriorityWeights {
    /// Base component used when a task has no explicit priority.
    pub base_factor: f64,
    /// Multiplier on the parsed user-priority expression.
    pub user_factor: f64,
    /// Multiplier on normalized age (one day saturates).
    pub aging_factor: f64,
    /// Multiplier on urgency, damped by resource pressure.
    pub urgency_factor: f64,
    /// Multiplier on the dependency priority difference.
    pub dependency_factor: f64,
    /// Scales how strongly load damps urgency.
    pub resource_factor: f64,
    /// Added when a task saw no activity past the stalled threshold.
    pub stalled_boost: f64,
    /// Added when relevant context exists and context inclusion is on.
    pub context_boost: f64,
    /// Subtracted per retry.
    pub failure_penalty: f64,
    /// Inactivity span after which a pending task counts as stalled.
    pub stalled_threshold: Duration,
    /// Daily decay rate for old, non-critical tasks.
    pub decay_rate: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            base_factor: 5.0,
            user_factor: 0.5,
            aging_factor: 1.0,
            urgency_factor: 0.5,
            dependency_factor: 1.0,
            resource_factor: 1.0,
            stalled_boost: 1.0,
            context_boost: 0.5,
            failure_penalty: 0.5,
            stalled_threshold: Duration::from_secs(300),
            decay_rate: 0.1,
        }
    }
}

/// Parse a user-priority expression like `HIGH+2` or `LOW-1`.
///
/// Grammar: `(CRITICAL|HIGH|MEDIUM|LOW|LOWEST)([+-]\d+)?`, case-insensitive,
/// result clamped to `[0, 10]`. Unparsable expressions yield `None`.
#[must_use]
pub fn parse_user_priority(expression: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(CRITICAL|HIGH|MEDIUM|LOW|LOWEST)([+-]\d+)?\s*$")
            .expect("user-priority grammar is a valid regex")
    });
    let captures = pattern.captures(expression)?;

    let level = match captures
        .get(1)
        .map(|m| m.as_str().to_ascii_uppercase())
        .as_deref()
    {
        Some("CRITICAL") => 10.0,
        Some("HIGH") => 8.0,
        Some("MEDIUM") => 5.0,
        Some("LOW") => 3.0,
        Some("LOWEST") => 1.0,
        _ => return None,
    };
    let modifier: f64 = captures
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);

    Some((level + modifier).clamp(0.0, 10.0))
}

/// Resource inputs to the urgency damping term.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadContext {
    /// Overall system load, `[0, 1]`.
    pub system_load: f64,
    /// Load on the task's category, `[0, 1]`.
    pub category_load: f64,
}

fn component(value: f64) -> f64 {
    value.clamp(0.0, 10.0)
}

/// Compute one task's priority from its components.
///
/// Pure in its inputs: `base_priority` is the producer-assigned priority
/// snapshot (never the previously computed total), so repeated recomputes
/// over an unchanged task yield the same value instead of ratcheting.
#[must_use]
pub fn compute_priority(
    task: &TaskMessage,
    base_priority: Option<f64>,
    weights: &PriorityWeights,
    load: LoadContext,
    include_context: bool,
    now: DateTime<Utc>,
) -> f64 {
    let base = component(base_priority.unwrap_or(weights.base_factor));

    let user = task
        .user_priority_expression
        .as_deref()
        .and_then(|expression| {
            let parsed = parse_user_priority(expression);
            if parsed.is_none() {
                debug!(task_id = task.task_id, expression, "unparsable user priority");
            }
            parsed
        })
        .map_or(0.0, |value| component(value * weights.user_factor));

    let age_ms = now
        .signed_duration_since(task.created_at)
        .num_milliseconds()
        .max(0) as f64;
    let age = component((age_ms / 86_400_000.0).min(1.0) * weights.aging_factor);

    let damping = 1.0
        - load.system_load
            * task.resource_cost.unwrap_or(0.0)
            * load.category_load
            * weights.resource_factor;
    let urgency = component(task.urgency.unwrap_or(0.0) * weights.urgency_factor * damping.max(0.0));

    let inherited = component(task.inherited_priority_boost);

    let last_activity = task
        .last_execution_attempt
        .unwrap_or(task.status_updated_at)
        .max(task.created_at);
    let stalled_for = now.signed_duration_since(last_activity);
    let stalled = if task.status == TaskStatus::Pending
        && stalled_for.num_milliseconds() as u128 > weights.stalled_threshold.as_millis()
    {
        component(weights.stalled_boost)
    } else {
        0.0
    };

    let context = if include_context && task.has_relevant_context {
        component(weights.context_boost)
    } else {
        0.0
    };

    let failure = component(f64::from(task.retry_count) * weights.failure_penalty);
    let critical = if task.is_system_critical { 2.0 } else { 0.0 };

    let sum = base + user + age + urgency + inherited + stalled + context - failure + critical;
    task.category_or_default().apply(sum)
}

/// Pending tasks older than this earn the aging bonus.
pub const AGING_THRESHOLD_MS: i64 = 30 * 60 * 1000;

/// Non-critical tasks older than this decay.
pub const DECAY_THRESHOLD_MS: i64 = 24 * 60 * 60 * 1000;

/// Aging bonus for a pending task: `min(3, age_minutes / 20)` once past the
/// threshold. A pure function of the creation time, so repeated passes over
/// an unchanged task do not compound.
#[must_use]
pub fn aging_bonus(task: &TaskMessage, now: DateTime<Utc>) -> f64 {
    if task.status != TaskStatus::Pending {
        return 0.0;
    }
    let age_ms = now
        .signed_duration_since(task.created_at)
        .num_milliseconds();
    if age_ms <= AGING_THRESHOLD_MS {
        return 0.0;
    }
    (age_ms as f64 / 60_000.0 / 20.0).min(3.0)
}

/// Decay multiplier for an old, non-critical task:
/// `1 − min(0.9, decay_rate · age_days)`. Returns 1.0 (no decay) for young
/// or critical tasks; the caller floors the decayed priority at 1.
#[must_use]
pub fn decay_multiplier(task: &TaskMessage, weights: &PriorityWeights, now: DateTime<Utc>) -> f64 {
    if task.is_system_critical {
        return 1.0;
    }
    let age_ms = now
        .signed_duration_since(task.created_at)
        .num_milliseconds();
    if age_ms <= DECAY_THRESHOLD_MS {
        return 1.0;
    }
    let age_days = age_ms as f64 / 86_400_000.0;
    1.0 - (weights.decay_rate * age_days).min(0.9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::TaskCategory;

    #[test]
    fn test_parse_levels() {
        assert_eq!(parse_user_priority("CRITICAL"), Some(10.0));
        assert_eq!(parse_user_priority("HIGH"), Some(8.0));
        assert_eq!(parse_user_priority("MEDIUM"), Some(5.0));
        assert_eq!(parse_user_priority("LOW"), Some(3.0));
        assert_eq!(parse_user_priority("LOWEST"), Some(1.0));
    }

    #[test]
    fn test_parse_modifiers_and_clamping() {
        assert_eq!(parse_user_priority("HIGH+2"), Some(10.0));
        assert_eq!(parse_user_priority("HIGH-3"), Some(5.0));
        assert_eq!(parse_user_priority("LOWEST-5"), Some(0.0));
        assert_eq!(parse_user_priority("CRITICAL+9"), Some(10.0));
    }

    #[test]
    fn test_parse_is_case_insensitive_and_total() {
        assert_eq!(parse_user_priority("high+1"), Some(9.0));
        assert_eq!(parse_user_priority(" medium "), Some(5.0));
        assert_eq!(parse_user_priority("URGENT"), None);
        assert_eq!(parse_user_priority("HIGH+"), None);
        assert_eq!(parse_user_priority(""), None);
    }

    #[test]
    fn test_priority_stays_in_range() {
        let weights = PriorityWeights::default();
        let now = Utc::now();

        let mut maxed = TaskMessage::new(1, "q")
            .with_priority(10.0)
            .with_urgency(10.0)
            .critical();
        maxed.user_priority_expression = Some("CRITICAL".to_string());
        maxed.inherited_priority_boost = 10.0;
        assert_eq!(
            compute_priority(&maxed, maxed.priority, &weights, LoadContext::default(), true, now),
            10.0
        );

        let mut failed = TaskMessage::new(2, "q").with_priority(0.0);
        failed.retry_count = 50;
        let low = compute_priority(&failed, failed.priority, &weights, LoadContext::default(), true, now);
        assert!((0.0..=10.0).contains(&low));
    }

    #[test]
    fn test_critical_bonus() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let plain = TaskMessage::new(1, "q").with_priority(5.0);
        let critical = TaskMessage::new(2, "q").with_priority(5.0).critical();

        let plain_score =
            compute_priority(&plain, plain.priority, &weights, LoadContext::default(), true, now);
        let critical_score = compute_priority(
            &critical,
            critical.priority,
            &weights,
            LoadContext::default(),
            true,
            now,
        );
        assert!((critical_score - plain_score - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_urgency_damped_by_load() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let mut task = TaskMessage::new(1, "q").with_priority(2.0).with_urgency(10.0);
        task.resource_cost = Some(1.0);

        let idle = compute_priority(&task, task.priority, &weights, LoadContext::default(), true, now);
        let loaded = compute_priority(
            &task,
            task.priority,
            &weights,
            LoadContext {
                system_load: 1.0,
                category_load: 1.0,
            },
            true,
            now,
        );
        assert!(loaded < idle);
    }

    #[test]
    fn test_failure_penalty_lowers_priority() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let clean = TaskMessage::new(1, "q").with_priority(5.0);
        let mut retried = TaskMessage::new(2, "q").with_priority(5.0);
        retried.retry_count = 4;

        let clean_score =
            compute_priority(&clean, clean.priority, &weights, LoadContext::default(), true, now);
        let retried_score = compute_priority(
            &retried,
            retried.priority,
            &weights,
            LoadContext::default(),
            true,
            now,
        );
        assert!(retried_score < clean_score);
    }

    #[test]
    fn test_aging_bonus_is_pure_and_capped() {
        let now = Utc::now();
        let mut task = TaskMessage::new(1, "q");

        // Young tasks earn nothing.
        assert_eq!(aging_bonus(&task, now), 0.0);

        task.created_at = now - chrono::Duration::minutes(40);
        assert!((aging_bonus(&task, now) - 2.0).abs() < 0.01);
        // Asking twice changes nothing.
        assert_eq!(aging_bonus(&task, now), aging_bonus(&task, now));

        // 60 minutes caps at 3.
        task.created_at = now - chrono::Duration::minutes(120);
        assert!((aging_bonus(&task, now) - 3.0).abs() < 1e-9);

        // Non-pending tasks never age.
        task.status = TaskStatus::Completed;
        assert_eq!(aging_bonus(&task, now), 0.0);
    }

    #[test]
    fn test_decay_multiplier_bounds() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let mut task = TaskMessage::new(1, "q");

        // Young tasks do not decay.
        assert_eq!(decay_multiplier(&task, &weights, now), 1.0);

        // Two days at 0.1/day: multiplier 0.8.
        task.created_at = now - chrono::Duration::days(2);
        assert!((decay_multiplier(&task, &weights, now) - 0.8).abs() < 0.01);

        // Decay saturates at 90 %.
        task.created_at = now - chrono::Duration::days(30);
        assert!((decay_multiplier(&task, &weights, now) - 0.1).abs() < 0.01);

        // Critical tasks are exempt.
        task.is_system_critical = true;
        assert_eq!(decay_multiplier(&task, &weights, now), 1.0);
    }

    #[test]
    fn test_system_category_floor() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let task = TaskMessage::new(1, "q")
            .with_priority(1.0)
            .with_category(TaskCategory::System);
        let score = compute_priority(&task, task.priority, &weights, LoadContext::default(), true, now);
        assert!(score >= 8.0);
    }

    #[test]
    fn test_stalled_boost() {
        let weights = PriorityWeights::default();
        let mut task = TaskMessage::new(1, "q").with_priority(5.0);
        let past = Utc::now() - chrono::Duration::minutes(10);
        task.created_at = past;
        task.status_updated_at = past;

        let now = Utc::now();
        let stalled = compute_priority(&task, task.priority, &weights, LoadContext::default(), true, now);
        let fresh_task = TaskMessage::new(2, "q").with_priority(5.0);
        let fresh = compute_priority(
            &fresh_task,
            fresh_task.priority,
            &weights,
            LoadContext::default(),
            true,
            now,
        );
        assert!(stalled > fresh);
    }
}
