//! Task categories and their scheduling rules.

use serde::{Deserialize, Serialize};

/// Scheduling category of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    #[default]
    Default,
    Io,
    Cpu,
    Memory,
    Ai,
    System,
    User,
    Background,
}

/// Per-category priority and parallelism parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryRule {
    /// Applied to the summed priority components.
    pub multiplier: f64,
    pub min_priority: Option<f64>,
    pub max_priority: Option<f64>,
    /// `Some(1)` means serial execution; `None` means unlimited.
    pub max_parallel: Option<usize>,
    /// Preemptive categories may displace running work in the scheduler.
    pub preemptive: bool,
}

impl TaskCategory {
    /// Every category, in rule-table order.
    #[must_use]
    pub fn all() -> [TaskCategory; 8] {
        [
            TaskCategory::Default,
            TaskCategory::Io,
            TaskCategory::Cpu,
            TaskCategory::Memory,
            TaskCategory::Ai,
            TaskCategory::System,
            TaskCategory::User,
            TaskCategory::Background,
        ]
    }

    /// The category's scheduling rule.
    #[must_use]
    pub fn rule(&self) -> CategoryRule {
        match self {
            TaskCategory::Default => CategoryRule {
                multiplier: 1.0,
                min_priority: None,
                max_priority: None,
                max_parallel: None,
                preemptive: false,
            },
            TaskCategory::Io => CategoryRule {
                multiplier: 0.9,
                min_priority: None,
                max_priority: None,
                max_parallel: Some(3),
                preemptive: false,
            },
            TaskCategory::Cpu => CategoryRule {
                multiplier: 1.2,
                min_priority: None,
                max_priority: None,
                max_parallel: Some(1),
                preemptive: false,
            },
            TaskCategory::Memory => CategoryRule {
                multiplier: 1.1,
                min_priority: None,
                max_priority: None,
                max_parallel: Some(2),
                preemptive: false,
            },
            TaskCategory::Ai => CategoryRule {
                multiplier: 1.5,
                min_priority: None,
                max_priority: None,
                max_parallel: Some(1),
                preemptive: true,
            },
            TaskCategory::System => CategoryRule {
                multiplier: 2.0,
                min_priority: Some(8.0),
                max_priority: None,
                max_parallel: None,
                preemptive: true,
            },
            TaskCategory::User => CategoryRule {
                multiplier: 1.8,
                min_priority: None,
                max_priority: None,
                max_parallel: None,
                preemptive: false,
            },
            TaskCategory::Background => CategoryRule {
                multiplier: 0.5,
                min_priority: None,
                max_priority: Some(6.0),
                max_parallel: None,
                preemptive: false,
            },
        }
    }

    /// Apply the category multiplier and bounds to a summed priority.
    #[must_use]
    pub fn apply(&self, priority: f64) -> f64 {
        let rule = self.rule();
        let mut result = priority * rule.multiplier;
        if let Some(min) = rule.min_priority {
            result = result.max(min);
        }
        if let Some(max) = rule.max_priority {
            result = result.min(max);
        }
        result.clamp(0.0, 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table() {
        assert_eq!(TaskCategory::Default.rule().multiplier, 1.0);
        assert_eq!(TaskCategory::Io.rule().max_parallel, Some(3));
        assert_eq!(TaskCategory::Cpu.rule().max_parallel, Some(1));
        assert_eq!(TaskCategory::Memory.rule().max_parallel, Some(2));
        assert!(TaskCategory::Ai.rule().preemptive);
        assert_eq!(TaskCategory::Ai.rule().max_parallel, Some(1));
        assert_eq!(TaskCategory::System.rule().min_priority, Some(8.0));
        assert!(TaskCategory::System.rule().preemptive);
        assert_eq!(TaskCategory::User.rule().multiplier, 1.8);
        assert_eq!(TaskCategory::Background.rule().max_priority, Some(6.0));
    }

    #[test]
    fn test_apply_multiplier_and_bounds() {
        // System floors at 8 even for low sums.
        assert_eq!(TaskCategory::System.apply(2.0), 8.0);
        // Background caps at 6 even for high sums.
        assert_eq!(TaskCategory::Background.apply(20.0), 6.0);
        // Default clamps into [0, 10].
        assert_eq!(TaskCategory::Default.apply(12.0), 10.0);
        assert_eq!(TaskCategory::Default.apply(-1.0), 0.0);
        // Cpu multiplies.
        assert!((TaskCategory::Cpu.apply(5.0) - 6.0).abs() < 1e-9);
    }
}
