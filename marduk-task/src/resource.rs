//! System and per-category resource tracking.
//!
//! The monitor is append-only from external inputs: load readings come in
//! via `record_*` (or the sysinfo sampler) and the task manager only reads.
//! Running-task counts enforce per-category parallelism limits.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use sysinfo::System;

use crate::category::TaskCategory;

#[derive(Default)]
struct Readings {
    system_load: f64,
    category_load: HashMap<TaskCategory, f64>,
    running: HashMap<TaskCategory, usize>,
}

/// Load readings consulted during prioritization and scheduling.
pub struct ResourceMonitor {
    readings: RwLock<Readings>,
    system: Mutex<System>,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(Readings::default()),
            system: Mutex::new(System::new()),
        }
    }

    /// Record the overall system load, clamped to `[0, 1]`.
    pub fn record_system_load(&self, load: f64) {
        self.readings.write().system_load = load.clamp(0.0, 1.0);
    }

    /// Record one category's load, clamped to `[0, 1]`.
    pub fn record_category_load(&self, category: TaskCategory, load: f64) {
        self.readings
            .write()
            .category_load
            .insert(category, load.clamp(0.0, 1.0));
    }

    /// Sample CPU usage via sysinfo and record it as the system load.
    pub fn sample_system_load(&self) -> f64 {
        let load = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            f64::from(system.global_cpu_usage()) / 100.0
        };
        self.record_system_load(load);
        load
    }

    #[must_use]
    pub fn system_load(&self) -> f64 {
        self.readings.read().system_load
    }

    #[must_use]
    pub fn category_load(&self, category: TaskCategory) -> f64 {
        self.readings
            .read()
            .category_load
            .get(&category)
            .copied()
            .unwrap_or(0.0)
    }

    /// Fraction of capacity available to a category: the tighter of overall
    /// headroom and category headroom.
    #[must_use]
    pub fn availability(&self, category: TaskCategory) -> f64 {
        let readings = self.readings.read();
        let category_load = readings.category_load.get(&category).copied().unwrap_or(0.0);
        (1.0 - readings.system_load).min(1.0 - category_load)
    }

    /// Whether the category's parallelism limit admits another task.
    #[must_use]
    pub fn can_start(&self, category: TaskCategory) -> bool {
        let Some(max_parallel) = category.rule().max_parallel else {
            return true;
        };
        let readings = self.readings.read();
        readings.running.get(&category).copied().unwrap_or(0) < max_parallel
    }

    /// Note a task entering execution.
    pub fn task_started(&self, category: TaskCategory) {
        *self.readings.write().running.entry(category).or_insert(0) += 1;
    }

    /// Note a task leaving execution.
    pub fn task_finished(&self, category: TaskCategory) {
        let mut readings = self.readings.write();
        if let Some(count) = readings.running.get_mut(&category) {
            *count = count.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn running(&self, category: TaskCategory) -> usize {
        self.readings
            .read()
            .running
            .get(&category)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_are_clamped() {
        let monitor = ResourceMonitor::new();
        monitor.record_system_load(1.7);
        assert_eq!(monitor.system_load(), 1.0);
        monitor.record_category_load(TaskCategory::Io, -0.5);
        assert_eq!(monitor.category_load(TaskCategory::Io), 0.0);
    }

    #[test]
    fn test_availability_uses_tighter_headroom() {
        let monitor = ResourceMonitor::new();
        monitor.record_system_load(0.2);
        monitor.record_category_load(TaskCategory::Cpu, 0.9);
        assert!((monitor.availability(TaskCategory::Cpu) - 0.1).abs() < 1e-9);
        // A category with no recorded load is bounded by system headroom.
        assert!((monitor.availability(TaskCategory::Io) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_parallelism_limits() {
        let monitor = ResourceMonitor::new();
        // Cpu is serial.
        assert!(monitor.can_start(TaskCategory::Cpu));
        monitor.task_started(TaskCategory::Cpu);
        assert!(!monitor.can_start(TaskCategory::Cpu));
        monitor.task_finished(TaskCategory::Cpu);
        assert!(monitor.can_start(TaskCategory::Cpu));

        // Io admits three.
        for _ in 0..3 {
            assert!(monitor.can_start(TaskCategory::Io));
            monitor.task_started(TaskCategory::Io);
        }
        assert!(!monitor.can_start(TaskCategory::Io));

        // Unlimited categories always admit.
        for _ in 0..10 {
            monitor.task_started(TaskCategory::User);
        }
        assert!(monitor.can_start(TaskCategory::User));
    }

    #[test]
    fn test_finish_never_underflows() {
        let monitor = ResourceMonitor::new();
        monitor.task_finished(TaskCategory::Cpu);
        assert_eq!(monitor.running(TaskCategory::Cpu), 0);
    }
}
