//! Process-wide health monitoring.
//!
//! Tracks response-time samples per component (plus per-endpoint buffers for
//! the API component), periodic resource snapshots, component status rollups,
//! and alerts deduplicated by `(component, severity, message)` within a
//! cooldown window.
//!
//! The monitor is owned by the composition root and passed by reference;
//! background sampling only runs between `start_background_tasks` and
//! `shutdown`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Components tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Ai,
    Memory,
    Api,
}

impl Component {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Ai => "ai",
            Component::Memory => "memory",
            Component::Api => "api",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component status levels, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Critical)
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A deduplicated health alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub component: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolled-up status for one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_checked: DateTime<Utc>,
}

/// Aggregate response-time statistics over a sample buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub count: usize,
}

/// One resource sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub process_memory_bytes: u64,
    pub process_cpu_percent: f32,
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Ring-buffer size per component.
    pub max_samples_per_component: usize,
    /// Ring-buffer size per API endpoint.
    pub max_samples_per_endpoint: usize,
    /// Resource sampling cadence.
    pub resource_sample_interval: Duration,
    /// Component rollup cadence.
    pub health_check_interval: Duration,
    /// Identical alerts within this window are suppressed.
    pub alert_cooldown: Duration,
    /// Oldest alerts beyond this count are dropped.
    pub max_alerts: usize,
    /// Durations above this raise a slow-response alert.
    pub response_time_threshold: Duration,
    /// Resource snapshots retained in memory.
    pub max_resource_snapshots: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_samples_per_component: 1000,
            max_samples_per_endpoint: 100,
            resource_sample_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            alert_cooldown: Duration::from_secs(300),
            max_alerts: 100,
            response_time_threshold: Duration::from_secs(2),
            max_resource_snapshots: 720,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    component_samples: HashMap<Component, VecDeque<f64>>,
    endpoint_samples: HashMap<String, VecDeque<f64>>,
    resources: VecDeque<ResourceSnapshot>,
    component_status: HashMap<String, ComponentHealth>,
    alerts: VecDeque<Alert>,
    last_alert_at: HashMap<(String, AlertSeverity, String), Instant>,
}

/// Process-wide health monitor.
pub struct HealthMonitor {
    config: HealthConfig,
    state: Arc<RwLock<MonitorState>>,
    system: Arc<Mutex<System>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_flag: Arc<RwLock<bool>>,
}

impl HealthMonitor {
    /// Create a monitor with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Create a monitor with custom configuration.
    #[must_use]
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
            system: Arc::new(Mutex::new(System::new_all())),
            background_tasks: Mutex::new(Vec::new()),
            shutdown_flag: Arc::new(RwLock::new(false)),
        }
    }

    /// Record a response-time sample for a component, optionally attributed
    /// to an API endpoint.
    pub fn record_response_time(
        &self,
        component: Component,
        endpoint: Option<&str>,
        duration: Duration,
    ) {
        let millis = duration.as_secs_f64() * 1000.0;
        let mut state = self.state.write();

        let samples = state.component_samples.entry(component).or_default();
        if samples.len() >= self.config.max_samples_per_component {
            samples.pop_front();
        }
        samples.push_back(millis);

        if component == Component::Api {
            if let Some(endpoint) = endpoint {
                let samples = state.endpoint_samples.entry(endpoint.to_string()).or_default();
                if samples.len() >= self.config.max_samples_per_endpoint {
                    samples.pop_front();
                }
                samples.push_back(millis);
            }
        }
    }

    /// Run a future, record its duration, and raise a warning alert when it
    /// exceeds the slow-response threshold.
    pub async fn measure_response_time<T, F>(
        &self,
        component: Component,
        endpoint: Option<&str>,
        fut: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        self.record_response_time(component, endpoint, elapsed);

        if elapsed > self.config.response_time_threshold {
            let target = endpoint.map_or_else(|| component.to_string(), str::to_string);
            self.raise_alert(
                component.as_str(),
                AlertSeverity::Warning,
                &format!("slow response from {target}: {} ms", elapsed.as_millis()),
            );
        }

        result
    }

    /// Aggregate statistics for one component's sample buffer.
    #[must_use]
    pub fn response_time_stats(&self, component: Component) -> Option<ResponseTimeStats> {
        let state = self.state.read();
        state.component_samples.get(&component).and_then(|s| compute_stats(s))
    }

    /// Aggregate statistics for one API endpoint.
    #[must_use]
    pub fn endpoint_stats(&self, endpoint: &str) -> Option<ResponseTimeStats> {
        let state = self.state.read();
        state.endpoint_samples.get(endpoint).and_then(|s| compute_stats(s))
    }

    /// Take one resource snapshot now and append it to the retained window.
    pub fn sample_resources(&self) -> ResourceSnapshot {
        let snapshot = {
            let mut system = self.system.lock();
            system.refresh_all();

            let (process_memory, process_cpu) = sysinfo::get_current_pid()
                .ok()
                .and_then(|pid| system.process(pid))
                .map_or((0, 0.0), |p| (p.memory(), p.cpu_usage()));

            ResourceSnapshot {
                timestamp: Utc::now(),
                cpu_percent: system.global_cpu_usage(),
                memory_used_bytes: system.used_memory(),
                memory_total_bytes: system.total_memory(),
                process_memory_bytes: process_memory,
                process_cpu_percent: process_cpu,
            }
        };

        let mut state = self.state.write();
        if state.resources.len() >= self.config.max_resource_snapshots {
            state.resources.pop_front();
        }
        state.resources.push_back(snapshot.clone());
        snapshot
    }

    /// Most recent resource snapshot, if any was taken.
    #[must_use]
    pub fn latest_resources(&self) -> Option<ResourceSnapshot> {
        self.state.read().resources.back().cloned()
    }

    /// Record a component's rolled-up status.
    pub fn set_component_status(
        &self,
        component: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut state = self.state.write();
        state.component_status.insert(
            component.to_string(),
            ComponentHealth {
                component: component.to_string(),
                status,
                message,
                last_checked: Utc::now(),
            },
        );
    }

    /// Current status of every tracked component.
    #[must_use]
    pub fn component_statuses(&self) -> Vec<ComponentHealth> {
        self.state.read().component_status.values().cloned().collect()
    }

    /// Roll component statuses up into one overall status.
    ///
    /// Majority-unhealthy rule: when more than half the components are
    /// unhealthy or worse, the rollup is unhealthy (critical if any component
    /// is critical); otherwise any non-healthy component degrades the rollup.
    #[must_use]
    pub fn overall_status(&self) -> HealthStatus {
        let state = self.state.read();
        let statuses: Vec<HealthStatus> =
            state.component_status.values().map(|c| c.status).collect();
        drop(state);

        if statuses.is_empty() {
            return HealthStatus::Healthy;
        }

        let unhealthy = statuses.iter().filter(|s| s.is_unhealthy()).count();
        let any_critical = statuses.iter().any(|s| *s == HealthStatus::Critical);

        if unhealthy * 2 > statuses.len() {
            if any_critical {
                HealthStatus::Critical
            } else {
                HealthStatus::Unhealthy
            }
        } else if statuses.iter().any(|s| *s != HealthStatus::Healthy) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Raise an alert unless the same `(component, severity, message)` fired
    /// within the cooldown. Returns whether the alert was recorded.
    pub fn raise_alert(&self, component: &str, severity: AlertSeverity, message: &str) -> bool {
        let key = (component.to_string(), severity, message.to_string());
        let mut state = self.state.write();

        if let Some(last) = state.last_alert_at.get(&key) {
            if last.elapsed() < self.config.alert_cooldown {
                debug!(component, message, "alert suppressed by cooldown");
                return false;
            }
        }

        state.last_alert_at.insert(key, Instant::now());
        if state.alerts.len() >= self.config.max_alerts {
            state.alerts.pop_front();
        }
        state.alerts.push_back(Alert {
            id: Uuid::new_v4(),
            component: component.to_string(),
            severity,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        warn!(component, ?severity, message, "health alert raised");
        true
    }

    /// Alerts retained in memory, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.state.read().alerts.iter().cloned().collect()
    }

    /// Start the resource-sampling and health-check loops.
    pub fn start_background_tasks(self: &Arc<Self>) {
        {
            let mut flag = self.shutdown_flag.write();
            *flag = false;
        }

        let sampler = {
            let monitor = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown_flag);
            let interval = self.config.resource_sample_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if *shutdown.read() {
                        break;
                    }
                    let _ = monitor.sample_resources();
                }
            })
        };

        let checker = {
            let monitor = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown_flag);
            let interval = self.config.health_check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if *shutdown.read() {
                        break;
                    }
                    let status = monitor.overall_status();
                    debug!(?status, "periodic health check");
                    if status.is_unhealthy() {
                        monitor.raise_alert(
                            "system",
                            AlertSeverity::Critical,
                            "overall health check is unhealthy",
                        );
                    }
                }
            })
        };

        let mut tasks = self.background_tasks.lock();
        tasks.push(sampler);
        tasks.push(checker);
    }

    /// Stop background loops. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut flag = self.shutdown_flag.write();
            *flag = true;
        }
        let mut tasks = self.background_tasks.lock();
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compute_stats(samples: &VecDeque<f64>) -> Option<ResponseTimeStats> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let sum: f64 = samples.iter().sum();
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p95_index = ((count as f64 * 0.95).ceil() as usize).clamp(1, count) - 1;

    Some(ResponseTimeStats {
        avg_ms: sum / count as f64,
        min_ms: min,
        max_ms: max,
        p95_ms: sorted[p95_index],
        count,
    })
}
