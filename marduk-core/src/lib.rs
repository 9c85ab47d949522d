#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Marduk Core
//!
//! Shared foundation for the marduk cognitive coordination core:
//!
//! - [`error`]: the error taxonomy used across every crate
//! - [`config`]: explicit configuration records with environment loading
//! - [`tensor`]: small vector helpers backing similarity computations
//! - [`health`]: process-wide health monitoring (response times, resources,
//!   alerts with cooldown deduplication)
//!
//! Nothing in this crate performs I/O besides the health monitor's resource
//! sampling; it exists so the memory, context, and task crates agree on
//! errors, configuration, and timestamps.

pub mod config;
pub mod error;
pub mod health;
pub mod tensor;

pub use config::{AiSettings, LoggingConfig, MardukConfig, MemoryPathsConfig, OpenAiConfig, ServerConfig};
pub use error::{Error, Result};
pub use health::{Alert, AlertSeverity, Component, ComponentHealth, HealthMonitor, HealthStatus};

/// Shared staleness window: context items and cache entries older than this
/// are treated as outdated by both the source-manager recency filter and the
/// context validator.
pub const STALE_AFTER_MS: i64 = 30 * 24 * 60 * 60 * 1000;
