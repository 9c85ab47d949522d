#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Marduk Task
//!
//! The deliberation→scheduling→execution side of the coordination core:
//!
//! - [`message`]: task messages, status machine types, insights, and the
//!   memory state consumed by deferred activation
//! - [`category`]: per-category multipliers, bounds, and parallelism rules
//! - [`priority`]: the weighted priority model and the user-priority
//!   expression parser
//! - [`resource`]: system and per-category load tracking
//! - [`manager`]: the task graph with inheritance, aging, decay, and
//!   scheduling queries
//! - [`deferred`]: prerequisite-gated task buffer
//! - [`scheduler`]: dispatcher capability and batch execution
//! - [`deliberation`]: the full cycle from self-notes to dispatched batches
//!
//! Priority recomputation and scheduling passes are synchronous and never
//! suspend; only dispatch and note I/O are async.

pub mod category;
pub mod deferred;
pub mod deliberation;
pub mod manager;
pub mod message;
pub mod priority;
pub mod resource;
pub mod scheduler;

pub use category::{CategoryRule, TaskCategory};
pub use deferred::DeferredTaskHandler;
pub use deliberation::{DeliberationConfig, DeliberationCycle, CycleReport};
pub use manager::{NextTaskOptions, PrioritizeOptions, TaskManager};
pub use message::{Insight, MemoryState, TaskCondition, TaskMessage, TaskStatus};
pub use priority::{parse_user_priority, PriorityWeights};
pub use resource::ResourceMonitor;
pub use scheduler::{TaskDispatcher, TaskExecutor, TaskResult};
