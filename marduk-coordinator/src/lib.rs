#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Marduk Coordinator
//!
//! The per-process orchestrator tying the core together:
//!
//! - [`llm`]: the LLM client capability and the OpenAI provider with
//!   linear-backoff retries
//! - [`coordinator`]: the query pipeline (fingerprint → cache → fan-out →
//!   ranking → LLM → interaction storage) plus periodic persistence and
//!   validation timers
//! - [`channel`]: the line-delimited JSON worker channel and its
//!   `TaskDispatcher` implementation

pub mod channel;
pub mod coordinator;
pub mod llm;

pub use channel::{WorkerChannel, WorkerMessage};
pub use coordinator::{cache_fingerprint, AiCoordinator, AiQueryResponse, CacheStatsReport, QueryOptions};
pub use llm::{LlmClient, LlmRequest, LlmResponse, MockLlmClient, OpenAiClient, TokenUsage};
