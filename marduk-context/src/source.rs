//! The context-source capability.

use async_trait::async_trait;

use marduk_core::error::Result;

use crate::item::ContextItem;

/// Per-source retrieval options.
#[derive(Debug, Clone)]
pub struct SourceQueryOptions {
    /// Maximum items one source should return.
    pub limit: usize,
}

impl Default for SourceQueryOptions {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

/// A provider of context items.
///
/// Sources never surface errors to the manager in practice; the fan-out
/// treats a failed or timed-out source as empty.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Retrieve context for a query.
    async fn get_context(&self, query: &str, options: &SourceQueryOptions)
        -> Result<Vec<ContextItem>>;

    /// Stable identifier like `memory:concept` or `internal:documents`.
    fn source_type(&self) -> String;

    /// Fan-out ordering; higher runs first and ranks first.
    fn priority(&self) -> i32;
}
