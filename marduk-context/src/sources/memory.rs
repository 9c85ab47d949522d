//! Thin adapters over the memory subsystems.
//!
//! Each adapter queries its store and renders the subsystem-specific content
//! into a flat string the ranker can score.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use marduk_core::error::Result;
use marduk_memory::item::{MemoryContent, MemoryItem, Subsystem};
use marduk_memory::query::MemoryQuery;
use marduk_memory::store::MemoryStore;

use crate::item::ContextItem;
use crate::source::{ContextSource, SourceQueryOptions};

/// Adapter exposing one memory subsystem as a context source.
pub struct MemorySource {
    store: Arc<RwLock<MemoryStore>>,
    subsystem: Subsystem,
    priority: i32,
}

impl MemorySource {
    #[must_use]
    pub fn new(store: Arc<RwLock<MemoryStore>>, subsystem: Subsystem, priority: i32) -> Self {
        Self {
            store,
            subsystem,
            priority,
        }
    }

    /// Default fan-out priorities: concepts rank highest, workflows lowest.
    #[must_use]
    pub fn default_priority(subsystem: Subsystem) -> i32 {
        match subsystem {
            Subsystem::Concept => 8,
            Subsystem::Factual => 7,
            Subsystem::Event => 6,
            Subsystem::Workflow => 5,
        }
    }

    fn render(item: &MemoryItem) -> String {
        match &item.content {
            MemoryContent::Fact { text } => text.clone(),
            MemoryContent::Event {
                description,
                context,
                ..
            } => match context {
                Some(context) => format!("[Event] {description} ({context})"),
                None => format!("[Event] {description}"),
            },
            MemoryContent::Concept {
                name,
                description,
                relationships,
                ..
            } => {
                let mut rendered = match description {
                    Some(description) => format!("{name}: {description}"),
                    None => name.clone(),
                };
                if !relationships.is_empty() {
                    let related: Vec<String> = relationships
                        .iter()
                        .map(|r| format!("{} ({})", r.target, r.relation_type))
                        .collect();
                    rendered.push_str("\nRelated concepts: ");
                    rendered.push_str(&related.join(", "));
                }
                rendered
            }
            MemoryContent::Workflow { title, steps, .. } => {
                format!("Workflow: {title}\nSteps: {}", steps.join("; "))
            }
        }
    }

    fn to_context_item(&self, item: &MemoryItem) -> ContextItem {
        let mut context_item = ContextItem::new(
            Self::render(item),
            self.source_type(),
            self.subsystem.as_str(),
        );
        context_item.metadata.confidence = item
            .metadata
            .confidence
            .or(item.metadata.importance)
            .or(item.metadata.success_rate);
        context_item.metadata.timestamp = item.metadata.timestamp.or(match &item.content {
            MemoryContent::Event { timestamp, .. } => Some(*timestamp),
            _ => None,
        });
        context_item.metadata.tags = item.metadata.tags.clone();
        context_item
    }
}

#[async_trait]
impl ContextSource for MemorySource {
    async fn get_context(
        &self,
        query: &str,
        options: &SourceQueryOptions,
    ) -> Result<Vec<ContextItem>> {
        let mut items = Vec::new();
        // Stores are touched per allowed discriminator so event memory also
        // surfaces stored AI interactions.
        for item_type in self.subsystem.allowed_types() {
            let mut store = self.store.write().await;
            let response = store.query(&MemoryQuery::new(*item_type, query))?;
            drop(store);
            for item in &response.items {
                items.push(self.to_context_item(item));
                if items.len() >= options.limit {
                    return Ok(items);
                }
            }
        }
        Ok(items)
    }

    fn source_type(&self) -> String {
        format!("memory:{}", self.subsystem)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
