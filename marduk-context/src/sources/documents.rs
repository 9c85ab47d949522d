//! In-process document source.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use marduk_core::error::Result;

use crate::item::ContextItem;
use crate::source::{ContextSource, SourceQueryOptions};

struct Document {
    content: String,
    added_at: DateTime<Utc>,
}

/// Mapping from document id to content, matched by query-token containment.
#[derive(Default)]
pub struct DocumentSource {
    documents: RwLock<HashMap<String, Document>>,
    priority: i32,
}

impl DocumentSource {
    #[must_use]
    pub fn new(priority: i32) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            priority,
        }
    }

    /// Add or replace a document.
    pub fn add_document(&self, id: impl Into<String>, content: impl Into<String>) {
        self.documents.write().insert(
            id.into(),
            Document {
                content: content.into(),
                added_at: Utc::now(),
            },
        );
    }

    /// Remove a document. Returns whether it existed.
    pub fn remove_document(&self, id: &str) -> bool {
        self.documents.write().remove(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl ContextSource for DocumentSource {
    async fn get_context(
        &self,
        query: &str,
        options: &SourceQueryOptions,
    ) -> Result<Vec<ContextItem>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read();
        let mut ids: Vec<&String> = documents.keys().collect();
        ids.sort();

        let mut items = Vec::new();
        for id in ids {
            let document = &documents[id];
            let lowered = document.content.to_lowercase();
            if tokens.iter().any(|token| lowered.contains(token)) {
                items.push(
                    ContextItem::new(document.content.clone(), self.source_type(), "document")
                        .with_timestamp(document.added_at),
                );
                if items.len() >= options.limit {
                    break;
                }
            }
        }
        Ok(items)
    }

    fn source_type(&self) -> String {
        "internal:documents".to_string()
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
