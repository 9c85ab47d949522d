//! The uniform record every context source produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata attached to a context item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One unit of supporting context, ready for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    /// Stable source identifier like `memory:concept` or `internal:documents`.
    pub source: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub metadata: ContextItemMetadata,
}

impl ContextItem {
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        item_type: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            item_type: item_type.into(),
            metadata: ContextItemMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = Some(timestamp);
        self
    }

    /// Age relative to `now`, when the item carries a timestamp.
    #[must_use]
    pub fn age_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.metadata
            .timestamp
            .map(|ts| now.signed_duration_since(ts).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_age() {
        let now = Utc::now();
        let item = ContextItem::new("body", "internal:documents", "document")
            .with_confidence(0.8)
            .with_timestamp(now - chrono::Duration::days(2));

        assert_eq!(item.metadata.confidence, Some(0.8));
        let age = item.age_ms(now).unwrap();
        assert!(age >= chrono::Duration::days(2).num_milliseconds());
    }

    #[test]
    fn test_serde_uses_type_key() {
        let item = ContextItem::new("body", "s", "document");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "document");
    }
}
