//! Query records and field filters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marduk_core::error::{Error, Result};

use crate::item::{ItemMetadata, MemoryItem};

/// Predicate over one metadata field: numeric bounds or membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Membership: the field must contain at least one of these values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<String>>,
}

impl FieldFilter {
    /// Exact-match value usable for index intersection, when the filter is a
    /// single-value membership test.
    #[must_use]
    pub fn exact_value(&self) -> Option<&str> {
        match self.any_of.as_deref() {
            Some([single]) => Some(single.as_str()),
            _ => None,
        }
    }

    /// Evaluate the predicate against one item's metadata.
    #[must_use]
    pub fn matches(&self, field: &str, metadata: &ItemMetadata) -> bool {
        if self.min.is_some() || self.max.is_some() {
            let Some(value) = metadata.numeric_field(field) else {
                return false;
            };
            if self.min.is_some_and(|min| value < min) {
                return false;
            }
            if self.max.is_some_and(|max| value > max) {
                return false;
            }
        }

        if let Some(allowed) = &self.any_of {
            let values = metadata.string_values(field);
            if !allowed.iter().any(|candidate| values.contains(candidate)) {
                return false;
            }
        }

        true
    }
}

/// A query against one memory subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Type discriminator; must be in the subsystem's allowed set.
    #[serde(rename = "type")]
    pub item_type: String,
    /// Substring matched case-insensitively per subsystem.
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<HashMap<String, FieldFilter>>,
}

impl MemoryQuery {
    #[must_use]
    pub fn new(item_type: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            item_type: item_type.into(),
            term: term.into(),
            filters: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, filter: FieldFilter) -> Self {
        self.filters
            .get_or_insert_with(HashMap::new)
            .insert(field.into(), filter);
        self
    }

    /// A query must carry a type and a term.
    pub fn validate(&self) -> Result<()> {
        if self.item_type.trim().is_empty() {
            return Err(Error::Validation("query.type must not be empty".to_string()));
        }
        Ok(())
    }

    /// Evaluate every filter against one item.
    #[must_use]
    pub fn filters_match(&self, item: &MemoryItem) -> bool {
        self.filters.as_ref().is_none_or(|filters| {
            filters
                .iter()
                .all(|(field, filter)| filter.matches(field, &item.metadata))
        })
    }
}

/// Response metadata attached to every query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

/// Result of a subsystem query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub items: Vec<MemoryItem>,
    pub metadata: QueryMetadata,
}

impl QueryResponse {
    #[must_use]
    pub fn new(items: Vec<MemoryItem>) -> Self {
        let total = items.len();
        Self {
            items,
            metadata: QueryMetadata {
                total,
                timestamp: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MemoryContent;

    fn item_with_confidence(confidence: f64) -> MemoryItem {
        let mut item = MemoryItem::new("f1", "fact", MemoryContent::Fact { text: "t".into() });
        item.metadata.confidence = Some(confidence);
        item.metadata.tags = vec!["alpha".into(), "beta".into()];
        item
    }

    #[test]
    fn test_numeric_filter_bounds() {
        let filter = FieldFilter {
            min: Some(0.5),
            max: Some(0.9),
            any_of: None,
        };
        assert!(filter.matches("confidence", &item_with_confidence(0.7).metadata));
        assert!(!filter.matches("confidence", &item_with_confidence(0.3).metadata));
        assert!(!filter.matches("confidence", &item_with_confidence(0.95).metadata));
    }

    #[test]
    fn test_numeric_filter_missing_field_fails() {
        let filter = FieldFilter {
            min: Some(0.5),
            ..Default::default()
        };
        let metadata = ItemMetadata::default();
        assert!(!filter.matches("confidence", &metadata));
    }

    #[test]
    fn test_membership_filter() {
        let filter = FieldFilter {
            any_of: Some(vec!["beta".into()]),
            ..Default::default()
        };
        assert!(filter.matches("tags", &item_with_confidence(0.7).metadata));

        let filter = FieldFilter {
            any_of: Some(vec!["gamma".into()]),
            ..Default::default()
        };
        assert!(!filter.matches("tags", &item_with_confidence(0.7).metadata));
    }

    #[test]
    fn test_exact_value_only_for_single_membership() {
        let single = FieldFilter {
            any_of: Some(vec!["beta".into()]),
            ..Default::default()
        };
        assert_eq!(single.exact_value(), Some("beta"));

        let multi = FieldFilter {
            any_of: Some(vec!["a".into(), "b".into()]),
            ..Default::default()
        };
        assert_eq!(multi.exact_value(), None);
    }

    #[test]
    fn test_query_validation() {
        assert!(MemoryQuery::new("fact", "term").validate().is_ok());
        assert!(MemoryQuery::new("", "term").validate().is_err());
    }

    #[test]
    fn test_filters_match_all_semantics() {
        let query = MemoryQuery::new("fact", "t")
            .with_filter(
                "confidence",
                FieldFilter {
                    min: Some(0.5),
                    ..Default::default()
                },
            )
            .with_filter(
                "tags",
                FieldFilter {
                    any_of: Some(vec!["alpha".into()]),
                    ..Default::default()
                },
            );

        assert!(query.filters_match(&item_with_confidence(0.8)));
        assert!(!query.filters_match(&item_with_confidence(0.2)));
    }
}
