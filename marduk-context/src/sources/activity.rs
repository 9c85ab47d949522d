//! Recent-user-activity source.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use marduk_core::error::Result;

use crate::item::ContextItem;
use crate::source::{ContextSource, SourceQueryOptions};

/// Records kept in the ring buffer.
pub const MAX_RECORDS: usize = 50;

/// Activity older than this is never returned.
pub const MAX_RECORD_AGE_DAYS: i64 = 7;

/// One user-activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ActivityRecord {
    #[must_use]
    pub fn now(description: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            description: description.into(),
            activity_type: activity_type.into(),
            tags: Vec::new(),
        }
    }
}

/// Ring buffer of recent user activity, matched by token overlap.
#[derive(Default)]
pub struct UserActivitySource {
    records: RwLock<VecDeque<ActivityRecord>>,
    priority: i32,
}

impl UserActivitySource {
    #[must_use]
    pub fn new(priority: i32) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            priority,
        }
    }

    /// Append a record, discarding the oldest beyond the buffer size.
    pub fn record_activity(&self, record: ActivityRecord) {
        let mut records = self.records.write();
        if records.len() >= MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ContextSource for UserActivitySource {
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

        let cutoff = Utc::now() - Duration::days(MAX_RECORD_AGE_DAYS);
        let records = self.records.read();

        let mut items = Vec::new();
        for record in records.iter().rev() {
            if record.timestamp < cutoff {
                continue;
            }
            let description = record.description.to_lowercase();
            let matches = tokens.iter().any(|token| {
                description.contains(token)
                    || record.tags.iter().any(|tag| tag.to_lowercase().contains(token))
            });
            if matches {
                let mut item = ContextItem::new(
                    format!("[Activity] {}", record.description),
                    self.source_type(),
                    "activity",
                )
                .with_timestamp(record.timestamp);
                item.metadata.tags = record.tags.clone();
                items.push(item);
                if items.len() >= options.limit {
                    break;
                }
            }
        }
        Ok(items)
    }

    fn source_type(&self) -> String {
        "internal:user-activity".to_string()
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_matches_description_and_tags() {
        let source = UserActivitySource::new(3);
        source.record_activity(ActivityRecord::now("edited the scheduler config", "edit"));
        let mut tagged = ActivityRecord::now("ran nightly checks", "task");
        tagged.tags = vec!["scheduler".to_string()];
        source.record_activity(tagged);
        source.record_activity(ActivityRecord::now("unrelated browsing", "view"));

        let items = source
            .get_context("scheduler", &SourceQueryOptions::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_old_records_are_ignored() {
        let source = UserActivitySource::new(3);
        let mut stale = ActivityRecord::now("ancient scheduler tweak", "edit");
        stale.timestamp = Utc::now() - Duration::days(10);
        source.record_activity(stale);

        let items = source
            .get_context("scheduler", &SourceQueryOptions::default())
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_ring_buffer_caps_records() {
        let source = UserActivitySource::new(3);
        for i in 0..(MAX_RECORDS + 10) {
            source.record_activity(ActivityRecord::now(format!("activity {i}"), "edit"));
        }
        assert_eq!(source.len(), MAX_RECORDS);
    }
}
