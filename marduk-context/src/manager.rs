//! Bounded concurrent fan-out over registered context sources.
//!
//! The manager never surfaces an error: a source that fails or exceeds the
//! per-source timeout contributes nothing. Late results from timed-out
//! sources are discarded on return. Within one call, items from
//! higher-priority sources always precede items from lower-priority ones,
//! and a source's internal ordering is preserved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::debug;

use marduk_core::STALE_AFTER_MS;

use crate::item::ContextItem;
use crate::source::{ContextSource, SourceQueryOptions};

/// Recency filter applied after the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recency {
    /// Drop items older than the staleness window.
    Recent,
    /// Keep everything.
    #[default]
    Any,
}

/// Fan-out options.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    /// Sources consulted, highest priority first.
    pub max_sources: usize,
    /// Per-source timeout.
    pub timeout: Duration,
    /// Items below this confidence are dropped; items without a confidence
    /// pass through.
    pub min_confidence: Option<f64>,
    pub recency: Recency,
    /// Final result cap, applied after filtering.
    pub max_results: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_sources: 5,
            timeout: Duration::from_millis(2000),
            min_confidence: None,
            recency: Recency::Any,
            max_results: 20,
        }
    }
}

/// Registry and fan-out coordinator for context sources.
#[derive(Default)]
pub struct SourceManager {
    sources: Vec<Arc<dyn ContextSource>>,
}

impl SourceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source. Order of registration breaks priority ties.
    pub fn register(&mut self, source: Arc<dyn ContextSource>) {
        self.sources.push(source);
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Registered source identifiers, highest priority first.
    #[must_use]
    pub fn source_types(&self) -> Vec<String> {
        let mut sources: Vec<&Arc<dyn ContextSource>> = self.sources.iter().collect();
        sources.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        sources.iter().map(|s| s.source_type()).collect()
    }

    /// Fan out to the top sources, filter, and truncate.
    pub async fn get_context(&self, query: &str, options: &RetrievalOptions) -> Vec<ContextItem> {
        let mut ranked: Vec<Arc<dyn ContextSource>> = self.sources.clone();
        ranked.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        ranked.truncate(options.max_sources);

        let per_source = SourceQueryOptions {
            limit: options.max_results,
        };

        let retrievals = ranked.iter().map(|source| {
            let source = Arc::clone(source);
            let per_source = per_source.clone();
            async move {
                match tokio::time::timeout(options.timeout, source.get_context(query, &per_source))
                    .await
                {
                    Ok(Ok(items)) => items,
                    Ok(Err(err)) => {
                        debug!(source = %source.source_type(), %err, "source failed, skipping");
                        Vec::new()
                    }
                    Err(_) => {
                        debug!(source = %source.source_type(), "source timed out, skipping");
                        Vec::new()
                    }
                }
            }
        });

        // join_all preserves the ranked (priority) order of the futures.
        let results = join_all(retrievals).await;
        let now = Utc::now();

        let mut items: Vec<ContextItem> = results.into_iter().flatten().collect();
        if let Some(min_confidence) = options.min_confidence {
            items.retain(|item| {
                item.metadata
                    .confidence
                    .is_none_or(|confidence| confidence >= min_confidence)
            });
        }
        if options.recency == Recency::Recent {
            items.retain(|item| item.age_ms(now).is_none_or(|age| age <= STALE_AFTER_MS));
        }
        items.truncate(options.max_results);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marduk_core::error::Result;

    struct StaticSource {
        name: String,
        priority: i32,
        items: Vec<ContextItem>,
        delay: Duration,
    }

    impl StaticSource {
        fn new(name: &str, priority: i32, contents: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                priority,
                items: contents
                    .iter()
                    .map(|c| ContextItem::new(*c, name, "static"))
                    .collect(),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ContextSource for StaticSource {
        async fn get_context(
            &self,
            _query: &str,
            _options: &SourceQueryOptions,
        ) -> Result<Vec<ContextItem>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.items.clone())
        }

        fn source_type(&self) -> String {
            self.name.clone()
        }

        fn priority(&self) -> i32 {
            self.priority
        }
    }

    #[tokio::test]
    async fn test_priority_ordering_of_results() {
        let mut manager = SourceManager::new();
        manager.register(Arc::new(StaticSource::new("low", 1, &["low-1", "low-2"])));
        manager.register(Arc::new(StaticSource::new("high", 9, &["high-1", "high-2"])));

        let items = manager
            .get_context("q", &RetrievalOptions::default())
            .await;
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["high-1", "high-2", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_slow_source_is_isolated() {
        let mut manager = SourceManager::new();
        manager.register(Arc::new(
            StaticSource::new("slow", 9, &["late"]).with_delay(Duration::from_millis(500)),
        ));
        manager.register(Arc::new(StaticSource::new("fast", 5, &["on-time"])));

        let options = RetrievalOptions {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let items = manager.get_context("q", &options).await;
        let elapsed = started.elapsed();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "on-time");
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_max_sources_limits_fanout() {
        let mut manager = SourceManager::new();
        manager.register(Arc::new(StaticSource::new("a", 9, &["a"])));
        manager.register(Arc::new(StaticSource::new("b", 5, &["b"])));
        manager.register(Arc::new(StaticSource::new("c", 1, &["c"])));

        let options = RetrievalOptions {
            max_sources: 2,
            ..Default::default()
        };
        let items = manager.get_context("q", &options).await;
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_confidence_filter() {
        let mut manager = SourceManager::new();
        let mut weak = ContextItem::new("weak", "s", "static");
        weak.metadata.confidence = Some(0.2);
        let mut strong = ContextItem::new("strong", "s", "static");
        strong.metadata.confidence = Some(0.9);
        let unscored = ContextItem::new("unscored", "s", "static");

        let source = StaticSource {
            name: "s".to_string(),
            priority: 1,
            items: vec![weak, strong, unscored],
            delay: Duration::ZERO,
        };
        manager.register(Arc::new(source));

        let options = RetrievalOptions {
            min_confidence: Some(0.5),
            ..Default::default()
        };
        let items = manager.get_context("q", &options).await;
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["strong", "unscored"]);
    }

    #[tokio::test]
    async fn test_recency_filter_drops_stale_items() {
        let mut manager = SourceManager::new();
        let fresh = ContextItem::new("fresh", "s", "static").with_timestamp(Utc::now());
        let stale = ContextItem::new("stale", "s", "static")
            .with_timestamp(Utc::now() - chrono::Duration::days(45));

        let source = StaticSource {
            name: "s".to_string(),
            priority: 1,
            items: vec![fresh, stale],
            delay: Duration::ZERO,
        };
        manager.register(Arc::new(source));

        let options = RetrievalOptions {
            recency: Recency::Recent,
            ..Default::default()
        };
        let items = manager.get_context("q", &options).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "fresh");
    }

    #[tokio::test]
    async fn test_max_results_truncation() {
        let mut manager = SourceManager::new();
        manager.register(Arc::new(StaticSource::new("s", 1, &["1", "2", "3", "4"])));

        let options = RetrievalOptions {
            max_results: 2,
            ..Default::default()
        };
        let items = manager.get_context("q", &options).await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_source_contributes_nothing() {
        struct FailingSource;

        #[async_trait]
        impl ContextSource for FailingSource {
            async fn get_context(
                &self,
                _query: &str,
                _options: &SourceQueryOptions,
            ) -> Result<Vec<ContextItem>> {
                Err(marduk_core::Error::Timeout)
            }
            fn source_type(&self) -> String {
                "failing".to_string()
            }
            fn priority(&self) -> i32 {
                9
            }
        }

        let mut manager = SourceManager::new();
        manager.register(Arc::new(FailingSource));
        manager.register(Arc::new(StaticSource::new("ok", 1, &["survivor"])));

        let items = manager
            .get_context("q", &RetrievalOptions::default())
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "survivor");
    }
}
