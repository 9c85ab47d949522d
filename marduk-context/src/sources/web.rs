//! Optional web retrieval source.
//!
//! Without a configured endpoint the source fails with a timeout error,
//! which the fan-out treats as an empty contribution.

use async_trait::async_trait;
use serde::Deserialize;

use marduk_core::error::{Error, Result};

use crate::item::ContextItem;
use crate::source::{ContextSource, SourceQueryOptions};

#[derive(Debug, Deserialize)]
struct WebResult {
    title: String,
    snippet: String,
}

/// Search-endpoint backed source.
pub struct WebSource {
    endpoint: Option<String>,
    client: reqwest::Client,
    priority: i32,
}

impl WebSource {
    #[must_use]
    pub fn new(endpoint: Option<String>, priority: i32) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            priority,
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl ContextSource for WebSource {
    async fn get_context(
        &self,
        query: &str,
        options: &SourceQueryOptions,
    ) -> Result<Vec<ContextItem>> {
        let Some(endpoint) = &self.endpoint else {
            return Err(Error::Timeout);
        };

        let response = self
            .client
            .get(endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| Error::Api(format!("web search request failed: {e}")))?;
        let results: Vec<WebResult> = response
            .json()
            .await
            .map_err(|e| Error::Api(format!("web search response malformed: {e}")))?;

        Ok(results
            .into_iter()
            .take(options.limit)
            .map(|r| {
                ContextItem::new(
                    format!("{}: {}", r.title, r.snippet),
                    self.source_type(),
                    "web",
                )
            })
            .collect())
    }

    fn source_type(&self) -> String {
        "external:web".to_string()
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_source_times_out() {
        let source = WebSource::new(None, 1);
        let err = source
            .get_context("anything", &SourceQueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(!source.is_configured());
    }
}
