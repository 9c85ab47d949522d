//! The per-process AI coordinator.
//!
//! `process_query` is the hot path: fingerprint the query, consult the
//! weighted cache, fan out to context sources on a miss, rank the combined
//! context by similarity, call the LLM, and store the interaction in event
//! memory. Periodic timers persist and validate the cache in the
//! background; they catch and log every failure without aborting.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use marduk_core::config::AiSettings;
use marduk_core::error::{Error, Result};
use marduk_core::health::{AlertSeverity, Component, HealthMonitor, HealthStatus};
use marduk_context::cache::{CacheStats, ContextCacheItem, WeightedCache, WeightedCacheConfig};
use marduk_context::embedding::{EmbeddingProvider, SimilarityEngine};
use marduk_context::item::ContextItem;
use marduk_context::manager::{RetrievalOptions, SourceManager};
use marduk_context::persist::ContextPersistence;
use marduk_context::source::ContextSource;
use marduk_context::sources::{ActivityRecord, DocumentSource, MemorySource, UserActivitySource, WebSource};
use marduk_context::validator::{ContextValidator, ValidationReport, ValidatorConfig};
use marduk_memory::factory::MemoryFactory;
use marduk_memory::item::{ItemMetadata, MemoryContent, MemoryItem, Subsystem};
use marduk_memory::query::MemoryQuery;

use crate::llm::{LlmClient, LlmRequest, TokenUsage};

/// Tokens shorter than this never enter the fingerprint.
const MIN_TOKEN_LENGTH: usize = 4;

/// Fingerprint keeps this many sorted unique tokens.
const MAX_FINGERPRINT_TOKENS: usize = 6;

/// Fallback fingerprint length when no token qualifies.
const FALLBACK_PREFIX_CHARS: usize = 50;

/// Query-term union cap on cache entries.
const MAX_QUERY_TERMS: usize = 20;

/// Compute the cache fingerprint of a query.
///
/// Lowercase, trim, split on whitespace, keep tokens longer than 3 chars,
/// sort, dedup, keep the first six, join on a space, prefix `query:`. When
/// no token survives, the first 50 chars of the normalized input stand in.
#[must_use]
pub fn cache_fingerprint(query: &str) -> String {
    let normalized = query.trim().to_lowercase();
    let mut tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|token| token.len() >= MIN_TOKEN_LENGTH)
        .collect();
    tokens.sort_unstable();
    tokens.dedup();

    if tokens.is_empty() {
        let prefix: String = normalized.chars().take(FALLBACK_PREFIX_CHARS).collect();
        format!("query:{prefix}")
    } else {
        format!("query:{}", tokens[..tokens.len().min(MAX_FINGERPRINT_TOKENS)].join(" "))
    }
}

/// Significant query tokens in order of appearance, deduplicated.
fn significant_tokens(query: &str) -> Vec<String> {
    let normalized = query.trim().to_lowercase();
    let mut tokens = Vec::new();
    for token in normalized.split_whitespace() {
        if token.len() >= MIN_TOKEN_LENGTH && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens.truncate(MAX_QUERY_TERMS);
    tokens
}

/// Caller-facing options for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Extra context supplied by the caller, ranked with the rest.
    pub context: Vec<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

/// Result of `process_query`.
#[derive(Debug, Clone, Serialize)]
pub struct AiQueryResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// Cache statistics plus coordinator flags.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsReport {
    pub cache: CacheStats,
    pub hit_rate: f64,
    pub source_count: usize,
    pub persistence_enabled: bool,
    pub validation_enabled: bool,
}

/// Per-process orchestrator over memory, context, and the LLM.
pub struct AiCoordinator {
    settings: AiSettings,
    llm: Arc<dyn LlmClient>,
    similarity: Arc<SimilarityEngine>,
    source_manager: SourceManager,
    documents: Arc<DocumentSource>,
    activity: Arc<UserActivitySource>,
    memory: Arc<MemoryFactory>,
    cache: Mutex<WeightedCache<ContextCacheItem>>,
    persistence: Arc<ContextPersistence>,
    validator: ContextValidator,
    health: Arc<HealthMonitor>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_flag: Arc<RwLock<bool>>,
}

impl AiCoordinator {
    /// Wire the coordinator: memory adapters, document and activity
    /// sources, the weighted cache, persistence, and the validator.
    #[must_use]
    pub fn new(
        settings: AiSettings,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        memory: Arc<MemoryFactory>,
        health: Arc<HealthMonitor>,
        context_dir: PathBuf,
    ) -> Self {
        let documents = Arc::new(DocumentSource::new(4));
        let activity = Arc::new(UserActivitySource::new(3));

        let mut source_manager = SourceManager::new();
        for subsystem in MemoryFactory::subsystems() {
            source_manager.register(Arc::new(MemorySource::new(
                memory.store(subsystem),
                subsystem,
                MemorySource::default_priority(subsystem),
            )));
        }
        source_manager.register(Arc::clone(&documents) as Arc<dyn ContextSource>);
        source_manager.register(Arc::clone(&activity) as Arc<dyn ContextSource>);
        source_manager.register(Arc::new(WebSource::new(None, 1)));

        let cache = WeightedCache::new(WeightedCacheConfig {
            capacity: settings.cache_limit,
            ..Default::default()
        });
        let validator = ContextValidator::new(ValidatorConfig {
            strict: settings.strict_validation_mode,
            ..Default::default()
        });

        Self {
            similarity: Arc::new(SimilarityEngine::new(embedder)),
            source_manager,
            documents,
            activity,
            memory,
            cache: Mutex::new(cache),
            persistence: Arc::new(ContextPersistence::new(context_dir)),
            validator,
            health,
            llm,
            settings,
            timers: Mutex::new(Vec::new()),
            shutdown_flag: Arc::new(RwLock::new(false)),
        }
    }

    /// Load the persisted context cache, when persistence is enabled.
    pub async fn init(&self) -> Result<()> {
        if !self.settings.enable_context_persistence {
            return Ok(());
        }
        let entries = self.persistence.load().await?;
        if !entries.is_empty() {
            info!(entries = entries.len(), "restored context cache");
            self.cache.lock().load(entries);
        }
        Ok(())
    }

    /// Answer a query with retrieved context and record the interaction.
    pub async fn process_query(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<AiQueryResponse> {
        match self.process_query_inner(query, options).await {
            Ok(response) => Ok(response),
            Err(err) => Err(err.into_process_error()),
        }
    }

    async fn process_query_inner(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<AiQueryResponse> {
        let fingerprint = cache_fingerprint(query);
        // An empty token set can never identify a query; treat it as a
        // permanent miss and leave the cache untouched.
        let cacheable = fingerprint != "query:";

        let mut context = Vec::new();
        let mut cache_hit = false;

        if cacheable {
            let mut cache = self.cache.lock();
            if let Some(mut entry) = cache.get(&fingerprint) {
                cache_hit = true;
                context.extend(entry.context.iter().cloned());
                entry.merge_query_terms(&significant_tokens(query), MAX_QUERY_TERMS);
                cache.set(&fingerprint, entry);
            }
        }
        context.extend(options.context.iter().cloned());

        if !cache_hit && cacheable {
            let retrieved = self.retrieve_context(query).await;
            if !retrieved.is_empty() {
                let lines: Vec<String> = retrieved.iter().map(render_context_line).collect();
                let relevance = self.retrieval_relevance(query, &lines).await;

                let mut entry = ContextCacheItem::new(lines.clone(), relevance);
                entry.weight = Some(relevance);
                entry.merge_query_terms(&significant_tokens(query), MAX_QUERY_TERMS);
                self.cache.lock().set(&fingerprint, entry);

                context.extend(lines);
            }
        }

        let ranked = self.rank_context(query, context).await;
        let request = LlmRequest {
            prompt: query.to_string(),
            context: ranked,
            temperature: options
                .temperature
                .unwrap_or(self.settings.default_temperature),
            max_tokens: options.max_tokens.unwrap_or(self.settings.default_max_tokens),
            system_prompt: options.system_prompt.clone(),
        };

        let response = self
            .health
            .measure_response_time(Component::Ai, None, self.llm.complete(&request))
            .await?;

        self.store_interaction(query, &response.content, &response.model, response.usage)
            .await?;

        Ok(AiQueryResponse {
            content: response.content,
            usage: response.usage,
            model: response.model,
            timestamp: Utc::now(),
        })
    }

    /// Fan out to the registered sources; fall back to querying the memory
    /// stores directly when the managed retrieval comes back empty.
    async fn retrieve_context(&self, query: &str) -> Vec<ContextItem> {
        let options = RetrievalOptions {
            max_sources: self.settings.max_sources_per_query,
            max_results: self.settings.context_limit * 2,
            ..Default::default()
        };
        let items = self.source_manager.get_context(query, &options).await;
        if !items.is_empty() {
            return items;
        }

        debug!("managed retrieval was empty, trying direct memory fan-out");
        self.direct_memory_context(query).await
    }

    async fn direct_memory_context(&self, query: &str) -> Vec<ContextItem> {
        let mut items = Vec::new();
        for subsystem in MemoryFactory::subsystems() {
            let store = self.memory.store(subsystem);
            let mut store = store.write().await;
            for item_type in subsystem.allowed_types() {
                match store.query(&MemoryQuery::new(*item_type, query)) {
                    Ok(response) => {
                        for item in response.items {
                            if let MemoryContent::Fact { text } = &item.content {
                                items.push(ContextItem::new(
                                    text.clone(),
                                    format!("memory:{subsystem}"),
                                    subsystem.as_str(),
                                ));
                            }
                        }
                    }
                    Err(err) => debug!(%subsystem, %err, "direct memory query failed"),
                }
            }
        }
        items.truncate(self.settings.context_limit);
        items
    }

    /// Weighted-mean similarity of the query against up to three sampled
    /// context lines, weighted 1, 1/2, 1/3.
    async fn retrieval_relevance(&self, query: &str, lines: &[String]) -> f64 {
        let sample: Vec<String> = lines.iter().take(3).cloned().collect();
        if sample.is_empty() {
            return 0.0;
        }
        let scored = self.similarity.batch_similarities(query, &sample).await;

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (index, scored) in scored.iter().enumerate() {
            let weight = 1.0 / (index as f64 + 1.0);
            weighted_sum += scored.score * weight;
            weight_total += weight;
        }
        (weighted_sum / weight_total).clamp(0.0, 1.0)
    }

    /// Rank context lines by similarity to the query and truncate to the
    /// configured limit. Falls back to string similarity inside the engine.
    async fn rank_context(&self, query: &str, context: Vec<String>) -> Vec<String> {
        if context.len() <= 1 {
            return context;
        }
        let scored = self.similarity.batch_similarities(query, &context).await;
        let mut indexed: Vec<(usize, f64)> = scored
            .iter()
            .enumerate()
            .map(|(index, s)| (index, s.score))
            .collect();
        indexed.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        indexed
            .into_iter()
            .take(self.settings.context_limit)
            .map(|(index, _)| context[index].clone())
            .collect()
    }

    /// Store the interaction in event memory.
    async fn store_interaction(
        &self,
        query: &str,
        response: &str,
        model: &str,
        usage: TokenUsage,
    ) -> Result<()> {
        let now = Utc::now();
        let mut metadata = ItemMetadata {
            timestamp: Some(now),
            confidence: Some(interaction_confidence(usage, response.len())),
            source: Some("ai-coordinator".to_string()),
            ..Default::default()
        };
        metadata
            .extra
            .insert("model".to_string(), serde_json::json!(model));
        metadata
            .extra
            .insert("usage".to_string(), serde_json::json!(usage));

        let item = MemoryItem {
            id: format!("ai-interaction:{}", now.timestamp_millis()),
            item_type: "ai_interaction".to_string(),
            content: MemoryContent::Event {
                description: query.to_string(),
                timestamp: now,
                context: Some(response.to_string()),
                actors: vec!["ai-coordinator".to_string()],
                location: None,
            },
            metadata,
        };

        let store = self.memory.store(Subsystem::Event);
        let mut store = store.write().await;
        store
            .store(item)
            .await
            .map_err(|e| Error::Api(format!("failed to store interaction: {e}")))
    }

    /// Forward a document to the document source.
    pub fn add_document(&self, id: impl Into<String>, content: impl Into<String>) {
        self.documents.add_document(id, content);
    }

    /// Record user activity for the activity source.
    pub fn record_activity(&self, record: ActivityRecord) {
        self.activity.record_activity(record);
    }

    /// Write the cache through context persistence. Returns `false` when
    /// the save was debounced.
    pub async fn persist_context(&self) -> Result<bool> {
        let entries = self.cache.lock().entries();
        match self.persistence.save(&entries).await {
            Ok(saved) => {
                self.health
                    .set_component_status("memory", HealthStatus::Healthy, None);
                Ok(saved)
            }
            Err(err) => {
                self.health.raise_alert(
                    "memory",
                    AlertSeverity::Critical,
                    &format!("context persistence failed: {err}"),
                );
                self.health.set_component_status(
                    "memory",
                    HealthStatus::Degraded,
                    Some("context persistence failing".to_string()),
                );
                Err(err)
            }
        }
    }

    /// Write a rolling snapshot of the cache.
    pub async fn snapshot_context(&self) -> Result<String> {
        let entries = self.cache.lock().entries();
        self.persistence.create_snapshot(&entries).await
    }

    /// Snapshot timestamps, newest first.
    pub async fn list_context_snapshots(&self) -> Vec<String> {
        self.persistence.list_snapshots().await
    }

    /// Replace the cache with a snapshot's contents.
    pub async fn restore_context_snapshot(&self, slug: &str) -> Result<usize> {
        let entries = self.persistence.load_snapshot(slug).await?;
        let count = entries.len();
        let mut cache = self.cache.lock();
        cache.clear();
        cache.load(entries);
        Ok(count)
    }

    /// Validate the cache; optionally apply fixes and re-persist.
    pub async fn validate_context_cache(&self, apply_fixes: bool) -> Result<ValidationReport> {
        let entries = self.cache.lock().entries();
        if !apply_fixes {
            return Ok(self.validator.validate_cache(&entries));
        }

        let (fixed, report) = self.validator.fix_cache(entries);
        {
            let mut cache = self.cache.lock();
            cache.clear();
            cache.load(fixed);
        }
        if self.settings.enable_context_persistence {
            let _ = self.persist_context().await?;
        }
        Ok(report)
    }

    /// Validate arbitrary context items; optionally return the fixed set.
    #[must_use]
    pub fn validate_context_items(
        &self,
        items: Vec<ContextItem>,
        apply_fixes: bool,
    ) -> (Vec<ContextItem>, ValidationReport) {
        if apply_fixes {
            self.validator.fix_items(items)
        } else {
            let report = self.validator.validate_items(&items);
            (items, report)
        }
    }

    /// Cache statistics plus coordinator flags.
    #[must_use]
    pub fn get_cache_stats(&self) -> CacheStatsReport {
        let stats = self.cache.lock().stats();
        CacheStatsReport {
            hit_rate: stats.hit_rate(),
            cache: stats,
            source_count: self.source_manager.source_count(),
            persistence_enabled: self.settings.enable_context_persistence,
            validation_enabled: self.settings.enable_context_validation,
        }
    }

    /// Start the auto-save and periodic-validation timers.
    pub fn start_periodic_tasks(self: &Arc<Self>) {
        let mut timers = self.timers.lock();

        if self.settings.enable_context_persistence {
            let coordinator = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown_flag);
            let period =
                std::time::Duration::from_millis(self.settings.context_persistence_interval_ms);
            timers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if *shutdown.read() {
                        break;
                    }
                    let swept = coordinator.cache.lock().sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired cache entries removed before save");
                    }
                    if let Err(err) = coordinator.persist_context().await {
                        warn!(%err, "periodic context save failed");
                    }
                }
            }));
        }

        if self.settings.enable_context_validation {
            let coordinator = Arc::clone(self);
            let shutdown = Arc::clone(&self.shutdown_flag);
            let period =
                std::time::Duration::from_millis(self.settings.context_validation_interval_ms);
            let auto_fix = self.settings.auto_fix_validation_issues;
            timers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if *shutdown.read() {
                        break;
                    }
                    match coordinator.validate_context_cache(auto_fix).await {
                        Ok(report) if !report.is_valid => {
                            info!(
                                issues = report.issues.len(),
                                fixed = auto_fix,
                                "periodic cache validation found issues"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "periodic cache validation failed"),
                    }
                }
            }));
        }
    }

    /// Stop timers, flush the cache, and persist every memory store.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut flag = self.shutdown_flag.write();
            *flag = true;
        }
        {
            let mut timers = self.timers.lock();
            for handle in timers.drain(..) {
                handle.abort();
            }
        }

        if self.settings.enable_context_persistence {
            let _ = self.persist_context().await?;
        }
        self.memory.shutdown().await
    }
}

/// Label a context item for the flat prompt context, e.g. `[Concept] …`.
fn render_context_line(item: &ContextItem) -> String {
    let mut label: String = item.item_type.clone();
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!("[{label}] {}", item.content)
}

/// Confidence heuristic from completion-to-prompt token ratio and response
/// length, clamped to `[0, 1]`.
fn interaction_confidence(usage: TokenUsage, response_len: usize) -> f64 {
    let ratio = if usage.prompt_tokens == 0 {
        0.0
    } else {
        (f64::from(usage.completion_tokens) / f64::from(usage.prompt_tokens)).min(1.0)
    };
    let length_factor = (response_len as f64 / 500.0).min(1.0);
    (0.5 + 0.3 * ratio + 0.2 * length_factor).clamp(0.0, 1.0)
}
