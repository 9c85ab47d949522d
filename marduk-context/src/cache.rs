//! Weighted LRU cache over fingerprinted retrieval results.
//!
//! Eviction is score-based rather than purely recency-based: each entry is
//! scored `α·recency + β·frequency + γ·weight − δ·age`, the lowest score is
//! evicted, and ties break on the oldest access stamp. Entries whose weight
//! sits above the median earn TTL extensions on hit, up to a configured
//! limit. Expired entries are dropped when observed by `get` or during the
//! owner's periodic `sweep_expired` pass.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Behavior required of cached values.
pub trait CacheValue: Clone {
    fn last_accessed(&self) -> i64;
    fn set_last_accessed(&mut self, at_ms: i64);
    fn created_at(&self) -> i64;
    fn access_count(&self) -> u32;
    fn set_access_count(&mut self, count: u32);
    fn weight(&self) -> f64 {
        0.0
    }
    fn ttl_ms(&self) -> Option<i64> {
        None
    }
    fn set_ttl_ms(&mut self, _ttl_ms: Option<i64>) {}
}

/// A fingerprint's cached retrieval payload plus scoring metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCacheItem {
    /// Retrieved context lines, highest priority first.
    pub context: Vec<String>,
    pub last_accessed: i64,
    pub created_at: i64,
    pub access_count: u32,
    /// Retrieval relevance in `[0, 1]`.
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl ContextCacheItem {
    /// Create a fresh entry; `created_at == last_accessed`, one access.
    #[must_use]
    pub fn new(context: Vec<String>, relevance: f64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            context,
            last_accessed: now,
            created_at: now,
            access_count: 1,
            relevance: relevance.clamp(0.0, 1.0),
            query_terms: Vec::new(),
            weight: None,
            ttl: None,
            metadata: None,
        }
    }

    /// Union new query terms into the entry, capped to `cap` terms.
    pub fn merge_query_terms(&mut self, terms: &[String], cap: usize) {
        for term in terms {
            if !self.query_terms.contains(term) {
                self.query_terms.push(term.clone());
            }
        }
        self.query_terms.truncate(cap);
    }

    /// Structural validity: the four numeric fields must be coherent.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.created_at <= self.last_accessed
            && self.access_count >= 1
            && (0.0..=1.0).contains(&self.relevance)
    }
}

impl CacheValue for ContextCacheItem {
    fn last_accessed(&self) -> i64 {
        self.last_accessed
    }
    fn set_last_accessed(&mut self, at_ms: i64) {
        self.last_accessed = at_ms;
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn access_count(&self) -> u32 {
        self.access_count
    }
    fn set_access_count(&mut self, count: u32) {
        self.access_count = count;
    }
    fn weight(&self) -> f64 {
        self.weight.unwrap_or(self.relevance)
    }
    fn ttl_ms(&self) -> Option<i64> {
        self.ttl
    }
    fn set_ttl_ms(&mut self, ttl_ms: Option<i64>) {
        self.ttl = ttl_ms;
    }
}

/// Scoring and lifecycle knobs.
#[derive(Debug, Clone)]
pub struct WeightedCacheConfig {
    pub capacity: usize,
    /// α: recency contribution.
    pub recency_weight: f64,
    /// β: frequency contribution.
    pub frequency_weight: f64,
    /// γ: entry-weight contribution.
    pub weight_factor: f64,
    /// δ: age penalty.
    pub age_decay_factor: f64,
    /// Multiplier applied to the TTL of above-median entries on hit.
    pub ttl_extension_factor: f64,
    pub max_ttl_extensions: u32,
    /// Cadence the owner should run `sweep_expired` at.
    pub sweep_interval: Duration,
}

impl Default for WeightedCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            recency_weight: 0.35,
            frequency_weight: 0.25,
            weight_factor: 0.3,
            age_decay_factor: 0.1,
            ttl_extension_factor: 1.5,
            max_ttl_extensions: 3,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Cache statistics; counters are monotonic within a process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
    pub oldest_age_ms: i64,
    pub newest_age_ms: i64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type DisposeFn<V> = Box<dyn Fn(&V, &str) + Send + Sync>;

/// Capacity-bound mapping from key to value with weighted-score eviction.
pub struct WeightedCache<V: CacheValue> {
    config: WeightedCacheConfig,
    entries: HashMap<String, V>,
    ttl_extensions: HashMap<String, u32>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    dispose: Option<DisposeFn<V>>,
}

impl<V: CacheValue> WeightedCache<V> {
    #[must_use]
    pub fn new(config: WeightedCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            ttl_extensions: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            dispose: None,
        }
    }

    /// Install a callback invoked with `(value, key)` on every eviction.
    #[must_use]
    pub fn with_dispose(mut self, dispose: DisposeFn<V>) -> Self {
        self.dispose = Some(dispose);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a key, refreshing its access stamp and count. Expired entries
    /// are removed and count as misses.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Utc::now().timestamp_millis();

        let expired = self
            .entries
            .get(key)
            .is_some_and(|value| is_expired(value, now));
        if expired {
            self.entries.remove(key);
            self.ttl_extensions.remove(key);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        let median = self.median_weight();
        let Some(value) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };

        value.set_last_accessed(now.max(value.last_accessed() + 1));
        value.set_access_count(value.access_count().saturating_add(1));

        if value.ttl_ms().is_some() && value.weight() > median {
            let extensions = self.ttl_extensions.entry(key.to_string()).or_insert(0);
            if *extensions < self.config.max_ttl_extensions {
                let extended = (value.ttl_ms().unwrap_or(0) as f64
                    * self.config.ttl_extension_factor) as i64;
                value.set_ttl_ms(Some(extended));
                *extensions += 1;
            }
        }

        self.hits += 1;
        Some(value.clone())
    }

    /// Insert or update an entry, evicting the lowest-scoring entry when the
    /// cache is full.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.capacity {
            self.evict_lowest();
        }
        if !self.entries.contains_key(&key) {
            self.ttl_extensions.remove(&key);
        }
        self.entries.insert(key, value);
    }

    /// Remove an entry without invoking the dispose callback.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.ttl_extensions.remove(key);
        self.entries.remove(key)
    }

    /// Drop every entry, keeping counters. Used by snapshot restores.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ttl_extensions.clear();
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, value)| is_expired(*value, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.ttl_extensions.remove(key);
        }
        self.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Utc::now().timestamp_millis();
        let (oldest, newest) = self.entries.values().fold((0i64, i64::MAX), |acc, value| {
            let age = now - value.created_at();
            (acc.0.max(age), acc.1.min(age))
        });

        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            size: self.entries.len(),
            capacity: self.config.capacity,
            oldest_age_ms: if self.entries.is_empty() { 0 } else { oldest },
            newest_age_ms: if self.entries.is_empty() { 0 } else { newest },
        }
    }

    /// All entries sorted by key, for persistence snapshots.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        let mut entries: Vec<(String, V)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Bulk-load persisted entries, respecting capacity.
    pub fn load(&mut self, entries: Vec<(String, V)>) {
        for (key, value) in entries {
            if self.entries.len() >= self.config.capacity && !self.entries.contains_key(&key) {
                break;
            }
            self.entries.insert(key, value);
        }
    }

    /// Median of current entry weights; 0 for an empty cache.
    #[must_use]
    pub fn median_weight(&self) -> f64 {
        let mut weights: Vec<f64> = self.entries.values().map(CacheValue::weight).collect();
        if weights.is_empty() {
            return 0.0;
        }
        weights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = weights.len() / 2;
        if weights.len() % 2 == 0 {
            (weights[mid - 1] + weights[mid]) / 2.0
        } else {
            weights[mid]
        }
    }

    fn evict_lowest(&mut self) {
        let now = Utc::now().timestamp_millis();
        let ranges = ScoreRanges::over(self.entries.values(), now);

        let victim = self
            .entries
            .iter()
            .map(|(key, value)| {
                let score = self.score_of(value, &ranges, now);
                (key.clone(), score, value.last_accessed())
            })
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            });

        if let Some((key, score, _)) = victim {
            if let Some(value) = self.entries.remove(&key) {
                self.ttl_extensions.remove(&key);
                self.evictions += 1;
                debug!(%key, score, "evicted lowest-scoring cache entry");
                if let Some(dispose) = &self.dispose {
                    dispose(&value, &key);
                }
            }
        }
    }

    fn score_of(&self, value: &V, ranges: &ScoreRanges, now: i64) -> f64 {
        let recency = ranges.recency_norm(value.last_accessed());
        let frequency = ranges.frequency_norm(value.access_count());
        let age = ranges.age_norm(now - value.created_at());

        self.config.recency_weight * recency
            + self.config.frequency_weight * frequency
            + self.config.weight_factor * value.weight()
            - self.config.age_decay_factor * age
    }
}

fn is_expired<V: CacheValue>(value: &V, now: i64) -> bool {
    value
        .ttl_ms()
        .is_some_and(|ttl| now >= value.created_at() + ttl)
}

struct ScoreRanges {
    min_accessed: i64,
    max_accessed: i64,
    max_count: u32,
    max_age: i64,
}

impl ScoreRanges {
    fn over<'a, V: CacheValue + 'a>(values: impl Iterator<Item = &'a V>, now: i64) -> Self {
        let mut ranges = Self {
            min_accessed: i64::MAX,
            max_accessed: i64::MIN,
            max_count: 1,
            max_age: 1,
        };
        for value in values {
            ranges.min_accessed = ranges.min_accessed.min(value.last_accessed());
            ranges.max_accessed = ranges.max_accessed.max(value.last_accessed());
            ranges.max_count = ranges.max_count.max(value.access_count());
            ranges.max_age = ranges.max_age.max(now - value.created_at());
        }
        ranges
    }

    fn recency_norm(&self, last_accessed: i64) -> f64 {
        let span = self.max_accessed - self.min_accessed;
        if span <= 0 {
            1.0
        } else {
            (last_accessed - self.min_accessed) as f64 / span as f64
        }
    }

    fn frequency_norm(&self, count: u32) -> f64 {
        f64::from(count) / f64::from(self.max_count)
    }

    fn age_norm(&self, age: i64) -> f64 {
        if self.max_age <= 0 {
            0.0
        } else {
            (age.max(0) as f64 / self.max_age as f64).min(1.0)
        }
    }
}
