//! Context validation: format, age, quality, redundancy, and contradiction
//! checks with idempotent fixers.
//!
//! The validator never raises; it reports issues and, when asked, returns a
//! repaired copy of its input. Applying fixes to already-fixed items yields
//! no new issues and no content changes.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use marduk_core::STALE_AFTER_MS;

use crate::cache::ContextCacheItem;
use crate::item::ContextItem;

/// Words that flip a statement's polarity.
const NEGATION_WORDS: &[&str] = &["not", "never", "cannot", "no", "nothing", "without"];

/// Quantifier pairs that oppose each other.
const OPPOSING_PAIRS: &[(&str, &str)] = &[
    ("all", "none"),
    ("always", "never"),
    ("everything", "nothing"),
    ("must", "must not"),
];

/// Validator thresholds.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Items older than this are outdated. Shares the 30-day staleness
    /// window with the source-manager recency filter.
    pub max_age_ms: i64,
    /// Confidence below this is low quality.
    pub min_confidence: f64,
    /// Content shorter than this is low quality.
    pub min_content_length: usize,
    /// Jaccard word similarity above this marks the later item redundant.
    pub redundancy_threshold: f64,
    /// Strict mode removes malformed and outdated entries instead of
    /// annotating them.
    pub strict: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_age_ms: STALE_AFTER_MS,
            min_confidence: 0.6,
            min_content_length: 10,
            redundancy_threshold: 0.85,
            strict: false,
        }
    }
}

/// The kind of problem found, not tied to any concrete type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Malformed,
    Outdated,
    LowQuality,
    Redundant,
    Contradictory,
}

/// One finding, addressed by item index or cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Item index (item validation) or cache key (cache validation).
    pub target: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub total_items_checked: usize,
    pub processed_in_ms: u64,
}

/// Validator over context items and cache entries.
#[derive(Debug, Clone, Default)]
pub struct ContextValidator {
    config: ValidatorConfig,
}

impl ContextValidator {
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate a set of context items.
    #[must_use]
    pub fn validate_items(&self, items: &[ContextItem]) -> ValidationReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut issues = Vec::new();

        for (index, item) in items.iter().enumerate() {
            let target = index.to_string();

            // Empty content is the degenerate too-short case, not a shape
            // problem; only missing source/type make an item malformed.
            if item.content.trim().len() < self.config.min_content_length {
                issues.push(issue(IssueKind::LowQuality, &target, "content is too short"));
            }
            if item.source.trim().is_empty() {
                issues.push(issue(IssueKind::Malformed, &target, "source is missing"));
            }
            if item.item_type.trim().is_empty() {
                issues.push(issue(IssueKind::Malformed, &target, "type is missing"));
            }

            if let Some(confidence) = item.metadata.confidence {
                if confidence < self.config.min_confidence {
                    issues.push(issue(
                        IssueKind::LowQuality,
                        &target,
                        &format!("confidence {confidence:.2} below threshold"),
                    ));
                }
            }

            if !is_marked_outdated(item) {
                if let Some(age) = item.age_ms(now) {
                    if age > self.config.max_age_ms {
                        issues.push(issue(IssueKind::Outdated, &target, "older than the staleness window"));
                    }
                }
            }
        }

        issues.extend(self.pairwise_issues(items));

        ValidationReport {
            is_valid: issues.is_empty(),
            total_items_checked: items.len(),
            processed_in_ms: started.elapsed().as_millis() as u64,
            issues,
        }
    }

    /// Validate items and return a repaired copy alongside the report of
    /// what was found.
    #[must_use]
    pub fn fix_items(&self, items: Vec<ContextItem>) -> (Vec<ContextItem>, ValidationReport) {
        let report = self.validate_items(&items);

        let redundant: HashSet<usize> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Redundant)
            .filter_map(|i| i.target.parse().ok())
            .collect();
        let malformed: HashSet<usize> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Malformed)
            .filter_map(|i| i.target.parse().ok())
            .collect();
        let outdated: HashSet<usize> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Outdated)
            .filter_map(|i| i.target.parse().ok())
            .collect();

        let mut fixed = Vec::with_capacity(items.len());
        for (index, mut item) in items.into_iter().enumerate() {
            if redundant.contains(&index) {
                continue;
            }
            if self.config.strict && (malformed.contains(&index) || outdated.contains(&index)) {
                continue;
            }

            if malformed.contains(&index) {
                item.content = item.content.trim().to_string();
                if item.source.trim().is_empty() {
                    item.source = "unknown".to_string();
                }
                if item.item_type.trim().is_empty() {
                    item.item_type = "unknown".to_string();
                }
            }
            if outdated.contains(&index) && !is_marked_outdated(&item) {
                item.content = format!("[OUTDATED] {}", item.content);
                item.metadata
                    .extra
                    .insert("outdated".to_string(), serde_json::Value::Bool(true));
            }
            fixed.push(item);
        }

        debug!(
            found = report.issues.len(),
            kept = fixed.len(),
            "applied context fixes"
        );
        (fixed, report)
    }

    /// Validate cache entries by key.
    #[must_use]
    pub fn validate_cache(&self, entries: &[(String, ContextCacheItem)]) -> ValidationReport {
        let started = Instant::now();
        let now = Utc::now().timestamp_millis();
        let mut issues = Vec::new();

        for (key, entry) in entries {
            if !entry.is_well_formed() {
                issues.push(issue(IssueKind::Malformed, key, "incoherent numeric fields"));
            }
            if entry.context.is_empty() || entry.context.iter().any(|line| line.trim().is_empty()) {
                issues.push(issue(IssueKind::Malformed, key, "empty context payload"));
            }
            if entry.relevance < self.config.min_confidence {
                issues.push(issue(
                    IssueKind::LowQuality,
                    key,
                    &format!("relevance {:.2} below threshold", entry.relevance),
                ));
            }
            let marked = entry
                .metadata
                .as_ref()
                .and_then(|m| m.get("outdated"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if !marked && now - entry.created_at > self.config.max_age_ms {
                issues.push(issue(IssueKind::Outdated, key, "entry is stale"));
            }
        }

        ValidationReport {
            is_valid: issues.is_empty(),
            total_items_checked: entries.len(),
            processed_in_ms: started.elapsed().as_millis() as u64,
            issues,
        }
    }

    /// Repair cache entries. Strict mode deletes flagged entries outright;
    /// otherwise numeric fields are repaired and stale entries are marked.
    #[must_use]
    pub fn fix_cache(
        &self,
        entries: Vec<(String, ContextCacheItem)>,
    ) -> (Vec<(String, ContextCacheItem)>, ValidationReport) {
        let report = self.validate_cache(&entries);

        let flagged: HashSet<&str> = report
            .issues
            .iter()
            .filter(|i| matches!(i.kind, IssueKind::Malformed | IssueKind::Outdated))
            .map(|i| i.target.as_str())
            .collect();
        let outdated: HashSet<&str> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Outdated)
            .map(|i| i.target.as_str())
            .collect();

        let mut fixed = Vec::with_capacity(entries.len());
        for (key, mut entry) in entries {
            if self.config.strict && flagged.contains(key.as_str()) {
                continue;
            }

            entry.context.retain(|line| !line.trim().is_empty());
            if entry.context.is_empty() {
                // Nothing left to serve from this entry.
                continue;
            }
            entry.access_count = entry.access_count.max(1);
            entry.last_accessed = entry.last_accessed.max(entry.created_at);
            entry.relevance = entry.relevance.clamp(0.0, 1.0);
            if outdated.contains(key.as_str()) {
                entry
                    .metadata
                    .get_or_insert_with(serde_json::Map::new)
                    .insert("outdated".to_string(), serde_json::Value::Bool(true));
            }
            fixed.push((key, entry));
        }
        (fixed, report)
    }

    fn pairwise_issues(&self, items: &[ContextItem]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let word_sets: Vec<HashSet<String>> =
            items.iter().map(|item| word_set(&item.content)).collect();
        let mut already_redundant = HashSet::new();

        for later in 1..items.len() {
            for earlier in 0..later {
                let similarity = jaccard(&word_sets[earlier], &word_sets[later]);

                // A contradictory pair is different in meaning, never a
                // duplicate, so that check wins.
                if items[earlier].item_type == items[later].item_type
                    && self.contradicts(&items[earlier], &items[later], similarity)
                {
                    issues.push(ValidationIssue {
                        kind: IssueKind::Contradictory,
                        target: later.to_string(),
                        detail: format!("conflicts with item {earlier}"),
                        related: Some(earlier.to_string()),
                    });
                    continue;
                }

                if similarity > self.config.redundancy_threshold
                    && !already_redundant.contains(&later)
                {
                    issues.push(ValidationIssue {
                        kind: IssueKind::Redundant,
                        target: later.to_string(),
                        detail: format!("duplicates item {earlier} at {similarity:.2}"),
                        related: Some(earlier.to_string()),
                    });
                    already_redundant.insert(later);
                }
            }
        }
        issues
    }

    fn contradicts(&self, a: &ContextItem, b: &ContextItem, similarity: f64) -> bool {
        let text_a = a.content.to_lowercase();
        let text_b = b.content.to_lowercase();

        let negated_a = NEGATION_WORDS.iter().any(|w| has_word(&text_a, w));
        let negated_b = NEGATION_WORDS.iter().any(|w| has_word(&text_b, w));
        if negated_a != negated_b && similarity >= 0.5 {
            return true;
        }

        if similarity >= 0.3 {
            for (positive, negative) in OPPOSING_PAIRS {
                let a_pos = has_phrase(&text_a, positive) && !has_phrase(&text_a, negative);
                let b_pos = has_phrase(&text_b, positive) && !has_phrase(&text_b, negative);
                let a_neg = has_phrase(&text_a, negative);
                let b_neg = has_phrase(&text_b, negative);
                if (a_pos && b_neg) || (a_neg && b_pos) {
                    return true;
                }
            }
        }
        false
    }
}

fn issue(kind: IssueKind, target: &str, detail: &str) -> ValidationIssue {
    ValidationIssue {
        kind,
        target: target.to_string(),
        detail: detail.to_string(),
        related: None,
    }
}

fn is_marked_outdated(item: &ContextItem) -> bool {
    item.content.starts_with("[OUTDATED]")
        || item
            .metadata
            .extra
            .get("outdated")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn has_word(text: &str, word: &str) -> bool {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .any(|w| w == word)
}

fn has_phrase(text: &str, phrase: &str) -> bool {
    if phrase.contains(' ') {
        text.contains(phrase)
    } else {
        has_word(text, phrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(content: &str) -> ContextItem {
        ContextItem::new(content, "internal:documents", "document")
    }

    #[test]
    fn test_clean_items_pass() {
        let validator = ContextValidator::default();
        let report = validator.validate_items(&[
            item("The sky is blue today"),
            item("Oceans are deep and cold"),
        ]);
        assert!(report.is_valid);
        assert_eq!(report.total_items_checked, 2);
    }

    #[test]
    fn test_missing_source_is_malformed_thin_content_is_low_quality() {
        let validator = ContextValidator::default();
        let mut missing_source = item("long enough content here");
        missing_source.source = String::new();

        let report = validator.validate_items(&[item(""), item("short"), missing_source]);

        // Empty and too-short content are both quality findings on items 0
        // and 1; only the missing source on item 2 is a shape problem.
        let low_quality: Vec<&str> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::LowQuality)
            .map(|i| i.target.as_str())
            .collect();
        assert_eq!(low_quality, vec!["0", "1"]);

        let malformed: Vec<&str> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Malformed)
            .map(|i| i.target.as_str())
            .collect();
        assert_eq!(malformed, vec!["2"]);
    }

    #[test]
    fn test_low_confidence_flagged() {
        let validator = ContextValidator::default();
        let weak = item("a perfectly fine sentence").with_confidence(0.2);
        let report = validator.validate_items(&[weak]);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, IssueKind::LowQuality);
    }

    #[test]
    fn test_outdated_flagged_and_fixed() {
        let validator = ContextValidator::default();
        let old = item("an observation from long ago")
            .with_timestamp(Utc::now() - Duration::days(45));

        let report = validator.validate_items(&[old.clone()]);
        assert_eq!(report.issues[0].kind, IssueKind::Outdated);

        let (fixed, _) = validator.fix_items(vec![old]);
        assert!(fixed[0].content.starts_with("[OUTDATED] "));
        assert_eq!(
            fixed[0].metadata.extra.get("outdated"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn test_redundancy_flags_later_item_and_fix_removes_it() {
        let validator = ContextValidator::default();
        let items = vec![
            item("The sky is blue"),
            item("The sky is blue."),
            item("Oceans are deep"),
        ];

        let report = validator.validate_items(&items);
        let redundant: Vec<&ValidationIssue> = report
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Redundant)
            .collect();
        assert_eq!(redundant.len(), 1);
        assert_eq!(redundant[0].target, "1");
        assert_eq!(redundant[0].related.as_deref(), Some("0"));

        let (fixed, _) = validator.fix_items(items);
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed[0].content, "The sky is blue");
        assert_eq!(fixed[1].content, "Oceans are deep");
    }

    #[test]
    fn test_contradiction_by_negation() {
        let validator = ContextValidator::default();
        let report = validator.validate_items(&[
            item("the deploy pipeline is safe to run"),
            item("the deploy pipeline is not safe to run"),
        ]);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Contradictory));
    }

    #[test]
    fn test_contradiction_by_opposing_quantifiers() {
        let validator = ContextValidator::default();
        let report = validator.validate_items(&[
            item("all services emit structured logs"),
            item("none of the services emit structured logs"),
        ]);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Contradictory));
    }

    #[test]
    fn test_different_types_do_not_contradict() {
        let validator = ContextValidator::default();
        let mut a = item("the cache is always warm at startup");
        a.item_type = "document".to_string();
        let mut b = item("the cache is never warm at startup");
        b.item_type = "activity".to_string();
        let report = validator.validate_items(&[a, b]);
        assert!(!report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Contradictory));
    }

    #[test]
    fn test_fix_is_idempotent() {
        let validator = ContextValidator::default();
        let mut broken = item("stale but useful observation");
        broken.source = String::new();
        broken.metadata.timestamp = Some(Utc::now() - Duration::days(60));

        let (fixed_once, _) = validator.fix_items(vec![broken]);
        let (fixed_twice, second_report) = validator.fix_items(fixed_once.clone());

        assert_eq!(fixed_once, fixed_twice);
        assert!(!second_report
            .issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::Malformed | IssueKind::Outdated)));
    }

    #[test]
    fn test_strict_mode_removes_instead_of_annotating() {
        let validator = ContextValidator::new(ValidatorConfig {
            strict: true,
            ..Default::default()
        });
        let old = item("a stale fact nobody refreshed")
            .with_timestamp(Utc::now() - Duration::days(60));
        let mut unsourced = item("a perfectly good observation");
        unsourced.source = String::new();

        let (fixed, _) = validator.fix_items(vec![old, unsourced, item("healthy recent item")]);
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].content, "healthy recent item");
    }

    #[test]
    fn test_cache_validation_and_fix() {
        let validator = ContextValidator::default();
        let good = ContextCacheItem::new(vec!["useful line".to_string()], 0.9);
        let mut broken = ContextCacheItem::new(vec!["line".to_string()], 0.9);
        broken.access_count = 0;
        let mut stale = ContextCacheItem::new(vec!["old line".to_string()], 0.9);
        stale.created_at -= STALE_AFTER_MS + 1_000;
        stale.last_accessed = stale.created_at;

        let entries = vec![
            ("good".to_string(), good),
            ("broken".to_string(), broken),
            ("stale".to_string(), stale),
        ];
        let report = validator.validate_cache(&entries);
        assert!(!report.is_valid);

        let (fixed, _) = validator.fix_cache(entries);
        assert_eq!(fixed.len(), 3);
        let broken = fixed.iter().find(|(k, _)| k == "broken").unwrap();
        assert!(broken.1.access_count >= 1);
        let stale = fixed.iter().find(|(k, _)| k == "stale").unwrap();
        assert_eq!(
            stale.1.metadata.as_ref().unwrap().get("outdated"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn test_strict_cache_fix_deletes_entries() {
        let validator = ContextValidator::new(ValidatorConfig {
            strict: true,
            ..Default::default()
        });
        let mut stale = ContextCacheItem::new(vec!["old".to_string()], 0.9);
        stale.created_at -= STALE_AFTER_MS + 1_000;
        stale.last_accessed = stale.created_at;

        let entries = vec![
            ("keep".to_string(), ContextCacheItem::new(vec!["fresh".to_string()], 0.9)),
            ("drop".to_string(), stale),
        ];
        let (fixed, _) = validator.fix_cache(entries);
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].0, "keep");
    }
}
