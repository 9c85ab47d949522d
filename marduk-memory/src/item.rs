//! Memory items and their subsystem-specific content shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use marduk_core::error::{Error, Result};

/// The four memory subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Factual,
    Event,
    Concept,
    Workflow,
}

impl Subsystem {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Factual => "factual",
            Subsystem::Event => "event",
            Subsystem::Concept => "concept",
            Subsystem::Workflow => "workflow",
        }
    }

    /// Type discriminators a subsystem accepts.
    #[must_use]
    pub fn allowed_types(&self) -> &'static [&'static str] {
        match self {
            Subsystem::Factual => &["fact"],
            Subsystem::Event => &["event", "ai_interaction"],
            Subsystem::Concept => &["concept"],
            Subsystem::Workflow => &["workflow"],
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relationship edge on a concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptRelationship {
    #[serde(rename = "type")]
    pub relation_type: String,
    pub target: String,
    /// Edge strength in `[0, 1]`.
    pub strength: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bidirectional: bool,
}

/// Subsystem-specific content payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryContent {
    Fact {
        text: String,
    },
    Event {
        description: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actors: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
    Concept {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        relationships: Vec<ConceptRelationship>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        properties: Option<Value>,
    },
    Workflow {
        title: String,
        steps: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        prerequisites: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_duration_ms: Option<u64>,
    },
}

impl MemoryContent {
    /// The subsystem this content shape belongs to.
    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        match self {
            MemoryContent::Fact { .. } => Subsystem::Factual,
            MemoryContent::Event { .. } => Subsystem::Event,
            MemoryContent::Concept { .. } => Subsystem::Concept,
            MemoryContent::Workflow { .. } => Subsystem::Workflow,
        }
    }

    /// Case-insensitive substring match of `term` against the fields the
    /// subsystem declares searchable.
    #[must_use]
    pub fn matches_term(&self, term: &str, metadata: &ItemMetadata) -> bool {
        let term = term.to_lowercase();
        if term.is_empty() {
            return true;
        }
        let hit = |s: &str| s.to_lowercase().contains(&term);

        match self {
            MemoryContent::Fact { text } => hit(text) || metadata.tags.iter().any(|t| hit(t)),
            MemoryContent::Event {
                description,
                context,
                actors,
                ..
            } => {
                hit(description)
                    || context.as_deref().is_some_and(hit)
                    || actors.iter().any(|a| hit(a))
                    || metadata.tags.iter().any(|t| hit(t))
            }
            MemoryContent::Concept {
                name,
                description,
                relationships,
                ..
            } => {
                hit(name)
                    || description.as_deref().is_some_and(hit)
                    || relationships
                        .iter()
                        .any(|r| hit(&r.relation_type) || hit(&r.target))
                    || metadata.category.iter().any(|c| hit(c))
            }
            MemoryContent::Workflow {
                title, steps, tags, ..
            } => {
                hit(title)
                    || steps.iter().any(|s| hit(s))
                    || tags.iter().any(|t| hit(t))
                    || metadata.category.iter().any(|c| hit(c))
            }
        }
    }
}

/// Metadata attached to every item: well-known keys plus free-form extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    /// Access stamp in epoch milliseconds; monotonically increases within a
    /// process. Missing values sort before everything and are evicted first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_valence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u8>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ItemMetadata {
    /// Look up a numeric field by its wire name, well-known or extra.
    #[must_use]
    pub fn numeric_field(&self, name: &str) -> Option<f64> {
        match name {
            "confidence" => self.confidence,
            "importance" => self.importance,
            "emotionalValence" => self.emotional_valence,
            "successRate" => self.success_rate,
            "complexity" => self.complexity.map(f64::from),
            "lastAccessed" => self.last_accessed.map(|v| v as f64),
            _ => self.extra.get(name).and_then(Value::as_f64),
        }
    }

    /// Look up the string values of a field used for membership filters.
    #[must_use]
    pub fn string_values(&self, name: &str) -> Vec<String> {
        match name {
            "tags" => self.tags.clone(),
            "category" => self.category.clone(),
            "source" => self.source.clone().into_iter().collect(),
            _ => match self.extra.get(name) {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(values)) => values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            },
        }
    }
}

/// One record in a memory subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    /// Type discriminator from the owning subsystem's allowed set.
    #[serde(rename = "type")]
    pub item_type: String,
    pub content: MemoryContent,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl MemoryItem {
    /// Construct an item with an empty metadata record.
    #[must_use]
    pub fn new(id: impl Into<String>, item_type: impl Into<String>, content: MemoryContent) -> Self {
        Self {
            id: id.into(),
            item_type: item_type.into(),
            content,
            metadata: ItemMetadata::default(),
        }
    }

    /// Validate the item against a subsystem's rules.
    pub fn validate(&self, subsystem: Subsystem) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("item id must not be empty".to_string()));
        }
        if !subsystem.allowed_types().contains(&self.item_type.as_str()) {
            return Err(Error::Validation(format!(
                "type '{}' is not allowed in the {subsystem} subsystem",
                self.item_type
            )));
        }
        if self.content.subsystem() != subsystem {
            return Err(Error::Validation(format!(
                "content shape does not belong to the {subsystem} subsystem"
            )));
        }

        check_unit_range("confidence", self.metadata.confidence)?;
        check_unit_range("importance", self.metadata.importance)?;
        check_unit_range("successRate", self.metadata.success_rate)?;
        if let Some(valence) = self.metadata.emotional_valence {
            if !(-1.0..=1.0).contains(&valence) {
                return Err(Error::Validation(format!(
                    "emotionalValence out of [-1,1]: {valence}"
                )));
            }
        }
        if let Some(complexity) = self.metadata.complexity {
            if !(1..=5).contains(&complexity) {
                return Err(Error::Validation(format!(
                    "complexity out of 1..5: {complexity}"
                )));
            }
        }

        match &self.content {
            MemoryContent::Fact { text } => {
                if text.trim().is_empty() {
                    return Err(Error::Validation("fact content must not be empty".to_string()));
                }
                if self.metadata.confidence.is_none() {
                    return Err(Error::Validation(
                        "factual items require metadata.confidence".to_string(),
                    ));
                }
            }
            MemoryContent::Event { description, .. } => {
                if description.trim().is_empty() {
                    return Err(Error::Validation(
                        "event description must not be empty".to_string(),
                    ));
                }
            }
            MemoryContent::Concept { name, relationships, .. } => {
                if name.trim().is_empty() {
                    return Err(Error::Validation("concept name must not be empty".to_string()));
                }
                for rel in relationships {
                    if !(0.0..=1.0).contains(&rel.strength) {
                        return Err(Error::Validation(format!(
                            "relationship strength out of [0,1]: {}",
                            rel.strength
                        )));
                    }
                }
            }
            MemoryContent::Workflow { title, steps, .. } => {
                if title.trim().is_empty() {
                    return Err(Error::Validation(
                        "workflow title must not be empty".to_string(),
                    ));
                }
                if steps.is_empty() {
                    return Err(Error::Validation(
                        "workflow must declare at least one step".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Shallow patch applied by `update`: provided fields replace, metadata keys
/// merge over the existing record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemPatch {
    pub item_type: Option<String>,
    pub content: Option<MemoryContent>,
    pub metadata: Option<ItemMetadata>,
}

fn check_unit_range(name: &str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        if !(0.0..=1.0).contains(&v) {
            return Err(Error::Validation(format!("{name} out of [0,1]: {v}")));
        }
    }
    Ok(())
}
