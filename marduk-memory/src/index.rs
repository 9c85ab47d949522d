//! Field-value multimaps used to pre-filter query candidates.

use std::collections::{BTreeSet, HashMap};

use crate::item::MemoryItem;

/// Index over a declared set of fields.
///
/// Each field maps its observed values to the ids carrying that value. The
/// `type` field indexes the item's discriminator; other fields index the
/// metadata string values of the same name.
#[derive(Debug, Default)]
pub struct FieldIndex {
    fields: Vec<String>,
    entries: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl FieldIndex {
    /// Create an index over the given fields. `type` is always indexed.
    #[must_use]
    pub fn new(fields: &[String]) -> Self {
        let mut all = vec!["type".to_string()];
        for field in fields {
            if field != "type" && !all.contains(field) {
                all.push(field.clone());
            }
        }
        Self {
            fields: all,
            entries: HashMap::new(),
        }
    }

    /// Whether a field participates in the index.
    #[must_use]
    pub fn covers(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    fn values_for(field: &str, item: &MemoryItem) -> Vec<String> {
        if field == "type" {
            vec![item.item_type.clone()]
        } else {
            item.metadata.string_values(field)
        }
    }

    /// Add an item's field values to the index.
    pub fn insert(&mut self, item: &MemoryItem) {
        for field in &self.fields {
            for value in Self::values_for(field, item) {
                self.entries
                    .entry(field.clone())
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(item.id.clone());
            }
        }
    }

    /// Remove an item's field values from the index.
    pub fn remove(&mut self, item: &MemoryItem) {
        for field in &self.fields {
            let Some(by_value) = self.entries.get_mut(field) else {
                continue;
            };
            for value in Self::values_for(field, item) {
                if let Some(ids) = by_value.get_mut(&value) {
                    ids.remove(&item.id);
                    if ids.is_empty() {
                        by_value.remove(&value);
                    }
                }
            }
        }
    }

    /// Ids carrying `value` in `field`, or an empty set.
    #[must_use]
    pub fn lookup(&self, field: &str, value: &str) -> BTreeSet<String> {
        self.entries
            .get(field)
            .and_then(|by_value| by_value.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Intersect the candidate sets for `(field, value)` pairs, starting
    /// from the first. Returns `None` when no pair touches the index.
    #[must_use]
    pub fn candidates(&self, lookups: &[(&str, &str)]) -> Option<BTreeSet<String>> {
        let mut result: Option<BTreeSet<String>> = None;
        for (field, value) in lookups {
            if !self.covers(field) {
                continue;
            }
            let ids = self.lookup(field, value);
            result = Some(match result {
                None => ids,
                Some(current) => current.intersection(&ids).cloned().collect(),
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        result
    }
}
