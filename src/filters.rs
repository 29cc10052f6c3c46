//! Filter engine
//!
//! Per-source drop rules: if any enabled rule's field, resolved against the
//! record's extracted data, stringifies to exactly the rule's value, the
//! record is dropped before it ever reaches a queue. Evaluation is
//! side-effect free; rule management persists to `filters.json`.

use crate::context::{load_json_or_default, save_json_atomic, AppContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// A single drop-by-equality rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Dotted field path resolved against the extracted record data
    pub field: String,
    /// Records whose field stringifies to exactly this value are dropped
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

/// Owns the per-source filter rules and their on-disk representation.
pub struct FilterStore {
    filters: HashMap<String, Vec<FilterRule>>,
    path: PathBuf,
}

impl FilterStore {
    /// Load the store from the context's filter file.
    pub fn load(ctx: &AppContext) -> anyhow::Result<Self> {
        let path = ctx.filter_file();
        let filters: HashMap<String, Vec<FilterRule>> = load_json_or_default(&path)?;
        if !filters.is_empty() {
            info!("Loaded filter rules for {} source(s)", filters.len());
        }
        Ok(Self { filters, path })
    }

    /// Rules configured for a source, in creation order.
    pub fn rules_for(&self, source_id: &str) -> &[FilterRule] {
        self.filters.get(source_id).map_or(&[], Vec::as_slice)
    }

    /// Add a rule, or update the value of the existing rule for the same
    /// field. At most one rule exists per (source, field).
    pub fn add_rule(&mut self, source_id: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let rules = self.filters.entry(source_id.to_string()).or_default();
        if let Some(existing) = rules.iter_mut().find(|r| r.field == field) {
            existing.value = value.to_string();
            info!("Updated filter for source {source_id}, field {field}");
        } else {
            rules.push(FilterRule {
                field: field.to_string(),
                value: value.to_string(),
                enabled: true,
                created_at: Utc::now(),
            });
            info!("Added filter for source {source_id}, field {field}");
        }
        self.persist()
    }

    /// Remove the rule for a field. Returns false when no such rule exists.
    pub fn remove_rule(&mut self, source_id: &str, field: &str) -> anyhow::Result<bool> {
        let Some(rules) = self.filters.get_mut(source_id) else {
            return Ok(false);
        };
        let before = rules.len();
        rules.retain(|r| r.field != field);
        if rules.len() == before {
            return Ok(false);
        }
        if rules.is_empty() {
            self.filters.remove(source_id);
        }
        info!("Removed filter for source {source_id}, field {field}");
        self.persist()?;
        Ok(true)
    }

    /// Flip a rule's enabled flag. Returns the new state, or None when the
    /// rule does not exist.
    pub fn toggle_rule(&mut self, source_id: &str, field: &str) -> anyhow::Result<Option<bool>> {
        let Some(rule) = self
            .filters
            .get_mut(source_id)
            .and_then(|rules| rules.iter_mut().find(|r| r.field == field))
        else {
            return Ok(None);
        };
        rule.enabled = !rule.enabled;
        let enabled = rule.enabled;
        self.persist()?;
        Ok(Some(enabled))
    }

    /// Drop every rule for a source (used when the source is deleted).
    pub fn clear_source(&mut self, source_id: &str) -> anyhow::Result<()> {
        if self.filters.remove(source_id).is_some() {
            info!("Cleared all filters for source {source_id}");
            self.persist()?;
        }
        Ok(())
    }

    /// Whether a record passes the source's filters (true = keep).
    pub fn passes(&self, record: &str, source_id: &str) -> bool {
        let rules = self.rules_for(source_id);
        if rules.iter().all(|r| !r.enabled) {
            return true;
        }

        let data = extract_record_data(record);
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if let Some(value) = resolve_path(&data, &rule.field) {
                if stringify(value) == rule.value {
                    debug!(
                        "Dropped record: field {} matches value {}",
                        rule.field, rule.value
                    );
                    return false;
                }
            }
        }
        true
    }

    fn persist(&self) -> anyhow::Result<()> {
        save_json_atomic(&self.path, &self.filters).inspect_err(|e| {
            error!("Failed to save filter rules: {e:#}");
        })
    }
}

/// Flatten a record for rule evaluation: JSON object when it parses, else a
/// shallow map built from whitespace-split `key=value` tokens.
fn extract_record_data(record: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(record) {
        if value.is_object() {
            return value;
        }
    }

    let mut map = Map::new();
    for token in record.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if !key.is_empty() {
                map.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
    }
    Value::Object(map)
}

/// Resolve a dotted field path against a JSON value.
pub fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Stringify a resolved value the way rule values are written: bare strings,
/// JSON rendering for everything else.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn default_true() -> bool {
    true
}
