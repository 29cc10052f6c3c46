//! Aggregation engine
//!
//! Owns the per-source templates and aggregation policies (persisted
//! together in `policy.json`) and collapses batches into equivalence
//! classes over a policy's field tuple. A policy may only exist while its
//! source has a template; deleting the template deletes the policy.

use crate::context::{load_json_or_default, save_json_atomic, AppContext};
use crate::filters::{resolve_path, stringify};
use crate::template::{self, FieldMap};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info};

/// Field map captured from a source's first observed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// The original record the fields were extracted from
    pub log: String,
    pub fields: FieldMap,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

/// Per-source aggregation policy: the field tuple records are collapsed over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// Dotted field paths forming the group key, in order
    pub fields: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: HashMap<String, AggregationPolicy>,
    #[serde(default)]
    templates: HashMap<String, Template>,
}

/// Owns templates and aggregation policies and their on-disk representation.
pub struct PolicyStore {
    policies: HashMap<String, AggregationPolicy>,
    templates: HashMap<String, Template>,
    path: PathBuf,
}

impl PolicyStore {
    /// Load the store from the context's policy file.
    pub fn load(ctx: &AppContext) -> Result<Self> {
        let path = ctx.policy_file();
        let file: PolicyFile = load_json_or_default(&path)?;
        if !file.policies.is_empty() {
            info!("Loaded {} aggregation policy(ies)", file.policies.len());
        }
        Ok(Self {
            policies: file.policies,
            templates: file.templates,
            path,
        })
    }

    /// Whether a template has been captured for the source.
    pub fn has_template(&self, source_id: &str) -> bool {
        self.templates.contains_key(source_id)
    }

    /// The captured template for a source, if any.
    pub fn template(&self, source_id: &str) -> Option<&Template> {
        self.templates.get(source_id)
    }

    /// Capture a template from a record. A template is stored at most once
    /// per source; returns false when one already exists.
    pub fn store_template(&mut self, source_id: &str, record: &str) -> Result<bool> {
        if self.templates.contains_key(source_id) {
            return Ok(false);
        }

        let fields = template::extract_fields(record);
        self.templates.insert(
            source_id.to_string(),
            Template {
                log: record.to_string(),
                fields,
                timestamp: Utc::now(),
            },
        );
        self.persist()?;
        info!("Captured log template for source {source_id}");
        Ok(true)
    }

    /// Delete a source's template along with any dependent policy.
    pub fn delete_template(&mut self, source_id: &str) -> Result<bool> {
        if self.templates.remove(source_id).is_none() {
            return Ok(false);
        }
        if self.policies.remove(source_id).is_some() {
            info!("Also deleted dependent aggregation policy for source {source_id}");
        }
        self.persist()?;
        info!("Deleted template for source {source_id}");
        Ok(true)
    }

    /// The policy for a source, if any.
    pub fn policy(&self, source_id: &str) -> Option<&AggregationPolicy> {
        self.policies.get(source_id)
    }

    /// Create or replace the policy for a source. Requires a captured
    /// template and a non-empty field tuple.
    pub fn create_policy(&mut self, source_id: &str, fields: Vec<String>) -> Result<()> {
        if !self.templates.contains_key(source_id) {
            bail!("no template captured for source {source_id}");
        }
        if fields.is_empty() {
            bail!("aggregation policy requires at least one field");
        }

        self.policies.insert(
            source_id.to_string(),
            AggregationPolicy {
                fields,
                enabled: true,
                created: Utc::now(),
            },
        );
        self.persist()?;
        info!("Created aggregation policy for source {source_id}");
        Ok(())
    }

    /// Enable or disable a source's policy. Returns false when none exists.
    pub fn set_policy_enabled(&mut self, source_id: &str, enabled: bool) -> Result<bool> {
        let Some(policy) = self.policies.get_mut(source_id) else {
            return Ok(false);
        };
        policy.enabled = enabled;
        self.persist()?;
        Ok(true)
    }

    /// Delete a source's policy. Returns false when none exists.
    pub fn delete_policy(&mut self, source_id: &str) -> Result<bool> {
        if self.policies.remove(source_id).is_none() {
            return Ok(false);
        }
        self.persist()?;
        info!("Deleted aggregation policy for source {source_id}");
        Ok(true)
    }

    /// Collapse a batch into one record per group-key equivalence class.
    ///
    /// Groups are emitted in first-occurrence order, followed by the
    /// records whose key could not be computed. Representatives of groups
    /// larger than one are augmented with aggregation metadata.
    pub fn aggregate_batch(&self, batch: Vec<String>, source_id: &str) -> Vec<String> {
        let Some(policy) = self.policies.get(source_id).filter(|p| p.enabled) else {
            return batch;
        };
        if policy.fields.is_empty() {
            return batch;
        }

        let input_len = batch.len();
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Group> = HashMap::new();
        let mut non_aggregated: Vec<String> = Vec::new();

        for record in batch {
            match group_key(&record, &policy.fields) {
                Some((key, parsed)) => {
                    let now = Utc::now();
                    if let Some(group) = groups.get_mut(&key) {
                        group.count += 1;
                        group.last_seen = now;
                    } else {
                        order.push(key.clone());
                        groups.insert(
                            key,
                            Group {
                                count: 1,
                                first_seen: now,
                                last_seen: now,
                                representative: record,
                                parsed,
                            },
                        );
                    }
                }
                None => non_aggregated.push(record),
            }
        }

        let mut collapsed = Vec::with_capacity(order.len() + non_aggregated.len());
        for key in order {
            let group = groups.remove(&key).expect("group recorded in order");
            collapsed.push(group.emit());
        }
        collapsed.extend(non_aggregated);

        if collapsed.len() != input_len {
            info!(
                "Aggregation reduced {input_len} records to {} for source {source_id}",
                collapsed.len()
            );
        }
        collapsed
    }

    fn persist(&self) -> Result<()> {
        let file = PolicyFile {
            policies: self.policies.clone(),
            templates: self.templates.clone(),
        };
        save_json_atomic(&self.path, &file).inspect_err(|e| {
            error!("Failed to save aggregation policies: {e:#}");
        })
    }
}

struct Group {
    count: usize,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    representative: String,
    parsed: Option<Map<String, Value>>,
}

impl Group {
    /// The record emitted for this group: the representative, augmented
    /// with aggregation metadata when more than one record collapsed.
    fn emit(self) -> String {
        if self.count == 1 {
            return self.representative;
        }

        if let Some(mut object) = self.parsed {
            object.insert(
                "is_aggregated".to_string(),
                Value::String("yes".to_string()),
            );
            object.insert(
                "first_log_time".to_string(),
                Value::from(self.first_seen.timestamp()),
            );
            object.insert(
                "last_log_time".to_string(),
                Value::from(self.last_seen.timestamp()),
            );
            object.insert(
                "total_logs_aggregated".to_string(),
                Value::from(self.count),
            );
            serde_json::to_string(&Value::Object(object))
                .unwrap_or(self.representative)
        } else {
            format!("{} [Aggregated: {} logs]", self.representative, self.count)
        }
    }
}

/// Compute the group key for a record: resolve each policy field against
/// the record's data (a missing field resolves to the literal "None") and
/// digest the joined tuple. Returns None only when key computation itself
/// fails, which routes the record verbatim to the non-aggregated tail.
fn group_key(record: &str, fields: &[String]) -> Option<(String, Option<Map<String, Value>>)> {
    let (data, parsed) = match serde_json::from_str::<Value>(record) {
        Ok(Value::Object(map)) => (Value::Object(map.clone()), Some(map)),
        // Scalars and arrays carry no addressable fields; every policy
        // field resolves to "None" and such records still group together
        Ok(other) => (other, None),
        Err(_) => {
            let mut map = Map::new();
            for (key, info) in template::extract_fields(record) {
                map.insert(key, Value::String(info.example));
            }
            (Value::Object(map), None)
        }
    };

    let resolved: Vec<String> = fields
        .iter()
        .map(|field| {
            resolve_path(&data, field)
                .map(stringify)
                .unwrap_or_else(|| "None".to_string())
        })
        .collect();

    let digest = md5::compute(resolved.join("|").as_bytes());
    Some((format!("{digest:x}"), parsed))
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> PolicyStore {
        let ctx = AppContext::new(dir.join("data"), dir.join("logs")).unwrap();
        PolicyStore::load(&ctx).unwrap()
    }

    fn store_with_policy(dir: &std::path::Path, fields: &[&str]) -> PolicyStore {
        let mut policies = store(dir);
        policies
            .store_template("src-1", r#"{"user":"a","action":"x"}"#)
            .unwrap();
        policies
            .create_policy("src-1", fields.iter().map(|f| f.to_string()).collect())
            .unwrap();
        policies
    }

    #[test]
    fn test_template_captured_at_most_once() {
        let tmp = tempdir().unwrap();
        let mut policies = store(tmp.path());

        assert!(policies.store_template("src-1", "user=a").unwrap());
        assert!(!policies.store_template("src-1", "user=b").unwrap());

        let template = policies.template("src-1").unwrap();
        assert_eq!(template.log, "user=a");
        assert_eq!(template.fields["user"].example, "a");
    }

    #[test]
    fn test_delete_template_deletes_dependent_policy() {
        let tmp = tempdir().unwrap();
        let mut policies = store_with_policy(tmp.path(), &["user"]);

        assert!(policies.delete_template("src-1").unwrap());
        assert!(policies.template("src-1").is_none());
        assert!(policies.policy("src-1").is_none());

        // A fresh record captures a new template afterwards
        assert!(policies.store_template("src-1", "user=c").unwrap());
    }

    #[test]
    fn test_policy_requires_template_and_fields() {
        let tmp = tempdir().unwrap();
        let mut policies = store(tmp.path());

        assert!(policies
            .create_policy("src-1", vec!["user".to_string()])
            .is_err());

        policies.store_template("src-1", "user=a").unwrap();
        assert!(policies.create_policy("src-1", vec![]).is_err());
        assert!(policies
            .create_policy("src-1", vec!["user".to_string()])
            .is_ok());
    }

    #[test]
    fn test_batch_unchanged_without_enabled_policy() {
        let tmp = tempdir().unwrap();
        let mut policies = store_with_policy(tmp.path(), &["user"]);

        let batch = vec!["a".to_string(), "a".to_string()];
        assert_eq!(
            policies.aggregate_batch(batch.clone(), "src-2"),
            batch.clone()
        );

        policies.set_policy_enabled("src-1", false).unwrap();
        assert_eq!(policies.aggregate_batch(batch.clone(), "src-1"), batch);
    }

    #[test]
    fn test_json_groups_collapse_with_metadata() {
        let tmp = tempdir().unwrap();
        let policies = store_with_policy(tmp.path(), &["user", "action"]);

        let batch = vec![
            r#"{"user":"a","action":"x"}"#.to_string(),
            r#"{"user":"a","action":"x"}"#.to_string(),
            r#"{"user":"b","action":"x"}"#.to_string(),
        ];
        let out = policies.aggregate_batch(batch, "src-1");
        assert_eq!(out.len(), 2);

        let first: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(first["user"], "a");
        assert_eq!(first["is_aggregated"], "yes");
        assert_eq!(first["total_logs_aggregated"], 2);
        assert!(first["first_log_time"].is_i64());
        assert!(first["last_log_time"].is_i64());

        // The singleton group is emitted unchanged
        assert_eq!(out[1], r#"{"user":"b","action":"x"}"#);
    }

    #[test]
    fn test_string_records_gain_suffix() {
        let tmp = tempdir().unwrap();
        let policies = store_with_policy(tmp.path(), &["user"]);

        let batch = vec![
            "user=a action=x".to_string(),
            "user=a action=y".to_string(),
            "user=b action=x".to_string(),
        ];
        let out = policies.aggregate_batch(batch, "src-1");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "user=a action=x [Aggregated: 2 logs]");
        assert_eq!(out[1], "user=b action=x");
    }

    #[test]
    fn test_missing_fields_resolve_to_none_literal() {
        let tmp = tempdir().unwrap();
        let policies = store_with_policy(tmp.path(), &["user", "region"]);

        // Both records resolve to (a, None) and collapse together
        let batch = vec![
            r#"{"user":"a"}"#.to_string(),
            r#"{"user":"a","other":1}"#.to_string(),
        ];
        let out = policies.aggregate_batch(batch, "src-1");
        assert_eq!(out.len(), 1);

        let merged: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(merged["total_logs_aggregated"], 2);
    }

    #[test]
    fn test_non_object_json_records_group_on_none_fields() {
        let tmp = tempdir().unwrap();
        let policies = store_with_policy(tmp.path(), &["user"]);

        // Scalars and arrays resolve every policy field to "None", so they
        // collapse into one group behind the first such record
        let batch = vec![
            r#"{"user":"a"}"#.to_string(),
            "[1,2,3]".to_string(),
            r#"{"user":"a"}"#.to_string(),
            "42".to_string(),
        ];
        let out = policies.aggregate_batch(batch, "src-1");
        assert_eq!(out.len(), 2);

        let merged: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(merged["user"], "a");
        assert_eq!(merged["total_logs_aggregated"], 2);

        assert_eq!(out[1], "[1,2,3] [Aggregated: 2 logs]");
    }

    #[test]
    fn test_group_sizes_are_preserved() {
        let tmp = tempdir().unwrap();
        let policies = store_with_policy(tmp.path(), &["user"]);

        let mut batch = Vec::new();
        for _ in 0..5 {
            batch.push(r#"{"user":"a"}"#.to_string());
        }
        for _ in 0..3 {
            batch.push(r#"{"user":"b"}"#.to_string());
        }
        batch.push(r#"{"user":"c"}"#.to_string());

        let out = policies.aggregate_batch(batch, "src-1");
        assert_eq!(out.len(), 3);

        let sizes: Vec<i64> = out
            .iter()
            .map(|r| {
                let v: Value = serde_json::from_str(r).unwrap();
                v.get("total_logs_aggregated").and_then(Value::as_i64).unwrap_or(1)
            })
            .collect();
        assert_eq!(sizes, vec![5, 3, 1]);
    }

    #[test]
    fn test_persistence_round_trip() {
        let tmp = tempdir().unwrap();
        let ctx = AppContext::new(tmp.path().join("data"), tmp.path().join("logs")).unwrap();

        {
            let mut policies = PolicyStore::load(&ctx).unwrap();
            policies.store_template("src-1", "user=a").unwrap();
            policies
                .create_policy("src-1", vec!["user".to_string()])
                .unwrap();
        }

        let reloaded = PolicyStore::load(&ctx).unwrap();
        assert!(reloaded.has_template("src-1"));
        assert_eq!(reloaded.policy("src-1").unwrap().fields, vec!["user"]);

        // On-disk schema keeps the two top-level sections
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(ctx.policy_file()).unwrap()).unwrap();
        assert!(raw.get("policies").is_some());
        assert!(raw.get("templates").is_some());
    }
}
