//! Template extraction engine
//!
//! Infers a descriptive field map from a single log record. The map is
//! metadata only: it names the fields a record carries, with a type guess
//! and a display-ready example per field, and never mutates the record.
//! Extraction is deterministic for a given input.
//!
//! Detection order:
//! 1. JSON (or an already-structured mapping), flattened with dotted paths
//! 2. Synthetic fields pulled from raw text: timestamp, log level, IP
//!    address, message
//! 3. Key/value pairs under the highest-count delimiter
//! 4. Multi-line `key: value` blocks
//! 5. Delimited tables (first line as header)
//! 6. Whitespace tokens as `field_N`

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Descriptive metadata for one extracted field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Inferred type name (int, float, bool, string, timestamp, level, ip, list<..>)
    #[serde(rename = "type")]
    pub field_type: String,
    /// Stringified value as observed
    pub example: String,
    /// Display-ready rendering (thousands-separated ints, two-decimal floats)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    /// Character or element count, for strings and lists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

/// Extracted field map, keyed by dotted field path.
///
/// A BTreeMap keeps iteration order stable so repeated extraction of the
/// same record yields identical output.
pub type FieldMap = BTreeMap<String, FieldInfo>;

/// Delimiters ranked when choosing the primary key/value format
const PAIR_DELIMITERS: [&str; 6] = [" ", ",", ";", "|", "\t", " = "];
/// Key/value separators tried within each delimiter split
const PAIR_SEPARATORS: [&str; 5] = ["=", ":", "->", "=>", " - "];
/// Delimiters considered for table mode
const TABLE_DELIMITERS: [&str; 4] = ["\t", ";", ",", "|"];

/// Extract a field map from a raw record.
pub fn extract_fields(record: &str) -> FieldMap {
    if let Ok(value) = serde_json::from_str::<Value>(record) {
        if value.is_object() {
            return extract_value_fields(&value);
        }
    }

    let mut fields = FieldMap::new();
    capture_synthetic_fields(record, &mut fields);

    if extract_pairs(record, &mut fields) > 0 {
        return fields;
    }
    if extract_multiline_pairs(record, &mut fields) > 0 {
        return fields;
    }
    if extract_quoted_pairs(record, &mut fields) > 0 {
        return fields;
    }
    if extract_table(record, &mut fields) > 0 {
        return fields;
    }
    extract_tokens(record, &mut fields);
    fields
}

/// Extract a field map from an already-structured value.
pub fn extract_value_fields(value: &Value) -> FieldMap {
    let mut fields = FieldMap::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            flatten_value(key, child, &mut fields);
        }
    }
    fields
}

fn flatten_value(path: &str, value: &Value, fields: &mut FieldMap) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_value(&format!("{path}.{key}"), child, fields);
            }
        }
        Value::Array(items) => {
            let info = describe_list(items);
            fields.insert(path.to_string(), info);
        }
        Value::String(s) => {
            fields.insert(
                path.to_string(),
                FieldInfo {
                    field_type: "string".to_string(),
                    example: truncate_example(s),
                    formatted: None,
                    length: Some(s.chars().count()),
                },
            );
        }
        Value::Number(n) => {
            let info = if let Some(i) = n.as_i64() {
                FieldInfo {
                    field_type: "int".to_string(),
                    example: i.to_string(),
                    formatted: Some(group_thousands(i)),
                    length: None,
                }
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                FieldInfo {
                    field_type: "float".to_string(),
                    example: n.to_string(),
                    formatted: Some(format!("{f:.2}")),
                    length: None,
                }
            };
            fields.insert(path.to_string(), info);
        }
        Value::Bool(b) => {
            fields.insert(
                path.to_string(),
                FieldInfo {
                    field_type: "bool".to_string(),
                    example: b.to_string(),
                    formatted: None,
                    length: None,
                },
            );
        }
        Value::Null => {
            fields.insert(
                path.to_string(),
                FieldInfo {
                    field_type: "null".to_string(),
                    example: "null".to_string(),
                    formatted: None,
                    length: None,
                },
            );
        }
    }
}

fn describe_list(items: &[Value]) -> FieldInfo {
    if items.is_empty() {
        return FieldInfo {
            field_type: "list".to_string(),
            example: "[]".to_string(),
            formatted: None,
            length: Some(0),
        };
    }

    let item_type = match &items[0] {
        Value::Object(_) => "object",
        Value::Array(_) => "list",
        Value::String(_) => "string",
        Value::Number(n) if n.is_i64() => "int",
        Value::Number(_) => "float",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    };

    // A list of small mappings is best described by its key set
    let example = if let Value::Object(map) = &items[0] {
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        format!("List of objects with keys: {}", keys.join(", "))
    } else {
        truncate_example(&serde_json::to_string(&Value::Array(items.to_vec())).unwrap_or_default())
    };

    FieldInfo {
        field_type: format!("list<{item_type}>"),
        example,
        formatted: None,
        length: Some(items.len()),
    }
}

fn capture_synthetic_fields(record: &str, fields: &mut FieldMap) {
    for (pattern, _name) in timestamp_patterns() {
        if let Some(m) = pattern.captures(record).and_then(|c| c.get(1)) {
            let ts = m.as_str().to_string();
            fields.insert(
                "timestamp".to_string(),
                FieldInfo {
                    field_type: "timestamp".to_string(),
                    example: ts.clone(),
                    formatted: Some(ts),
                    length: None,
                },
            );
            break;
        }
    }

    if let Some(m) = level_pattern().captures(record).and_then(|c| c.get(1)) {
        let level = m.as_str().to_ascii_uppercase();
        fields.insert(
            "log_level".to_string(),
            FieldInfo {
                field_type: "level".to_string(),
                example: level.clone(),
                formatted: Some(level),
                length: None,
            },
        );
    }

    if let Some(m) = ip_pattern().captures(record).and_then(|c| c.get(1)) {
        let ip = m.as_str().to_string();
        fields.insert(
            "ip_address".to_string(),
            FieldInfo {
                field_type: "ip".to_string(),
                example: ip.clone(),
                formatted: Some(ip),
                length: None,
            },
        );
    }

    let first_line = record.lines().next().unwrap_or(record);
    if let Some(pos) = first_line.find(':') {
        let message = first_line[pos + 1..].trim();
        if !message.is_empty() {
            fields.insert(
                "message".to_string(),
                FieldInfo {
                    field_type: "string".to_string(),
                    example: message.to_string(),
                    formatted: Some(truncate_formatted(message)),
                    length: None,
                },
            );
        }
    }
}

/// Rank delimiters by occurrence count and extract key/value pairs under
/// the first delimiter/separator combination that produces any.
fn extract_pairs(record: &str, fields: &mut FieldMap) -> usize {
    let mut ranked: Vec<(&str, usize)> = PAIR_DELIMITERS
        .iter()
        .map(|d| (*d, record.matches(d).count()))
        .collect();
    // Stable sort keeps the fixed tiebreak order deterministic
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    for (delimiter, count) in ranked {
        if count == 0 {
            continue;
        }
        if delimiter == " = " {
            let found = extract_spaced_equals_pairs(record, fields);
            if found > 0 {
                return found;
            }
            continue;
        }

        let parts: Vec<&str> = record.split(delimiter).collect();
        for separator in PAIR_SEPARATORS {
            let mut found = 0;
            for part in &parts {
                let part = part.trim();
                if let Some((key, value)) = part.split_once(separator) {
                    let key = key.trim();
                    let value = value.trim();
                    if is_field_key(key) && !value.is_empty() {
                        fields.insert(key.to_string(), infer_field(key, value));
                        found += 1;
                    }
                }
            }
            if found > 0 {
                return found;
            }
        }
    }
    0
}

/// Re-pair tokens for the `key = value` shape where spaces surround the
/// equals sign.
fn extract_spaced_equals_pairs(record: &str, fields: &mut FieldMap) -> usize {
    let segments: Vec<&str> = record.split(" = ").collect();
    if segments.len() < 2 {
        return 0;
    }

    let mut found = 0;
    let mut current_key = segments[0].trim().rsplit(' ').next().unwrap_or("").to_string();
    for segment in &segments[1..] {
        let segment = segment.trim();
        let (value, next_key) = match segment.split_once(' ') {
            Some((v, rest)) => (v, rest.rsplit(' ').next().unwrap_or("")),
            None => (segment, ""),
        };
        if is_field_key(&current_key) && !value.is_empty() {
            fields.insert(current_key.clone(), infer_field(&current_key, value));
            found += 1;
        }
        current_key = next_key.to_string();
    }
    found
}

fn extract_multiline_pairs(record: &str, fields: &mut FieldMap) -> usize {
    let mut found = 0;
    for caps in multiline_pattern().captures_iter(record) {
        let key = caps.get(1).map_or("", |m| m.as_str()).trim();
        let value = caps.get(2).map_or("", |m| m.as_str()).trim();
        if !key.is_empty() && !value.is_empty() {
            fields.insert(key.to_string(), infer_field(key, value));
            found += 1;
        }
    }
    found
}

/// Token-level `key="quoted value"` / `key=value` fallback for records
/// where no delimiter pass produced pairs.
fn extract_quoted_pairs(record: &str, fields: &mut FieldMap) -> usize {
    let mut found = 0;
    for caps in quoted_pair_pattern().captures_iter(record) {
        let key = caps.get(1).map_or("", |m| m.as_str());
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map_or("", |m| m.as_str())
            .trim();
        if !value.is_empty() {
            fields.insert(key.to_string(), infer_field(key, value));
            found += 1;
        }
    }
    found
}

/// Delimited-table mode: the first line is a header naming the fields of
/// the second. A single delimited line yields positional `field_N` values.
fn extract_table(record: &str, fields: &mut FieldMap) -> usize {
    let lines: Vec<&str> = record.lines().filter(|l| !l.trim().is_empty()).collect();
    let first = match lines.first() {
        Some(line) => *line,
        None => return 0,
    };

    let delimiter = TABLE_DELIMITERS
        .iter()
        .max_by_key(|d| first.matches(**d).count())
        .copied()
        .unwrap_or(",");
    if first.matches(delimiter).count() == 0 {
        return 0;
    }

    let mut found = 0;
    if lines.len() > 1 {
        let header: Vec<&str> = first.split(delimiter).collect();
        let data: Vec<&str> = lines[1].split(delimiter).collect();
        for (name, value) in header.iter().zip(&data) {
            let name = name.trim();
            let value = value.trim();
            if !name.is_empty() && !value.is_empty() {
                fields.insert(name.to_string(), infer_field(name, value));
                found += 1;
            }
        }
    } else {
        for (i, value) in first.split(delimiter).enumerate() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            // A token may itself carry an embedded key=value
            let (name, value) = match value.split_once('=') {
                Some((k, v)) if is_field_key(k.trim()) && !v.trim().is_empty() => {
                    (k.trim().to_string(), v.trim())
                }
                _ => (format!("field_{}", i + 1), value),
            };
            fields.insert(name.clone(), infer_field(&name, value));
            found += 1;
        }
    }
    found
}

/// Last resort: whitespace tokens as numbered fields, skipping values
/// already claimed by a synthetic field.
fn extract_tokens(record: &str, fields: &mut FieldMap) {
    let claimed: Vec<String> = fields.values().map(|f| f.example.clone()).collect();

    for (i, token) in record.split_whitespace().enumerate() {
        // Multi-token examples (timestamps, messages) claim each of their parts
        if claimed
            .iter()
            .any(|c| c == token || c.split_whitespace().any(|part| part == token))
        {
            continue;
        }
        let (name, value) = match token.split_once('=') {
            Some((k, v)) if is_field_key(k.trim()) && !v.trim().is_empty() => {
                (k.trim().to_string(), v.trim())
            }
            _ => (format!("field_{}", i + 1), token),
        };
        fields.insert(name.clone(), infer_field(&name, value));
    }
}

/// Infer a value's type from its shape, falling back to hints in the key
/// name, and build the display rendering.
fn infer_field(key: &str, value: &str) -> FieldInfo {
    if let Ok(i) = value.parse::<i64>() {
        return FieldInfo {
            field_type: "int".to_string(),
            example: value.to_string(),
            formatted: Some(group_thousands(i)),
            length: None,
        };
    }
    if let Ok(f) = value.parse::<f64>() {
        return FieldInfo {
            field_type: "float".to_string(),
            example: value.to_string(),
            formatted: Some(format!("{f:.2}")),
            length: None,
        };
    }

    let lower = value.to_ascii_lowercase();
    if lower == "true" || lower == "false" {
        return FieldInfo {
            field_type: "bool".to_string(),
            example: value.to_string(),
            formatted: Some(lower),
            length: None,
        };
    }
    if lower == "yes" || lower == "no" {
        return FieldInfo {
            field_type: "bool".to_string(),
            example: value.to_string(),
            formatted: Some(if lower == "yes" { "true" } else { "false" }.to_string()),
            length: None,
        };
    }

    let key_lower = key.to_ascii_lowercase();
    let field_type = if matches!(key_lower.as_str(), "time" | "timestamp" | "date") {
        "timestamp"
    } else if matches!(key_lower.as_str(), "level" | "severity" | "loglevel") {
        "level"
    } else {
        "string"
    };

    FieldInfo {
        field_type: field_type.to_string(),
        example: value.to_string(),
        formatted: Some(truncate_formatted(value)),
        length: None,
    }
}

fn is_field_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Thousands-separated rendering for integers.
fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    let offset = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - offset) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if n < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Truncate a display rendering to 40 characters.
fn truncate_formatted(value: &str) -> String {
    if value.chars().count() > 40 {
        let head: String = value.chars().take(37).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

/// Truncate a long example to 100 characters.
fn truncate_example(value: &str) -> String {
    if value.chars().count() > 100 {
        let head: String = value.chars().take(97).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

fn timestamp_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(
                    r"\b(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[+-]\d{2}:?\d{2}|Z)?)\b",
                )
                .unwrap(),
                "ISO8601",
            ),
            (
                Regex::new(r"\b(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)\b").unwrap(),
                "datetime",
            ),
            (
                Regex::new(r"\b(\d{2}/\d{2}/\d{4}\s+\d{2}:\d{2}:\d{2})\b").unwrap(),
                "MM/DD/YYYY",
            ),
            (
                Regex::new(r"\b([A-Za-z]{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\b").unwrap(),
                "syslog",
            ),
            (
                Regex::new(r"\b(\d{2}-[A-Za-z]{3}-\d{4}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)\b")
                    .unwrap(),
                "DD-Mon-YYYY",
            ),
        ]
    })
}

fn level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL|TRACE)\b").unwrap()
    })
}

fn ip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap())
}

fn multiline_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?m)^([A-Za-z][A-Za-z0-9_.\-]*)\s*[:=]\s*(.+?)\s*$").unwrap())
}

fn quoted_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Za-z][A-Za-z0-9_.\-]*)=(?:"([^"]*)"|([^,;\s]*))"#).unwrap()
    })
}
