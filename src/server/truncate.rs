//! Oversized payload truncation
//!
//! Large push and pull request deliveries are dominated by a few list
//! fields. When a body exceeds the size limit those lists are cut down and
//! a `_truncated` object records what was removed.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::config::ServerConfig;

/// Top-level keys whose arrays may be shortened.
pub const TRUNCATABLE_KEYS: [&str; 6] = ["commits", "files", "added", "removed", "modified", "pages"];

/// Key of the bookkeeping object added to a truncated payload.
pub const TRUNCATED_KEY: &str = "_truncated";

/// What happened to one array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncationInfo {
    pub original_count: usize,
    pub kept: usize,
}

/// Size limits applied to inbound bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationLimits {
    /// Bodies up to this many bytes are never touched
    pub max_payload_bytes: usize,
    /// Length arrays are cut to
    pub max_array_elements: usize,
}

impl From<&ServerConfig> for TruncationLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            max_array_elements: config.max_array_elements,
        }
    }
}

/// Shorten the truncatable arrays of `payload` if the raw body was too large.
///
/// Returns the per-key record, empty when nothing changed. Non-object
/// payloads and payloads without long arrays pass through untouched.
pub fn truncate_payload_if_needed(
    body_len: usize,
    payload: &mut Value,
    limits: TruncationLimits,
) -> BTreeMap<String, TruncationInfo> {
    let mut record = BTreeMap::new();
    if body_len <= limits.max_payload_bytes {
        return record;
    }
    let Value::Object(fields) = payload else {
        return record;
    };

    for key in TRUNCATABLE_KEYS {
        let Some(Value::Array(items)) = fields.get_mut(key) else {
            continue;
        };
        if items.len() <= limits.max_array_elements {
            continue;
        }
        record.insert(
            key.to_string(),
            TruncationInfo {
                original_count: items.len(),
                kept: limits.max_array_elements,
            },
        );
        items.truncate(limits.max_array_elements);
    }

    if !record.is_empty() {
        // Serializing a map of plain counters cannot fail.
        if let Ok(summary) = serde_json::to_value(&record) {
            fields.insert(TRUNCATED_KEY.to_string(), summary);
        }
    }
    record
}

/// Comma-separated truncated keys, for logs.
pub fn truncated_fields(record: &BTreeMap<String, TruncationInfo>) -> String {
    record.keys().cloned().collect::<Vec<_>>().join(",")
}
