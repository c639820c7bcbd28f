//! Content-addressed fingerprints for draft caching and trigger idempotency.
//!
//! All hashes are SHA-256 over a canonical JSON rendering: object keys are
//! trimmed and sorted, string values trimmed, `null` members dropped and
//! numbers rendered in a single stable form. The same logical input therefore
//! hashes identically across processes and releases.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::{Number, Value};

use crate::DomainResult;
use crate::automations::RuleConfig;
use crate::error::DomainError;
use crate::util::sha256_hex;

const FINGERPRINT_VERSION: &str = "v1";
const MAX_DEPTH: usize = 32;
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Order-independent hash over the set of target identifiers.
pub fn compute_scope_id(target_ids: &[String]) -> DomainResult<String> {
    let mut members = Vec::with_capacity(target_ids.len());
    for raw in target_ids {
        let id = raw.trim();
        if id.is_empty() {
            return Err(DomainError::InvalidInput(
                "target ids must not be empty".into(),
            ));
        }
        members.push(id.to_string());
    }
    members.sort();
    members.dedup();

    let canonical = canonical_json(&Value::Array(
        members.into_iter().map(Value::String).collect(),
    ))?;
    Ok(format!("scope_{}", digest("scope", &canonical)))
}

pub fn compute_rules_hash(rule_config: &RuleConfig) -> DomainResult<String> {
    let canonical = canonical_json(&Value::Object(rule_config.clone()))?;
    Ok(format!("rules_{}", digest("rules", &canonical)))
}

/// Hash over the mutable fields of a target, used as the idempotency hash.
pub fn compute_content_hash(content: &Value) -> DomainResult<String> {
    let canonical = canonical_json(content)?;
    Ok(format!("content_{}", digest("content", &canonical)))
}

fn digest(domain: &str, canonical: &str) -> String {
    sha256_hex(format!("{FINGERPRINT_VERSION}:{domain}:{canonical}").as_bytes())
}

pub(crate) fn canonical_json(value: &Value) -> DomainResult<String> {
    let mut out = String::new();
    write_canonical(value, 0, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) -> DomainResult<()> {
    if depth > MAX_DEPTH {
        return Err(DomainError::InvalidInput(format!(
            "configuration nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&canonical_number(number)?),
        Value::String(text) => write_string(text.trim(), out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (raw_key, item) in map {
                if item.is_null() {
                    continue;
                }
                let key = raw_key.trim();
                if key.is_empty() {
                    return Err(DomainError::InvalidInput(
                        "configuration keys must not be empty".into(),
                    ));
                }
                if sorted.insert(key.to_string(), item).is_some() {
                    return Err(DomainError::InvalidInput(format!(
                        "duplicate configuration key '{key}' after normalization"
                    )));
                }
            }
            out.push('{');
            for (index, (key, item)) in sorted.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(&key, out);
                out.push(':');
                write_canonical(item, depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn canonical_number(number: &Number) -> DomainResult<String> {
    if let Some(value) = number.as_i64() {
        return Ok(value.to_string());
    }
    if let Some(value) = number.as_u64() {
        return Ok(value.to_string());
    }
    let value = number
        .as_f64()
        .filter(|value| value.is_finite())
        .ok_or_else(|| DomainError::InvalidInput("non-finite number in configuration".into()))?;
    if value.fract() == 0.0 && value.abs() < MAX_SAFE_INTEGER {
        return Ok(format!("{}", value as i64));
    }
    Ok(format!("{value}"))
}

fn write_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if (ch as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(value: Value) -> RuleConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("rules must be an object"),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn scope_id_ignores_input_order_and_duplicates() {
        let left = compute_scope_id(&ids(&["p-3", "p-1", "p-2"])).expect("scope");
        let right = compute_scope_id(&ids(&["p-1", "p-2", "p-3", "p-1"])).expect("scope");
        assert_eq!(left, right);
        assert!(left.starts_with("scope_"));
    }

    #[test]
    fn scope_id_changes_with_membership() {
        let base = compute_scope_id(&ids(&["p-1", "p-2", "p-3"])).expect("scope");
        let removed = compute_scope_id(&ids(&["p-1", "p-2"])).expect("scope");
        let added = compute_scope_id(&ids(&["p-1", "p-2", "p-3", "p-4"])).expect("scope");
        assert_ne!(base, removed);
        assert_ne!(base, added);
    }

    #[test]
    fn scope_id_rejects_blank_ids() {
        let err = compute_scope_id(&ids(&["p-1", "  "])).unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
    }

    #[test]
    fn rules_hash_is_stable_under_normalization() {
        let left = rules(json!({
            "tone": "friendly",
            "max_length": 60,
            "template": "{{title}} | Shop",
            "suffix": null
        }));
        let right = rules(json!({
            " template ": "  {{title}} | Shop ",
            "max_length": 60.0,
            "tone": "friendly"
        }));
        assert_eq!(
            compute_rules_hash(&left).expect("hash"),
            compute_rules_hash(&right).expect("hash")
        );
    }

    #[test]
    fn rules_hash_changes_with_any_parameter() {
        let base = rules(json!({ "tone": "friendly", "max_length": 60 }));
        let longer = rules(json!({ "tone": "friendly", "max_length": 61 }));
        let prefixed = rules(json!({ "tone": "friendly", "max_length": 60, "prefix": "New:" }));
        let base_hash = compute_rules_hash(&base).expect("hash");
        assert_ne!(base_hash, compute_rules_hash(&longer).expect("hash"));
        assert_ne!(base_hash, compute_rules_hash(&prefixed).expect("hash"));
    }

    #[test]
    fn rules_hash_keeps_array_order_significant() {
        let left = rules(json!({ "keywords": ["a", "b"] }));
        let right = rules(json!({ "keywords": ["b", "a"] }));
        assert_ne!(
            compute_rules_hash(&left).expect("hash"),
            compute_rules_hash(&right).expect("hash")
        );
    }

    #[test]
    fn rules_hash_rejects_keys_colliding_after_trim() {
        let config = rules(json!({ "tone": "a", " tone": "b" }));
        let err = compute_rules_hash(&config).unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
    }

    #[test]
    fn canonical_json_escapes_control_characters() {
        let canonical = canonical_json(&json!({ "b": "line\nbreak", "a": 1.5 })).expect("json");
        assert_eq!(canonical, r#"{"a":1.5,"b":"line\nbreak"}"#);
    }

    #[test]
    fn content_hash_differs_from_rules_hash_for_same_payload() {
        let payload = json!({ "tone": "friendly" });
        let content = compute_content_hash(&payload).expect("content");
        let rules_hash = compute_rules_hash(&rules(payload)).expect("rules");
        assert_ne!(content.trim_start_matches("content_"), rules_hash.trim_start_matches("rules_"));
    }
}
