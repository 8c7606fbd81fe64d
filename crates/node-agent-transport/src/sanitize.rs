//! Log sanitisation for inbound/outbound frames (§4.E).
//!
//! Any object key matching `/token|authorization|password|secret/i` is
//! replaced with `[REDACTED]`; strings, arrays, and objects beyond fixed size
//! limits are truncated, and nesting past a fixed depth is collapsed. Used
//! before any frame payload is written to the log, never before it is sent
//! over the wire.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const MAX_STRING_LEN: usize = 2000;
const MAX_ARRAY_LEN: usize = 50;
const MAX_OBJECT_KEYS: usize = 50;
const MAX_DEPTH: usize = 5;

fn secret_key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)token|authorization|password|secret").unwrap())
}

/// Produce a redacted, size-bounded copy of `value` suitable for logging.
pub fn sanitize(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String("[TRUNCATED: max depth]".to_string());
    }
    match value {
        Value::String(s) if s.len() > MAX_STRING_LEN => {
            let cut = s
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= MAX_STRING_LEN)
                .last()
                .unwrap_or(0);
            Value::String(format!("{}... [TRUNCATED: {} chars]", &s[..cut], s.len()))
        }
        Value::Array(items) => {
            let truncated = items.len() > MAX_ARRAY_LEN;
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_LEN)
                .map(|v| sanitize_at_depth(v, depth + 1))
                .collect();
            if truncated {
                out.push(Value::String(format!(
                    "[TRUNCATED: {} more items]",
                    items.len() - MAX_ARRAY_LEN
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let truncated = map.len() > MAX_OBJECT_KEYS;
            let mut out = serde_json::Map::new();
            for (key, val) in map.iter().take(MAX_OBJECT_KEYS) {
                if secret_key_pattern().is_match(key) {
                    out.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(key.clone(), sanitize_at_depth(val, depth + 1));
                }
            }
            if truncated {
                out.insert(
                    "_truncated".to_string(),
                    Value::String(format!("{} more keys", map.len() - MAX_OBJECT_KEYS)),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_token_like_keys_case_insensitively() {
        let input = json!({"Authorization": "Bearer abc", "nested": {"secret_key": "x"}});
        let out = sanitize(&input);
        assert_eq!(out["Authorization"], json!("[REDACTED]"));
        assert_eq!(out["nested"]["secret_key"], json!("[REDACTED]"));
    }

    #[test]
    fn truncates_long_strings() {
        let long = "a".repeat(2500);
        let out = sanitize(&json!({"data": long}));
        let s = out["data"].as_str().unwrap();
        assert!(s.len() < 2500);
        assert!(s.contains("TRUNCATED"));
    }

    #[test]
    fn truncates_large_arrays_and_objects() {
        let items: Vec<i32> = (0..60).collect();
        let out = sanitize(&json!(items));
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 51);

        let mut obj = serde_json::Map::new();
        for i in 0..60 {
            obj.insert(i.to_string(), json!(i));
        }
        let out = sanitize(&Value::Object(obj));
        assert!(out.as_object().unwrap().contains_key("_truncated"));
    }

    #[test]
    fn collapses_deep_nesting() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": "too deep"}}}}}});
        let out = sanitize(&deep);
        let mut cur = &out;
        for key in ["a", "b", "c", "d"] {
            cur = &cur[key];
        }
        assert!(cur["e"].as_str().unwrap().contains("max depth"));
    }
}
