//! Deterministic cache-key fingerprints over canonicalized inputs.
//!
//! A fingerprint covers the full signal set and the complete parameter
//! record, so identical requests hash identically regardless of map
//! ordering, float formatting quirks, or signal input order. The digest is
//! a cache key, not a security boundary.

use serde_json::Value;

use crate::price_index::{Signal, ordinal_date};

/// Hex characters in a fingerprint (128 bits).
const FINGERPRINT_HEX_LEN: usize = 32;

/// Fingerprint a canonicalized signal set and parameter record.
///
/// Signals are sorted by `(day, ticker)` and emitted with stable key order;
/// parameters are emitted with sorted keys and fixed-notation floats. The
/// two canonical strings are joined with `"_"` and hashed to a 128-bit hex
/// digest.
pub fn cache_key(signals: &[Signal], params: &Value) -> String {
    let mut ordered: Vec<&Signal> = signals.iter().collect();
    ordered.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.ticker.cmp(&b.ticker)));

    let mut canonical = String::new();
    canonical.push('[');
    for (i, signal) in ordered.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        let date = ordinal_date(signal.day)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| signal.day.to_string());
        canonical.push_str(&format!(
            "{{\"date\":{},\"ticker\":{}}}",
            escape(&date),
            escape(&signal.ticker)
        ));
    }
    canonical.push(']');

    canonical.push('_');
    write_canonical(&mut canonical, params);

    let hash = blake3::hash(canonical.as_bytes());
    hash.to_hex()[..FINGERPRINT_HEX_LEN].to_string()
}

/// Append a canonical JSON rendering of `value`: object keys sorted,
/// floats in fixed 6-decimal notation, integers verbatim.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                out.push_str(&format!("{f:.6}"));
            }
        }
        Value::String(s) => out.push_str(&escape(s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&escape(key));
                out.push(':');
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// JSON-escape a string, delegating to serde_json for correctness.
fn escape(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signals() -> Vec<Signal> {
        vec![Signal::new("RELIANCE", 738522), Signal::new("TCS", 738523)]
    }

    #[test]
    fn test_key_is_128_bit_hex() {
        let key = cache_key(&signals(), &json!({"stop_loss": 5.0}));
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_deterministic() {
        let params = json!({"stop_loss": 5.0, "holding_period": 20});
        assert_eq!(cache_key(&signals(), &params), cache_key(&signals(), &params));
    }

    #[test]
    fn test_signal_order_does_not_matter() {
        let forward = signals();
        let mut reversed = signals();
        reversed.reverse();
        let params = json!({"stop_loss": 5.0});
        assert_eq!(cache_key(&forward, &params), cache_key(&reversed, &params));
    }

    #[test]
    fn test_param_key_order_does_not_matter() {
        let a = json!({"stop_loss": 5.0, "holding_period": 20});
        let b = json!({"holding_period": 20, "stop_loss": 5.0});
        assert_eq!(cache_key(&signals(), &a), cache_key(&signals(), &b));
    }

    #[test]
    fn test_different_params_differ() {
        let a = json!({"stop_loss": 5.0});
        let b = json!({"stop_loss": 6.0});
        assert_ne!(cache_key(&signals(), &a), cache_key(&signals(), &b));
    }

    #[test]
    fn test_different_signals_differ() {
        let params = json!({"stop_loss": 5.0});
        let other = vec![Signal::new("INFY", 738522)];
        assert_ne!(cache_key(&signals(), &params), cache_key(&other, &params));
    }

    #[test]
    fn test_float_fixed_notation() {
        let mut out = String::new();
        write_canonical(&mut out, &json!(0.1));
        assert_eq!(out, "0.100000");

        let mut out = String::new();
        write_canonical(&mut out, &json!(5));
        assert_eq!(out, "5");
    }

    #[test]
    fn test_nested_canonicalization() {
        let a = json!({"outer": {"b": 1, "a": [1.5, 2]}});
        let b = json!({"outer": {"a": [1.5, 2], "b": 1}});
        let mut ca = String::new();
        let mut cb = String::new();
        write_canonical(&mut ca, &a);
        write_canonical(&mut cb, &b);
        assert_eq!(ca, cb);
        assert_eq!(ca, "{\"outer\":{\"a\":[1.500000,2],\"b\":1}}");
    }
}
