//! Safe and canonical JSON encoding.
//!
//! Two encoders live here. The safe encoder turns values that plain JSON
//! cannot carry (non-finite floats, 128-bit integers, error chains) into
//! sentinel strings or structured stand-ins before serialization. The stable
//! encoder produces the canonical text used for deduplication fingerprints:
//! object keys sorted lexicographically, depth capped, sentinels fixed.
//!
//! Fingerprint stability is a compatibility contract. Changing the key sort,
//! the depth cap, or any sentinel changes which records deduplicate against
//! each other across versions.

use serde_json::Value;

use crate::context::Ctx;

/// Sentinel for values nested beyond the stable encoder's depth cap.
pub const MAX_DEPTH_SENTINEL: &str = "[MaxDepth]";

/// Sentinel used where a field is absent entirely.
pub const UNDEFINED_SENTINEL: &str = "[Undefined]";

/// Sentinel for NaN and infinite floats.
pub const NON_FINITE_SENTINEL: &str = "[NonFiniteNumber]";

/// Serialize a value on a single line, absorbing any failure.
///
/// `serde_json::Value` trees serialize infallibly in practice; the fallback
/// exists so no caller on the telemetry path can panic.
pub fn to_single_line(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Canonical string for an optional sub-tree, treating absence as a distinct
/// value rather than an empty one.
pub fn stable_field(value: Option<&Value>, max_depth: usize) -> String {
    match value {
        Some(value) => stable_string(value, max_depth),
        None => UNDEFINED_SENTINEL.to_string(),
    }
}

/// Canonical string for an optional mapping, as [`stable_field`].
pub fn stable_map_field(map: Option<&Ctx>, max_depth: usize) -> String {
    match map {
        Some(map) => {
            let mut out = String::new();
            write_stable_object(map, 1, max_depth, &mut out);
            out
        }
        None => UNDEFINED_SENTINEL.to_string(),
    }
}

/// Canonical, deterministic serialization of a JSON value.
///
/// Object keys are emitted in lexicographic order regardless of insertion
/// order; values deeper than `max_depth` collapse to [`MAX_DEPTH_SENTINEL`].
pub fn stable_string(value: &Value, max_depth: usize) -> String {
    let mut out = String::new();
    write_stable(value, 0, max_depth, &mut out);
    out
}

fn write_stable(value: &Value, depth: usize, max_depth: usize, out: &mut String) {
    if depth > max_depth {
        write_json_string(MAX_DEPTH_SENTINEL, out);
        return;
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, depth + 1, max_depth, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_stable_object(map, depth + 1, max_depth, out),
    }
}

fn write_stable_object(map: &Ctx, child_depth: usize, max_depth: usize, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_json_string(key, out);
        out.push(':');
        // Entries are present for every collected key.
        match map.get(key) {
            Some(value) => write_stable(value, child_depth, max_depth, out),
            None => out.push_str("null"),
        }
    }
    out.push('}');
}

fn write_json_string(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// Capture an error as a structured JSON value.
///
/// The shape is `{"$error": <type>, "message": <display>, "stack": <source
/// chain>}`; `stack` is omitted when the error has no source.
pub fn error_value<E>(err: &E) -> Value
where
    E: std::error::Error,
{
    let mut map = Ctx::new();
    map.insert(
        "$error".to_string(),
        Value::String(short_type_name::<E>().to_string()),
    );
    map.insert("message".to_string(), Value::String(err.to_string()));

    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    if !chain.is_empty() {
        map.insert("stack".to_string(), Value::String(chain.join("\n")));
    }

    Value::Object(map)
}

/// Encode a float, mapping NaN and infinities to [`NON_FINITE_SENTINEL`].
pub fn float_value(f: f64) -> Value {
    match serde_json::Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None => Value::String(NON_FINITE_SENTINEL.to_string()),
    }
}

/// Encode a 128-bit signed integer as its decimal string.
pub fn big_int_value(i: i128) -> Value {
    Value::String(i.to_string())
}

/// Encode a 128-bit unsigned integer as its decimal string.
pub fn big_uint_value(u: u128) -> Value {
    Value::String(u.to_string())
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_sorts_keys() {
        let value = json!({"zebra": 1, "apple": 2, "mango": {"b": 1, "a": 2}});
        assert_eq!(
            stable_string(&value, 10),
            r#"{"apple":2,"mango":{"a":2,"b":1},"zebra":1}"#
        );
    }

    #[test]
    fn test_stable_depth_cap() {
        let value = json!({"a": {"b": {"c": 1}}});
        // Values three levels down exceed a cap of 2.
        assert_eq!(
            stable_string(&value, 2),
            r#"{"a":{"b":{"c":"[MaxDepth]"}}}"#
        );
        assert_eq!(stable_string(&value, 0), r#"{"a":"[MaxDepth]"}"#);
    }

    #[test]
    fn test_stable_arrays_and_scalars() {
        let value = json!([1, "two", null, true, {"k": [3]}]);
        assert_eq!(stable_string(&value, 10), r#"[1,"two",null,true,{"k":[3]}]"#);
    }

    #[test]
    fn test_stable_field_absent() {
        assert_eq!(stable_field(None, 10), "[Undefined]");
        assert_eq!(stable_map_field(None, 10), "[Undefined]");
    }

    #[test]
    fn test_stable_is_insertion_order_independent() {
        let mut forward = Ctx::new();
        forward.insert("a".into(), json!(1));
        forward.insert("b".into(), json!(2));

        let mut backward = Ctx::new();
        backward.insert("b".into(), json!(2));
        backward.insert("a".into(), json!(1));

        assert_eq!(
            stable_map_field(Some(&forward), 10),
            stable_map_field(Some(&backward), 10)
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("flush failed")]
    struct FlushError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn test_error_value_shape() {
        let err = FlushError {
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };
        let value = error_value(&err);
        assert_eq!(value["$error"], "FlushError");
        assert_eq!(value["message"], "flush failed");
        assert_eq!(value["stack"], "caused by: disk on fire");
    }

    #[test]
    fn test_error_value_without_source() {
        let err = crate::Error::Config {
            message: "bad".to_string(),
        };
        let value = error_value(&err);
        assert_eq!(value["$error"], "Error");
        assert_eq!(value["message"], "Configuration error: bad");
        assert!(value.get("stack").is_none());
    }

    #[test]
    fn test_float_and_bigint_sentinels() {
        assert_eq!(float_value(1.5), json!(1.5));
        assert_eq!(float_value(f64::NAN), json!("[NonFiniteNumber]"));
        assert_eq!(float_value(f64::INFINITY), json!("[NonFiniteNumber]"));
        assert_eq!(
            big_int_value(i128::MIN),
            json!("-170141183460469231731687303715884105728")
        );
        assert_eq!(big_uint_value(12345), json!("12345"));
    }
}
