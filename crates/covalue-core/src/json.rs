//! Stable JSON stringification.
//!
//! Object keys are emitted in sorted order at every depth, so two parties
//! that serialize the same value always produce identical bytes. Headers and
//! transactions are hashed over this form.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Serialize a value to JSON with sorted object keys.
pub fn stable_stringify<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let value = json!({"b": 1, "a": {"d": [1, {"z": null, "y": true}], "c": "x"}});
        assert_eq!(
            stable_stringify(&value).unwrap(),
            r#"{"a":{"c":"x","d":[1,{"y":true,"z":null}]},"b":1}"#
        );
    }

    #[test]
    fn test_scalars_and_escaping() {
        assert_eq!(stable_stringify(&json!("a\"b")).unwrap(), r#""a\"b""#);
        assert_eq!(stable_stringify(&json!(null)).unwrap(), "null");
        assert_eq!(stable_stringify(&json!([])).unwrap(), "[]");
    }
}
