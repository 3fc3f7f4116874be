//! Canonical JSON rendering.
//!
//! Used wherever two JSON values must compare or key equal regardless of
//! field order: world-model data identity and trust-metadata comparison.
//! Object keys sorted lexicographically, no whitespace, nulls included.

use serde_json::Value;

/// Render a JSON value canonically: sorted keys, compact, recursive.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\"")),
        Value::Array(arr) => {
            let elements: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", elements.join(","))
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .iter()
                .map(|k| {
                    let key = serde_json::to_string(*k).unwrap_or_else(|_| format!("\"{k}\""));
                    format!("{}:{}", key, canonicalize(&obj[*k]))
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_key_sorting() {
        let input = json!({"z": 1, "a": {"c": 3, "b": 2}});
        assert_eq!(canonicalize(&input), r#"{"a":{"b":2,"c":3},"z":1}"#);
    }

    #[test]
    fn test_order_independence() {
        let a = json!({"zone": "paddock-3", "metric": "soil_moisture", "value": 0.31});
        let b = json!({"value": 0.31, "metric": "soil_moisture", "zone": "paddock-3"});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn test_nulls_included() {
        let input = json!({"b": null, "a": 1});
        assert_eq!(canonicalize(&input), r#"{"a":1,"b":null}"#);
    }

    #[test]
    fn test_arrays_preserve_order() {
        let input = json!(["b", "a"]);
        assert_eq!(canonicalize(&input), r#"["b","a"]"#);
    }
}
