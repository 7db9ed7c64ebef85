//! JSON canónico: claves ordenadas, sin espacios. Base del hash estructural
//! de `GuidedFlowData`, independiente del orden de inserción de claves.

use serde_json::Value;

pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display de `Value::String` produce el literal escapado.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_strings_escaped() {
        let v = json!({"b": [1, "x\"y"], "a": {"d": null, "c": true}});
        assert_eq!(to_canonical_json(&v), r#"{"a":{"c":true,"d":null},"b":[1,"x\"y"]}"#);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = serde_json::Map::new();
        a.insert("z".into(), json!(1));
        a.insert("y".into(), json!([]));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), json!([]));
        b.insert("z".into(), json!(1));
        assert_eq!(to_canonical_json(&Value::Object(a)), to_canonical_json(&Value::Object(b)));
    }
}
