// SPDX-License-Identifier: MIT OR Apache-2.0
//! Config intersection with parent-as-ceiling semantics.

use serde_json::{Map, Value};

/// Intersect a child config under its parent's ceiling.
///
/// Rules, per key:
/// - key only in the child → child value adopted;
/// - key only in the parent → parent value adopted (the ceiling applies even
///   when the child is silent);
/// - both lists → set intersection, parent order preserved;
/// - both maps → recursive intersection;
/// - anything else → parent wins unless the values are equal.
pub fn intersect_configs(parent: &Map<String, Value>, child: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = child.clone();
    for (key, parent_value) in parent {
        match merged.get(key) {
            None => {
                merged.insert(key.clone(), parent_value.clone());
            }
            Some(child_value) => {
                let combined = match (parent_value, child_value) {
                    (Value::Object(po), Value::Object(co)) => {
                        Value::Object(intersect_configs(po, co))
                    }
                    (Value::Array(pa), Value::Array(ca)) => Value::Array(
                        pa.iter()
                            .filter(|v| ca.contains(v))
                            .cloned()
                            .collect(),
                    ),
                    (p, c) if p == c => c.clone(),
                    (p, _) => p.clone(),
                };
                merged.insert(key.clone(), combined);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn lists_intersect_in_parent_order() {
        let parent = map(json!({"allowed_store_ids": ["a", "b"]}));
        let child = map(json!({"allowed_store_ids": ["b", "c"]}));
        let merged = intersect_configs(&parent, &child);
        assert_eq!(merged["allowed_store_ids"], json!(["b"]));
    }

    #[test]
    fn conflicting_scalars_take_parent() {
        let parent = map(json!({"max_value_bytes": 1_048_576}));
        let child = map(json!({"max_value_bytes": 2_097_152}));
        let merged = intersect_configs(&parent, &child);
        assert_eq!(merged["max_value_bytes"], json!(1_048_576));
    }

    #[test]
    fn equal_scalars_pass_through() {
        let parent = map(json!({"mode": "ro"}));
        let child = map(json!({"mode": "ro"}));
        assert_eq!(intersect_configs(&parent, &child)["mode"], json!("ro"));
    }

    #[test]
    fn child_only_keys_are_adopted() {
        let parent = map(json!({}));
        let child = map(json!({"extra": true}));
        assert_eq!(intersect_configs(&parent, &child)["extra"], json!(true));
    }

    #[test]
    fn parent_only_keys_apply_as_ceiling() {
        let parent = map(json!({"allowed_keys": ["FOO"]}));
        let child = map(json!({}));
        assert_eq!(
            intersect_configs(&parent, &child)["allowed_keys"],
            json!(["FOO"])
        );
    }

    #[test]
    fn nested_maps_recurse() {
        let parent = map(json!({"limits": {"domains": ["a.com", "b.com"], "ports": [80, 443]}}));
        let child = map(json!({"limits": {"domains": ["b.com"], "ports": [443, 8080]}}));
        let merged = intersect_configs(&parent, &child);
        assert_eq!(
            merged["limits"],
            json!({"domains": ["b.com"], "ports": [443]})
        );
    }

    #[test]
    fn store_config_ceiling_example() {
        let parent = map(json!({
            "allowed_store_ids": ["a", "b"],
            "max_value_bytes": 1_048_576,
        }));
        let child = map(json!({
            "allowed_store_ids": ["b", "c"],
            "max_value_bytes": 2_097_152,
        }));
        let merged = intersect_configs(&parent, &child);
        assert_eq!(
            Value::Object(merged),
            json!({
                "allowed_store_ids": ["b"],
                "max_value_bytes": 1_048_576,
            })
        );
    }

    #[test]
    fn mismatched_types_take_parent() {
        let parent = map(json!({"k": ["a"]}));
        let child = map(json!({"k": "a"}));
        assert_eq!(intersect_configs(&parent, &child)["k"], json!(["a"]));
    }
}
