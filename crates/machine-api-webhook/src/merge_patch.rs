//! JSON merge patch (RFC 7386) between two object revisions
//!
//! Used to recognise updates whose only effect is clearing finalizers, so
//! owner controllers can finish deleting objects that no longer validate.

use serde_json::{Map, Value};

/// Serialized patch of an update that only clears finalizers
pub const FINALIZER_ONLY_PATCH: &str = r#"{"metadata":{"finalizers":[""]}}"#;

/// Same update when the last finalizer is dropped outright
const FINALIZERS_REMOVED_PATCH: &str = r#"{"metadata":{"finalizers":null}}"#;

/// Metadata the API server rewrites on every update
const VOLATILE_METADATA: &[&str] = &["resourceVersion", "managedFields", "generation"];

/// Smallest merge patch turning `old` into `new`
///
/// Returns `Value::Null` inside objects for removed keys. Non-object values
/// are replaced wholesale, arrays included.
pub fn create(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in new {
                match old.get(key) {
                    Some(prev) => {
                        if let Some(diff) = create(prev, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (old, new) if old == new => None,
        (_, new) => Some(new.clone()),
    }
}

/// True when `new` differs from `old` only by its finalizers being cleared
pub fn is_finalizer_only_removal(old: &Value, new: &Value) -> bool {
    let Some(patch) = create(&without_volatile(old), &without_volatile(new)) else {
        return false;
    };
    let serialized = patch.to_string();
    serialized == FINALIZER_ONLY_PATCH || serialized == FINALIZERS_REMOVED_PATCH
}

fn without_volatile(object: &Value) -> Value {
    let mut object = object.clone();
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for key in VOLATILE_METADATA {
            metadata.remove(*key);
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deleting_machine(finalizers: Value) -> Value {
        json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "worker-0",
                "namespace": "openshift-machine-api",
                "resourceVersion": "10",
                "deletionTimestamp": "2024-01-01T00:00:00Z",
                "finalizers": finalizers,
            },
            "spec": {"providerSpec": {"value": {"instanceType": 7}}},
        })
    }

    #[test]
    fn identical_objects_have_no_patch() {
        let machine = deleting_machine(json!(["machine.machine.openshift.io"]));
        assert_eq!(create(&machine, &machine), None);
    }

    #[test]
    fn patch_nulls_removed_keys_and_replaces_arrays() {
        let old = json!({"a": 1, "b": {"c": [1, 2], "d": true}});
        let new = json!({"b": {"c": [1], "d": true}, "e": "x"});
        assert_eq!(
            create(&old, &new),
            Some(json!({"a": null, "b": {"c": [1]}, "e": "x"}))
        );
    }

    #[test]
    fn story_finalizer_only_update_is_recognised() {
        let old = deleting_machine(json!(["machine.machine.openshift.io"]));
        let mut new = deleting_machine(json!([""]));
        new["metadata"]["resourceVersion"] = json!("11");

        assert!(is_finalizer_only_removal(&old, &new));
    }

    #[test]
    fn dropping_the_last_finalizer_is_recognised() {
        let old = deleting_machine(json!(["machine.machine.openshift.io"]));
        let mut new = old.clone();
        new["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("finalizers");

        assert!(is_finalizer_only_removal(&old, &new));
    }

    #[test]
    fn other_changes_alongside_finalizers_are_not_exempt() {
        let old = deleting_machine(json!(["machine.machine.openshift.io"]));
        let mut new = deleting_machine(json!([""]));
        new["spec"]["providerSpec"]["value"]["instanceType"] = json!("m6i.large");

        assert!(!is_finalizer_only_removal(&old, &new));
    }

    #[test]
    fn adding_a_finalizer_is_not_exempt() {
        let old = deleting_machine(json!(["machine.machine.openshift.io"]));
        let new = deleting_machine(json!(["machine.machine.openshift.io", "other"]));

        assert!(!is_finalizer_only_removal(&old, &new));
    }
}
