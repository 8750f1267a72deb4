//! JSON merge patches (RFC 7386).

use serde_json::{Map, Value};

/// Patch that turns `from` into `to`. Keys missing from `to` become `null`.
#[must_use]
pub fn create_merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let removed = from
                .keys()
                .filter(|k| !to.contains_key(k.as_str()))
                .map(|k| (k.clone(), Value::Null));
            let changed = to.iter().filter_map(|(k, v)| match from.get(k) {
                Some(old) if old == v => None,
                Some(old) => Some((k.clone(), create_merge_patch(old, v))),
                None => Some((k.clone(), v.clone())),
            });
            Value::Object(removed.chain(changed).collect::<Map<_, _>>())
        }
        _ => to.clone(),
    }
}

/// Apply a merge patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
