//! JSON merge patch (RFC 7386) over documents.

use serde_json::Value as Json;

/// Apply `patch` onto `target` in place: objects merge recursively, `null` removes a key,
/// everything else (arrays included) replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(target_map) = target {
        for (k, pv) in patch_map.iter() {
            if pv.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

/// Owned variant of [`merge_patch`].
pub fn merged(mut target: Json, patch: &Json) -> Json {
    merge_patch(&mut target, patch);
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_objects_and_removes_nulls() {
        let base = json!({ "a": "1", "b": { "x": 1, "y": 2 }, "c": [1, 2] });
        let out = merged(base, &json!({ "b": { "y": null, "z": 3 }, "c": [9], "d": true }));
        assert_eq!(out, json!({ "a": "1", "b": { "x": 1, "z": 3 }, "c": [9], "d": true }));
    }

    #[test]
    fn non_object_patch_replaces() {
        assert_eq!(merged(json!({ "a": 1 }), &json!("s")), json!("s"));
        assert_eq!(merged(json!("s"), &json!({ "a": 1 })), json!({ "a": 1 }));
    }
}
