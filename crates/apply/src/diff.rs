//! Diff and merge of a (possibly partial) desired document against the live object.
//!
//! Only fields the desired document mentions are compared. Omitted fields are never
//! removed; an explicit `null` is a request to delete the field and travels into the
//! patch as `null`. The patch is an RFC 7386 JSON merge patch.

use konverge_core::{DiffSummary, Error, ResourceDocument, Result};
use konverge_schema::KindSchema;
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
    pub needs_create: bool,
    pub needs_update: bool,
    /// Merge patch carrying only the differing fields; `None` when converged or creating.
    pub patch: Option<ResourceDocument>,
}

/// Compare `desired` with `live` under the kind's exclusions and merge keys.
pub fn compute_change(desired: &ResourceDocument, live: Option<&ResourceDocument>, schema: &KindSchema) -> Result<Change> {
    if !desired.is_object() {
        return Err(Error::InvalidDocument("desired document must be a mapping".into()));
    }
    let live = match live {
        None => return Ok(Change { needs_create: true, needs_update: false, patch: None }),
        Some(l) => l,
    };
    let mut path = Vec::new();
    let patch = diff_value(&mut path, desired, Some(live), schema);
    Ok(Change { needs_create: false, needs_update: patch.is_some(), patch })
}

/// Patch fragment turning `live` into `desired` at `path`, or `None` when nothing differs.
fn diff_value(path: &mut Vec<String>, desired: &Json, live: Option<&Json>, schema: &KindSchema) -> Option<Json> {
    if schema.is_excluded(path.as_slice()) {
        return None;
    }
    match (desired, live) {
        (Json::Null, None | Some(Json::Null)) => None,
        (Json::Null, Some(_)) => Some(Json::Null),
        // a missing parent only needs the keys that carry values
        (Json::Object(want), None) => {
            let mut out = Map::new();
            for (k, dv) in want {
                path.push(k.clone());
                if let Some(p) = diff_value(path, dv, None, schema) {
                    out.insert(k.clone(), p);
                }
                path.pop();
            }
            if out.is_empty() { None } else { Some(Json::Object(out)) }
        }
        (_, None) => Some(without_nulls(desired)),
        (Json::Object(want), Some(Json::Object(have))) => {
            let mut out = Map::new();
            for (k, dv) in want {
                path.push(k.clone());
                if let Some(p) = diff_value(path, dv, have.get(k), schema) {
                    out.insert(k.clone(), p);
                }
                path.pop();
            }
            if out.is_empty() { None } else { Some(Json::Object(out)) }
        }
        (Json::Array(want), Some(Json::Array(have))) => match schema.merge_key_for(path.as_slice()) {
            Some(key) => merge_keyed(path, want, have, key, schema),
            None => {
                let same = want.len() == have.len()
                    && want.iter().zip(have).all(|(d, l)| diff_value(path, d, Some(l), schema).is_none());
                if same { None } else { Some(without_nulls(desired)) }
            }
        },
        (_, Some(l)) => {
            if same_value(desired, l) { None } else { Some(without_nulls(desired)) }
        }
    }
}

/// Items matched by `key` are merged recursively; unmatched live items stay, unmatched desired
/// items are appended. A merge patch cannot address list items, so the whole list is sent.
fn merge_keyed(path: &mut Vec<String>, want: &[Json], have: &[Json], key: &str, schema: &KindSchema) -> Option<Json> {
    let mut merged: Vec<Json> = have.to_vec();
    let mut changed = false;
    for item in want {
        let slot = item
            .get(key)
            .filter(|k| !k.is_null())
            .and_then(|k| merged.iter().position(|l| l.get(key).is_some_and(|lk| same_value(lk, k))));
        match slot {
            Some(i) => {
                if let Some(p) = diff_value(path, item, Some(&merged[i]), schema) {
                    konverge_core::patch::merge_patch(&mut merged[i], &p);
                    changed = true;
                }
            }
            None => {
                if !merged.iter().any(|l| diff_value(path, item, Some(l), schema).is_none()) {
                    merged.push(without_nulls(item));
                    changed = true;
                }
            }
        }
    }
    if changed { Some(Json::Array(merged)) } else { None }
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub fn same_value(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(i), Some(j)) => i == j,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(i, j)| same_value(i, j)),
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| same_value(v, w)))
        }
        _ => a == b,
    }
}

/// Copy of `v` with null-valued mapping entries dropped (what a create should send).
pub fn without_nulls(v: &Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), without_nulls(v))).collect(),
        ),
        Json::Array(items) => Json::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

/// Count what `patch` adds, changes and removes relative to `live`.
pub fn summarize(patch: &Json, live: &Json) -> DiffSummary {
    fn walk(p: &Json, l: Option<&Json>, s: &mut DiffSummary) {
        match (p, l) {
            (Json::Null, Some(v)) if !v.is_null() => s.removes += 1,
            (Json::Null, _) => {}
            (_, None) => s.adds += 1,
            (Json::Object(po), Some(Json::Object(lo))) => {
                for (k, pv) in po {
                    walk(pv, lo.get(k), s);
                }
            }
            (Json::Array(pa), Some(Json::Array(la))) => {
                let common = pa.len().min(la.len());
                s.updates += (0..common).filter(|&i| !same_value(&pa[i], &la[i])).count();
                if pa.len() > la.len() { s.adds += pa.len() - la.len(); }
                if la.len() > pa.len() { s.removes += la.len() - pa.len(); }
            }
            (pv, Some(lv)) => {
                if !same_value(pv, lv) { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(patch, Some(live), &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_schema::{MapCatalog, SchemaCatalog};
    use serde_json::json;

    fn cm() -> KindSchema {
        KindSchema::new("v1", "ConfigMap", "configmaps", true)
    }

    fn live_cm() -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "ns", "resourceVersion": "7", "uid": "u-1", "labels": { "team": "a" } },
            "data": { "a": "1", "b": "2" }
        })
    }

    #[test]
    fn absent_live_means_create_without_patch() {
        let c = compute_change(&json!({ "data": {} }), None, &cm()).unwrap();
        assert!(c.needs_create);
        assert!(!c.needs_update);
        assert!(c.patch.is_none());
    }

    #[test]
    fn omitted_fields_are_never_removed() {
        let desired = json!({ "metadata": { "name": "cfg" }, "data": { "a": "1" } });
        let c = compute_change(&desired, Some(&live_cm()), &cm()).unwrap();
        assert!(!c.needs_update, "patch: {:?}", c.patch);
        assert!(c.patch.is_none());
    }

    #[test]
    fn explicit_null_is_a_removal() {
        let desired = json!({ "data": { "b": null } });
        let c = compute_change(&desired, Some(&live_cm()), &cm()).unwrap();
        assert!(c.needs_update);
        assert_eq!(c.patch, Some(json!({ "data": { "b": null } })));
    }

    #[test]
    fn null_for_a_field_already_missing_is_no_change() {
        let desired = json!({ "data": { "zzz": null } });
        assert!(compute_change(&desired, Some(&live_cm()), &cm()).unwrap().patch.is_none());
    }

    #[test]
    fn null_under_a_missing_parent_is_no_change() {
        let live = json!({ "metadata": { "name": "cfg" } });
        let desired = json!({ "metadata": { "name": "cfg" }, "data": { "gone": null } });
        let c = compute_change(&desired, Some(&live), &cm()).unwrap();
        assert!(!c.needs_update, "patch: {:?}", c.patch);
        assert!(c.patch.is_none());

        let desired = json!({ "metadata": { "labels": { "old": null, "new": "x" } } });
        let c = compute_change(&desired, Some(&live), &cm()).unwrap();
        assert_eq!(c.patch, Some(json!({ "metadata": { "labels": { "new": "x" } } })));
    }

    #[test]
    fn differing_scalar_is_patched_alone() {
        let desired = json!({ "data": { "a": "9", "b": "2" } });
        let c = compute_change(&desired, Some(&live_cm()), &cm()).unwrap();
        assert_eq!(c.patch, Some(json!({ "data": { "a": "9" } })));
    }

    #[test]
    fn added_key_merges_with_existing() {
        let desired = json!({ "data": { "c": "3" } });
        let c = compute_change(&desired, Some(&live_cm()), &cm()).unwrap();
        assert_eq!(c.patch, Some(json!({ "data": { "c": "3" } })));
    }

    #[test]
    fn server_managed_fields_are_ignored() {
        let desired = json!({ "metadata": { "resourceVersion": "1", "uid": "other" }, "status": { "phase": "x" } });
        assert!(compute_change(&desired, Some(&live_cm()), &cm()).unwrap().patch.is_none());
    }

    #[test]
    fn server_set_annotations_are_ignored() {
        let k = MapCatalog::builtin().lookup("apps/v1", "Deployment").unwrap();
        let live = json!({ "metadata": { "annotations": { "deployment.kubernetes.io/revision": "4", "team": "a" } } });
        let desired = json!({ "metadata": { "annotations": { "deployment.kubernetes.io/revision": "1", "team": "a" } } });
        assert!(compute_change(&desired, Some(&live), &k).unwrap().patch.is_none());
    }

    #[test]
    fn numbers_compare_by_value() {
        let k = KindSchema::new("apps/v1", "Deployment", "deployments", true);
        let live = json!({ "spec": { "replicas": 3 } });
        assert!(compute_change(&json!({ "spec": { "replicas": 3.0 } }), Some(&live), &k).unwrap().patch.is_none());
        assert!(compute_change(&json!({ "spec": { "replicas": 4 } }), Some(&live), &k).unwrap().needs_update);
    }

    #[test]
    fn sequences_without_merge_key_replace_wholesale() {
        let k = KindSchema::new("v1", "Thing", "things", true);
        let live = json!({ "spec": { "args": ["a", "b"] } });
        let c = compute_change(&json!({ "spec": { "args": ["a"] } }), Some(&live), &k).unwrap();
        assert_eq!(c.patch, Some(json!({ "spec": { "args": ["a"] } })));
        // items compare under partial semantics too
        let live = json!({ "spec": { "rules": [{ "host": "x", "defaulted": true }] } });
        assert!(compute_change(&json!({ "spec": { "rules": [{ "host": "x" }] } }), Some(&live), &k).unwrap().patch.is_none());
    }

    #[test]
    fn keyed_sequences_merge_by_key() {
        let k = MapCatalog::builtin().lookup("apps/v1", "Deployment").unwrap();
        let live = json!({ "spec": { "template": { "spec": { "containers": [
            { "name": "app", "image": "app:1", "imagePullPolicy": "IfNotPresent" },
            { "name": "sidecar", "image": "side:1" }
        ] } } } });
        let desired = json!({ "spec": { "template": { "spec": { "containers": [ { "name": "app", "image": "app:2" } ] } } } });
        let c = compute_change(&desired, Some(&live), &k).unwrap();
        let sent = &c.patch.unwrap()["spec"]["template"]["spec"]["containers"];
        assert_eq!(sent, &json!([
            { "name": "app", "image": "app:2", "imagePullPolicy": "IfNotPresent" },
            { "name": "sidecar", "image": "side:1" }
        ]));
        let same = json!({ "spec": { "template": { "spec": { "containers": [ { "name": "sidecar", "image": "side:1" } ] } } } });
        assert!(compute_change(&same, Some(&live), &k).unwrap().patch.is_none());
    }

    #[test]
    fn keyed_sequences_append_new_items() {
        let k = MapCatalog::builtin().lookup("v1", "Service").unwrap();
        let live = json!({ "spec": { "ports": [{ "port": 80, "protocol": "TCP" }] } });
        let desired = json!({ "spec": { "ports": [{ "port": 443 }] } });
        let c = compute_change(&desired, Some(&live), &k).unwrap();
        assert_eq!(c.patch, Some(json!({ "spec": { "ports": [{ "port": 80, "protocol": "TCP" }, { "port": 443 }] } })));
    }

    #[test]
    fn non_mapping_desired_is_rejected() {
        assert!(compute_change(&json!([1]), Some(&live_cm()), &cm()).is_err());
    }

    #[test]
    fn summary_counts_adds_updates_removes() {
        let live = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3], "gone": "y" });
        let patch = json!({ "a": 2, "b": { "y": 2 }, "c": [1, 9], "d": true, "gone": null });
        let s = summarize(&patch, &live);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 2);
    }
}
