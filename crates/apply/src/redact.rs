//! Masking secret payloads in objects handed back to callers.

use serde_json::Value as Json;

pub const MASK: &str = "********";

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

fn is_secret(doc: &Json) -> bool {
    doc.get("kind").and_then(|k| k.as_str()) == Some("Secret")
        && doc.get("apiVersion").and_then(|v| v.as_str()).map_or(true, |v| v == "v1")
}

/// Keys stay visible, values do not. Secret `data`/`stringData` and any annotation whose key
/// mentions `secret` are masked; a Secret's last-applied annotation carries the payload too.
pub fn redact(doc: &mut Json) {
    let secret = is_secret(doc);
    if let Some(map) = doc.as_object_mut() {
        if secret {
            for field in ["data", "stringData"] {
                if let Some(Json::Object(entries)) = map.get_mut(field) {
                    for v in entries.values_mut() {
                        *v = Json::String(MASK.into());
                    }
                }
            }
        }
        let annotations = map
            .get_mut("metadata")
            .and_then(|m| m.get_mut("annotations"))
            .and_then(|a| a.as_object_mut());
        if let Some(ann) = annotations {
            for (k, v) in ann.iter_mut() {
                if k.to_ascii_lowercase().contains("secret") || (secret && k == LAST_APPLIED) {
                    *v = Json::String(MASK.into());
                }
            }
        }
    }
}

/// Redact every object of a `...List` document, or the document itself.
pub fn redact_all(doc: &mut Json) {
    match doc.get_mut("items").and_then(|i| i.as_array_mut()) {
        Some(items) => items.iter_mut().for_each(redact),
        None => redact(doc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_values_are_masked_keys_kept() {
        let mut s = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "s", "annotations": { LAST_APPLIED: "{\"data\":{}}", "team": "a" } },
            "data": { "password": "aHVudGVyMg==" },
            "stringData": { "token": "abc" }
        });
        redact(&mut s);
        assert_eq!(s["data"]["password"], MASK);
        assert_eq!(s["stringData"]["token"], MASK);
        assert_eq!(s["metadata"]["annotations"][LAST_APPLIED], MASK);
        assert_eq!(s["metadata"]["annotations"]["team"], "a");
    }

    #[test]
    fn configmaps_keep_data_but_lose_secret_annotations() {
        let mut c = json!({
            "kind": "ConfigMap",
            "metadata": { "annotations": { "vault.example.com/secret-ref": "path/x" } },
            "data": { "a": "1" }
        });
        redact(&mut c);
        assert_eq!(c["data"]["a"], "1");
        assert_eq!(c["metadata"]["annotations"]["vault.example.com/secret-ref"], MASK);
    }

    #[test]
    fn lists_are_redacted_per_item() {
        let mut l = json!({ "kind": "SecretList", "items": [ { "kind": "Secret", "data": { "k": "dg==" } } ] });
        redact_all(&mut l);
        assert_eq!(l["items"][0]["data"]["k"], MASK);
    }
}
