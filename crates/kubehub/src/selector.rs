//! Minimal label/field selector matching for in-process listing.
//!
//! Supports the equality subset: `k=v`, `k==v`, `k!=v`, bare `k` (exists) and `!k`
//! (absent), comma separated. Set-based forms (`in`, `notin`) are rejected.

use konverge_core::{ResourceDocument, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Req {
    Eq(String, String),
    Ne(String, String),
    Exists(String),
    Absent(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Req>,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let mut reqs = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let req = if let Some((k, v)) = part.split_once("!=") {
                Req::Ne(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                Req::Eq(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = part.strip_prefix('!') {
                Req::Absent(k.trim().to_string())
            } else if part.contains(' ') || part.contains('(') {
                return Err(TransportError::new(Some(400), Some("BadRequest"), format!("unsupported selector {:?}", part)));
            } else {
                Req::Exists(part.to_string())
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    /// Labels: keys under `metadata.labels`.
    pub fn matches_labels(&self, doc: &ResourceDocument) -> bool {
        let labels = doc.get("metadata").and_then(|m| m.get("labels"));
        self.matches_with(|k| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str()).map(|s| s.to_string()))
    }

    /// Fields: dotted paths into the document (`metadata.name`, `status.phase`).
    pub fn matches_fields(&self, doc: &ResourceDocument) -> bool {
        self.matches_with(|k| {
            let mut cur = doc;
            for seg in k.split('.') {
                cur = cur.get(seg)?;
            }
            match cur {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            }
        })
    }

    fn matches_with(&self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        self.reqs.iter().all(|r| match r {
            Req::Eq(k, v) => lookup(k).as_deref() == Some(v.as_str()),
            Req::Ne(k, v) => lookup(k).as_deref() != Some(v.as_str()),
            Req::Exists(k) => lookup(k).is_some(),
            Req::Absent(k) => lookup(k).is_none(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> ResourceDocument {
        json!({ "metadata": { "name": "web", "namespace": "prod", "labels": { "app": "galaxy", "tier": "fe" } }, "status": { "phase": "Running" } })
    }

    #[test]
    fn label_equality_and_existence() {
        assert!(Selector::parse("app=galaxy").unwrap().matches_labels(&doc()));
        assert!(Selector::parse("app==galaxy,tier").unwrap().matches_labels(&doc()));
        assert!(!Selector::parse("app!=galaxy").unwrap().matches_labels(&doc()));
        assert!(Selector::parse("!canary").unwrap().matches_labels(&doc()));
        assert!(!Selector::parse("canary").unwrap().matches_labels(&doc()));
        assert!(Selector::parse("").unwrap().matches_labels(&doc()));
    }

    #[test]
    fn field_paths() {
        assert!(Selector::parse("metadata.name=web,status.phase=Running").unwrap().matches_fields(&doc()));
        assert!(!Selector::parse("metadata.namespace=dev").unwrap().matches_fields(&doc()));
    }

    #[test]
    fn set_based_is_rejected() {
        assert!(Selector::parse("env in (a,b)").is_err());
    }
}
