//! Loading desired documents from inline values, YAML/JSON text or files.

use std::path::PathBuf;

use konverge_core::{Error, ResourceDocument, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

fn max_yaml_bytes() -> usize {
    std::env::var("KONVERGE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KONVERGE_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// Bails out as soon as the walk reaches `max` nodes.
fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Where a desired document comes from. Inline and file sources are mutually exclusive.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Inline(ResourceDocument),
    /// YAML or JSON text, possibly several `---` separated documents.
    Text(String),
    File(PathBuf),
}

impl DocumentSource {
    /// Build from the two caller-facing inputs; exactly one may be set.
    pub fn pick(inline: Option<ResourceDocument>, file: Option<PathBuf>) -> Result<Option<Self>> {
        match (inline, file) {
            (Some(_), Some(_)) => Err(Error::InvalidDocument("an inline definition and a source file are mutually exclusive".into())),
            (Some(doc), None) => Ok(Some(DocumentSource::Inline(doc))),
            (None, Some(path)) => Ok(Some(DocumentSource::File(path))),
            (None, None) => Ok(None),
        }
    }

    /// All non-empty documents in the source, in order.
    pub fn load(&self) -> Result<Vec<ResourceDocument>> {
        match self {
            DocumentSource::Inline(doc) => {
                // An inline value may itself be YAML text.
                if let Json::String(text) = doc {
                    return parse_documents(text);
                }
                if node_budget_exceeded(doc, max_yaml_nodes()) {
                    return Err(Error::InvalidDocument(format!("document too complex (>{} nodes)", max_yaml_nodes())));
                }
                match doc {
                    Json::Array(items) => Ok(items.iter().filter(|d| !d.is_null()).cloned().collect()),
                    other => Ok(vec![other.clone()]),
                }
            }
            DocumentSource::Text(text) => parse_documents(text),
            DocumentSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::InvalidDocument(format!("reading {}: {}", path.display(), e)))?;
                debug!(path = %path.display(), bytes = text.len(), "loaded source file");
                parse_documents(&text)
            }
        }
    }
}

/// Parse `---` separated YAML (JSON is a subset) under the size and node budgets.
pub fn parse_documents(text: &str) -> Result<Vec<ResourceDocument>> {
    if text.len() > max_yaml_bytes() {
        return Err(Error::InvalidDocument(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de).map_err(|e| Error::InvalidDocument(format!("parsing YAML document {}: {}", i + 1, e)))?;
        let json = serde_json::to_value(val).map_err(|e| Error::InvalidDocument(format!("converting YAML document {} to JSON: {}", i + 1, e)))?;
        if json.is_null() {
            continue;
        }
        if !json.is_object() {
            return Err(Error::InvalidDocument(format!("YAML document {} is not a mapping", i + 1)));
        }
        if node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(Error::InvalidDocument(format!("YAML document too complex (>{} nodes)", max_yaml_nodes())));
        }
        out.push(json);
    }
    Ok(out)
}
