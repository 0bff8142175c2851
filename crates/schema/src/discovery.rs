//! Catalog population from the live cluster: discovery for scope and plurals, CRD
//! `openAPIV3Schema` for list-map merge keys.

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::{api::ListParams, Api, Client};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::{builtin, KindSchema, MapCatalog, SchemaCatalog};

/// Build a catalog from what the cluster serves. Built-in merge keys are carried over for
/// known kinds; CRD kinds get merge keys from `x-kubernetes-list-type: map` sequences.
pub async fn catalog_from_discovery(client: Client) -> Result<MapCatalog> {
    let served = konverge_kubehub::discover(client.clone()).await?;
    let known = {
        let mut c = MapCatalog::new();
        for k in builtin::kinds() { c.insert(k); }
        c
    };
    let crd_keys = match crd_merge_keys(client).await {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "CRD schema scan failed; custom kinds replace sequences wholesale");
            FxHashMap::default()
        }
    };
    let mut catalog = MapCatalog::new();
    for r in served {
        let av = r.api_version();
        let mut row = known.lookup(&av, &r.kind).unwrap_or_else(|| KindSchema::new(&av, &r.kind, &r.plural, r.namespaced));
        row.namespaced = r.namespaced;
        row.plural = r.plural.clone();
        if let Some(keys) = crd_keys.get(&r.gvk_key()) {
            for (path, key) in keys {
                row = row.with_merge_key(path, key);
            }
        }
        catalog.insert(row);
    }
    info!(kinds = catalog.len(), "schema catalog populated from discovery");
    Ok(catalog)
}

async fn crd_merge_keys(client: Client) -> Result<FxHashMap<String, Vec<(String, String)>>> {
    let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client);
    let crds = api.list(&ListParams::default()).await.context("listing CustomResourceDefinitions")?;
    let mut out = FxHashMap::default();
    for crd in crds {
        let v = serde_json::to_value(&crd)?;
        let spec = match v.get("spec") { Some(s) => s, None => continue };
        let group = spec.get("group").and_then(|s| s.as_str()).unwrap_or("");
        let kind = spec.get("names").and_then(|n| n.get("kind")).and_then(|s| s.as_str()).unwrap_or("");
        let versions = spec.get("versions").and_then(|vv| vv.as_array()).cloned().unwrap_or_default();
        for ver in versions {
            let name = match ver.get("name").and_then(|s| s.as_str()) { Some(n) => n, None => continue };
            let keys = ver
                .get("schema")
                .and_then(|s| s.get("openAPIV3Schema"))
                .map(derive_merge_keys_from_openapi)
                .unwrap_or_default();
            if !keys.is_empty() {
                debug!(group, kind, version = name, count = keys.len(), "crd merge keys");
                out.insert(format!("{}/{}/{}", group, name, kind), keys);
            }
        }
    }
    Ok(out)
}

/// Walk an OpenAPI v3 schema and collect `(path, key)` for every `x-kubernetes-list-type: map`
/// sequence. Paths run through sequence items without an index.
pub fn derive_merge_keys_from_openapi(schema: &Json) -> Vec<(String, String)> {
    fn walk(node: &Json, base: &str, depth: usize, out: &mut Vec<(String, String)>) {
        if depth > 8 { return; }
        let props = match node.get("properties").and_then(|p| p.as_object()) { Some(p) => p, None => return };
        for (k, v) in props.iter() {
            if base.is_empty() && k == "metadata" { continue; }
            let path = if base.is_empty() { k.clone() } else { format!("{}.{}", base, k) };
            match v.get("type").and_then(|s| s.as_str()).unwrap_or("") {
                "object" => walk(v, &path, depth + 1, out),
                "array" => {
                    let is_map = v.get("x-kubernetes-list-type").and_then(|s| s.as_str()) == Some("map");
                    let first_key = v
                        .get("x-kubernetes-list-map-keys")
                        .and_then(|a| a.as_array())
                        .and_then(|a| a.first())
                        .and_then(|s| s.as_str());
                    if let (true, Some(key)) = (is_map, first_key) {
                        out.push((path.clone(), key.to_string()));
                    }
                    if let Some(items) = v.get("items") {
                        walk(items, &path, depth + 1, out);
                    }
                }
                _ => {}
            }
        }
    }
    let mut out = Vec::new();
    walk(schema, "", 0, &mut out);
    out
}
