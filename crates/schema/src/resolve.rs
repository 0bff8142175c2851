//! Resource identity resolution: explicit overrides over document fields, validated
//! against the catalog.

use konverge_core::{Error, IdentityOverrides, ResourceDocument, ResourceIdentity, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

use crate::{KindSchema, SchemaCatalog};

/// apiVersion used when neither the overrides nor the document carry one.
pub const DEFAULT_API_VERSION: &str = "v1";

static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("literal regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub identity: ResourceIdentity,
    pub schema: KindSchema,
}

/// Read-side target: a kind within one namespace, or across all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub schema: KindSchema,
}

fn doc_str<'a>(doc: &'a ResourceDocument, path: &[&str]) -> Option<&'a str> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(*seg)?;
    }
    cur.as_str().filter(|s| !s.is_empty())
}

fn pick(over: Option<&str>, doc: &ResourceDocument, path: &[&str]) -> Option<String> {
    over.filter(|s| !s.is_empty()).or_else(|| doc_str(doc, path)).map(|s| s.to_string())
}

/// `ConfigMapList` -> `ConfigMap`.
pub fn split_list_kind(kind: &str) -> Option<&str> {
    kind.strip_suffix("List").filter(|base| !base.is_empty())
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > 253 || name == "." || name == ".." || name.contains('/') || name.contains('%') {
        return Err(Error::InvalidDocument(format!("invalid object name {:?}", name)));
    }
    Ok(())
}

fn validate_namespace(ns: &str) -> Result<()> {
    if ns.len() > 63 || !NAMESPACE_RE.is_match(ns) {
        return Err(Error::InvalidDocument(format!("invalid namespace {:?}", ns)));
    }
    Ok(())
}

fn lookup_kind(catalog: &dyn SchemaCatalog, api_version: &str, kind: &str) -> Result<KindSchema> {
    catalog.lookup(api_version, kind).ok_or_else(|| Error::SchemaUnknown { api_version: api_version.to_string(), kind: kind.to_string() })
}

/// Resolve the identity of a single object. No side effects.
///
/// Overrides win over the document. Namespaced kinds take the override, then
/// `metadata.namespace`, then `default_namespace`; cluster-scoped kinds reject an explicit
/// namespace and ignore the default.
pub fn resolve(
    doc: &ResourceDocument,
    overrides: &IdentityOverrides,
    catalog: &dyn SchemaCatalog,
    default_namespace: Option<&str>,
) -> Result<Resolved> {
    if !(doc.is_object() || doc.is_null()) {
        return Err(Error::InvalidDocument("resource definition must be a mapping".into()));
    }
    let api_version = pick(overrides.api_version.as_deref(), doc, &["apiVersion"]).unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
    let kind = pick(overrides.kind.as_deref(), doc, &["kind"])
        .ok_or_else(|| Error::IdentityIncomplete("no kind given; set kind or provide it in the resource definition".into()))?;
    let schema = lookup_kind(catalog, &api_version, &kind)?;
    let name = pick(overrides.name.as_deref(), doc, &["metadata", "name"])
        .ok_or_else(|| Error::IdentityIncomplete(format!("no name given for {}/{}", api_version, kind)))?;
    validate_name(&name)?;

    let explicit_ns = pick(overrides.namespace.as_deref(), doc, &["metadata", "namespace"]);
    let namespace = if schema.namespaced {
        let ns = explicit_ns
            .or_else(|| default_namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()))
            .ok_or_else(|| Error::IdentityIncomplete(format!("{}/{} {} is namespaced but no namespace was given", api_version, kind, name)))?;
        validate_namespace(&ns)?;
        Some(ns)
    } else {
        if let Some(ns) = explicit_ns {
            return Err(Error::InvalidDocument(format!("{} is cluster-scoped; namespace {:?} is not allowed", kind, ns)));
        }
        None
    };
    Ok(Resolved { identity: ResourceIdentity { api_version, kind, namespace, name }, schema })
}

/// Resolve a read-side scope. `kind` may be a kind, a plural/singular resource name or a
/// `...List` kind; without an apiVersion the catalog's preferred match is used. No namespace
/// means all namespaces.
pub fn resolve_scope(
    api_version: Option<&str>,
    kind: &str,
    namespace: Option<&str>,
    catalog: &dyn SchemaCatalog,
) -> Result<Scope> {
    if kind.is_empty() {
        return Err(Error::IdentityIncomplete("no kind given".into()));
    }
    let base = split_list_kind(kind).unwrap_or(kind);
    let schema = match api_version.filter(|s| !s.is_empty()) {
        Some(av) => catalog
            .lookup(av, kind)
            .or_else(|| catalog.lookup(av, base))
            .or_else(|| catalog.find(kind).into_iter().chain(catalog.find(base)).find(|k| k.api_version == av))
            .ok_or_else(|| Error::SchemaUnknown { api_version: av.to_string(), kind: kind.to_string() })?,
        None => catalog
            .find(kind)
            .into_iter()
            .chain(catalog.find(base))
            .next()
            .ok_or_else(|| Error::SchemaUnknown { api_version: String::new(), kind: kind.to_string() })?,
    };
    let namespace = match namespace.filter(|s| !s.is_empty()) {
        Some(ns) if schema.namespaced => {
            validate_namespace(ns)?;
            Some(ns.to_string())
        }
        _ => None,
    };
    Ok(Scope { api_version: schema.api_version.clone(), kind: schema.kind.clone(), namespace, schema })
}

/// Copy of `doc` with apiVersion, kind, name and namespace set from `id`.
pub fn normalize(doc: &ResourceDocument, id: &ResourceIdentity) -> ResourceDocument {
    let mut out = match doc {
        Json::Object(_) => doc.clone(),
        _ => Json::Object(serde_json::Map::new()),
    };
    if let Some(map) = out.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(id.api_version.clone()));
        map.insert("kind".into(), Json::String(id.kind.clone()));
        let meta = map.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(serde_json::Map::new());
        }
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(id.name.clone()));
            match &id.namespace {
                Some(ns) => { m.insert("namespace".into(), Json::String(ns.clone())); }
                None => { m.remove("namespace"); }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MapCatalog;
    use konverge_core::ErrorKind;
    use serde_json::json;

    fn cat() -> MapCatalog {
        MapCatalog::builtin()
    }

    #[test]
    fn document_fields_resolve() {
        let doc = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cfg", "namespace": "ns" } });
        let r = resolve(&doc, &IdentityOverrides::default(), &cat(), None).unwrap();
        assert_eq!(r.identity, ResourceIdentity::new("v1", "ConfigMap", Some("ns"), "cfg"));
        assert!(r.schema.namespaced);
    }

    #[test]
    fn overrides_win_over_document() {
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "cfg", "namespace": "ns" } });
        let ov = IdentityOverrides { name: Some("other".into()), namespace: Some("prod".into()), ..Default::default() };
        let r = resolve(&doc, &ov, &cat(), None).unwrap();
        assert_eq!(r.identity.name, "other");
        assert_eq!(r.identity.namespace.as_deref(), Some("prod"));
        // apiVersion defaults to v1
        assert_eq!(r.identity.api_version, "v1");
    }

    #[test]
    fn identity_may_come_entirely_from_overrides() {
        let ov = IdentityOverrides { api_version: Some("apps/v1".into()), kind: Some("Deployment".into()), namespace: Some("ns".into()), name: Some("web".into()) };
        let r = resolve(&json!({ "spec": { "replicas": 2 } }), &ov, &cat(), None).unwrap();
        assert_eq!(r.identity.gvk_key(), "apps/v1/Deployment");
    }

    #[test]
    fn unknown_kind_is_schema_unknown() {
        let doc = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } });
        let e = resolve(&doc, &IdentityOverrides::default(), &cat(), Some("ns")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::SchemaUnknown);
    }

    #[test]
    fn namespaced_kind_needs_a_namespace() {
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "cfg" } });
        let e = resolve(&doc, &IdentityOverrides::default(), &cat(), None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::IdentityIncomplete);
        let r = resolve(&doc, &IdentityOverrides::default(), &cat(), Some("default")).unwrap();
        assert_eq!(r.identity.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn missing_name_or_kind_is_incomplete() {
        let e = resolve(&json!({ "kind": "ConfigMap" }), &IdentityOverrides::default(), &cat(), Some("ns")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::IdentityIncomplete);
        let e = resolve(&json!({ "metadata": { "name": "x" } }), &IdentityOverrides::default(), &cat(), Some("ns")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::IdentityIncomplete);
    }

    #[test]
    fn cluster_scoped_kinds_reject_namespace_and_ignore_default() {
        let doc = json!({ "kind": "Namespace", "metadata": { "name": "team-a" } });
        let r = resolve(&doc, &IdentityOverrides::default(), &cat(), Some("default")).unwrap();
        assert_eq!(r.identity.namespace, None);
        let doc = json!({ "kind": "Namespace", "metadata": { "name": "team-a", "namespace": "x" } });
        let e = resolve(&doc, &IdentityOverrides::default(), &cat(), None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidDocument);
    }

    #[test]
    fn rejects_bad_names_and_namespaces() {
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "a/b", "namespace": "ns" } });
        assert_eq!(resolve(&doc, &IdentityOverrides::default(), &cat(), None).unwrap_err().kind(), ErrorKind::InvalidDocument);
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "Not_Valid" } });
        assert_eq!(resolve(&doc, &IdentityOverrides::default(), &cat(), None).unwrap_err().kind(), ErrorKind::InvalidDocument);
        assert!(resolve(&json!("text"), &IdentityOverrides::default(), &cat(), None).is_err());
    }

    #[test]
    fn scope_accepts_plural_and_list_kinds() {
        let s = resolve_scope(None, "configmaps", Some("ns"), &cat()).unwrap();
        assert_eq!((s.api_version.as_str(), s.kind.as_str()), ("v1", "ConfigMap"));
        let s = resolve_scope(Some("apps/v1"), "DeploymentList", None, &cat()).unwrap();
        assert_eq!(s.kind, "Deployment");
        assert_eq!(s.namespace, None);
        let s = resolve_scope(None, "Namespace", Some("ns"), &cat()).unwrap();
        assert_eq!(s.namespace, None);
        assert_eq!(resolve_scope(None, "Widget", None, &cat()).unwrap_err().kind(), ErrorKind::SchemaUnknown);
    }

    #[test]
    fn normalize_fills_identity_fields() {
        let id = ResourceIdentity::new("v1", "ConfigMap", Some("ns"), "cfg");
        let out = normalize(&json!({ "data": { "a": "1" } }), &id);
        assert_eq!(out["apiVersion"], "v1");
        assert_eq!(out["kind"], "ConfigMap");
        assert_eq!(out["metadata"], json!({ "name": "cfg", "namespace": "ns" }));
        assert_eq!(out["data"]["a"], "1");
    }
}
