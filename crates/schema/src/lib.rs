//! Konverge schema: the catalog of known kinds and resource identity resolution.
//!
//! The catalog is data, not code: each served kind is a [`KindSchema`] row keyed by
//! (apiVersion, kind) in a [`MapCatalog`], seeded with built-ins or populated from discovery.

#![forbid(unsafe_code)]

use konverge_core::FieldPath;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod builtin;
pub mod discovery;
pub mod resolve;

pub use discovery::catalog_from_discovery;
pub use resolve::{normalize, resolve, resolve_scope, split_list_kind, Resolved, Scope};

/// Fields the server owns on every kind; never compared, never patched.
pub const SERVER_MANAGED: &[&str] = &[
    "status",
    "metadata.resourceVersion",
    "metadata.uid",
    "metadata.generation",
    "metadata.creationTimestamp",
    "metadata.managedFields",
    "metadata.selfLink",
    "metadata.deletionTimestamp",
    "metadata.deletionGracePeriodSeconds",
];

/// Sequence at `path` whose items merge by the value of `key` instead of being replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeKey {
    pub path: FieldPath,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSchema {
    pub api_version: String,
    pub kind: String,
    /// Lowercase plural resource name (`configmaps`).
    pub plural: String,
    pub namespaced: bool,
    pub excluded_fields: Vec<FieldPath>,
    pub merge_keys: Vec<MergeKey>,
}

impl KindSchema {
    /// New row with the server-managed exclusions.
    pub fn new(api_version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
            excluded_fields: SERVER_MANAGED.iter().filter_map(|p| FieldPath::parse(p).ok()).collect(),
            merge_keys: Vec::new(),
        }
    }

    pub fn with_excluded(mut self, path: &str) -> Self {
        if let Ok(p) = FieldPath::parse(path) {
            if !self.excluded_fields.contains(&p) { self.excluded_fields.push(p); }
        }
        self
    }

    pub fn with_merge_key(mut self, path: &str, key: &str) -> Self {
        if let Ok(p) = FieldPath::parse(path) {
            self.merge_keys.retain(|m| m.path != p);
            self.merge_keys.push(MergeKey { path: p, key: key.to_string() });
        }
        self
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    pub fn is_excluded<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        self.excluded_fields.iter().any(|p| p.matches(keys))
    }

    pub fn merge_key_for<S: AsRef<str>>(&self, keys: &[S]) -> Option<&str> {
        self.merge_keys.iter().find(|m| m.path.matches(keys)).map(|m| m.key.as_str())
    }

    /// Matches a kind name, plural or singular resource name, case-insensitively.
    pub fn answers_to(&self, name: &str) -> bool {
        self.kind.eq_ignore_ascii_case(name) || self.plural.eq_ignore_ascii_case(name)
    }
}

/// Pluggable source of kind metadata.
pub trait SchemaCatalog: Send + Sync {
    fn lookup(&self, api_version: &str, kind: &str) -> Option<KindSchema>;

    fn kinds(&self) -> Vec<KindSchema>;

    /// All rows answering to `name` (kind, plural or singular), preferring exact kind spelling.
    fn find(&self, name: &str) -> Vec<KindSchema> {
        let mut out: Vec<KindSchema> = self.kinds().into_iter().filter(|k| k.answers_to(name)).collect();
        out.sort_by(|a, b| (a.kind != name).cmp(&(b.kind != name)).then(a.api_version.cmp(&b.api_version)));
        out
    }
}

/// Mapping-based registry.
#[derive(Debug, Clone, Default)]
pub struct MapCatalog {
    kinds: FxHashMap<(String, String), KindSchema>,
}

impl MapCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with the common core/apps/batch/networking/rbac kinds.
    pub fn builtin() -> Self {
        let mut c = Self::new();
        for k in builtin::kinds() {
            c.insert(k);
        }
        c
    }

    pub fn insert(&mut self, schema: KindSchema) {
        self.kinds.insert((schema.api_version.clone(), schema.kind.clone()), schema);
    }

    pub fn with(mut self, schema: KindSchema) -> Self {
        self.insert(schema);
        self
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl SchemaCatalog for MapCatalog {
    fn lookup(&self, api_version: &str, kind: &str) -> Option<KindSchema> {
        self.kinds.get(&(api_version.to_string(), kind.to_string())).cloned()
    }

    fn kinds(&self) -> Vec<KindSchema> {
        let mut v: Vec<KindSchema> = self.kinds.values().cloned().collect();
        v.sort_by(|a, b| a.api_version.cmp(&b.api_version).then(a.kind.cmp(&b.kind)));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rows_exclude_server_managed_fields() {
        let k = KindSchema::new("v1", "ConfigMap", "configmaps", true);
        assert!(k.is_excluded(&["status"]));
        assert!(k.is_excluded(&["metadata", "resourceVersion"]));
        assert!(!k.is_excluded(&["metadata", "labels"]));
        assert!(!k.is_excluded(&["data"]));
    }

    #[test]
    fn merge_keys_are_addressed_by_full_path() {
        let k = KindSchema::new("apps/v1", "Deployment", "deployments", true)
            .with_merge_key("spec.template.spec.containers", "name");
        assert_eq!(k.merge_key_for(&["spec", "template", "spec", "containers"]), Some("name"));
        assert_eq!(k.merge_key_for(&["spec", "containers"]), None);
    }

    #[test]
    fn builtin_catalog_knows_common_kinds() {
        let c = MapCatalog::builtin();
        let cm = c.lookup("v1", "ConfigMap").unwrap();
        assert!(cm.namespaced);
        assert!(!c.lookup("v1", "Namespace").unwrap().namespaced);
        assert!(c.lookup("apps/v1", "Deployment").unwrap().merge_key_for(&["spec", "template", "spec", "containers"]).is_some());
        assert!(c.lookup("v1", "Widget").is_none());
    }

    #[test]
    fn annotation_keys_with_dots_can_be_excluded() {
        let d = MapCatalog::builtin().lookup("apps/v1", "Deployment").unwrap();
        assert!(d.is_excluded(&["metadata", "annotations", "deployment.kubernetes.io/revision"]));
        assert!(!d.is_excluded(&["metadata", "annotations", "team"]));
    }

    #[test]
    fn find_matches_kind_and_plural() {
        let c = MapCatalog::builtin();
        assert_eq!(c.find("configmaps")[0].kind, "ConfigMap");
        assert_eq!(c.find("deployment")[0].api_version, "apps/v1");
        assert!(c.find("widgets").is_empty());
    }
}
