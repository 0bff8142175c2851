//! Konverge lookup: side-effect-free reads composed from identity resolution and the fetcher.
//!
//! Never diffs and never mutates; absence is [`QueryResult::NotFound`], not an error.

#![forbid(unsafe_code)]

use std::sync::Arc;

use konverge_core::{Error, ResourceDocument, ResourceIdentity, Result};
use konverge_kubehub::{fetch, ListQuery, Transport};
use konverge_schema::{resolve_scope, SchemaCatalog};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    /// Kind, plural/singular resource name or `...List` kind.
    pub kind: String,
    pub api_version: Option<String>,
    pub namespace: Option<String>,
    /// When set, selects one object; selectors are ignored.
    pub name: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Object definition supplying `apiVersion`, `kind`, name and namespace for fields left unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<ResourceDocument>,
}

impl QueryRequest {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), ..Default::default() }
    }

    pub fn api_version(mut self, av: impl Into<String>) -> Self {
        self.api_version = Some(av.into());
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn definition(mut self, doc: ResourceDocument) -> Self {
        self.definition = Some(doc);
        self
    }

    /// Copy with unset fields taken from `definition`; explicitly set fields win.
    pub fn filled(&self) -> Result<QueryRequest> {
        let mut out = self.clone();
        if let Some(defn) = self.definition.as_ref() {
            let map = defn
                .as_object()
                .ok_or_else(|| Error::InvalidDocument("query definition must be a mapping".into()))?;
            let meta = map.get("metadata");
            if out.kind.trim().is_empty() {
                out.kind = text(map.get("kind")).unwrap_or_default();
            }
            out.api_version = out.api_version.take().or_else(|| text(map.get("apiVersion")));
            out.name = out.name.take().filter(|n| !n.is_empty()).or_else(|| text(meta.and_then(|m| m.get("name"))));
            out.namespace = out.namespace.take().or_else(|| text(meta.and_then(|m| m.get("namespace"))));
        }
        if out.kind.trim().is_empty() {
            return Err(Error::IdentityIncomplete("no kind given; set a kind or a definition carrying one".into()));
        }
        Ok(out)
    }
}

fn text(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    Object(ResourceDocument),
    List(Vec<ResourceDocument>),
    NotFound,
}

impl QueryResult {
    /// Flatten to a list: one object, all items, or nothing.
    pub fn into_items(self) -> Vec<ResourceDocument> {
        match self {
            QueryResult::Object(o) => vec![o],
            QueryResult::List(items) => items,
            QueryResult::NotFound => Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct Lookup {
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn SchemaCatalog>,
    default_namespace: Option<String>,
}

impl Lookup {
    pub fn new(transport: Arc<dyn Transport>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { transport, catalog, default_namespace: None }
    }

    /// Namespace for named reads of namespaced kinds when the request has none.
    pub fn with_default_namespace(mut self, ns: Option<String>) -> Self {
        self.default_namespace = ns.filter(|s| !s.is_empty());
        self
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResult> {
        let req = req.filled()?;
        match req.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => {
                let ns = req.namespace.as_deref().or(self.default_namespace.as_deref());
                let scope = resolve_scope(req.api_version.as_deref(), &req.kind, ns, self.catalog.as_ref())?;
                if scope.schema.namespaced && scope.namespace.is_none() {
                    return Err(Error::IdentityIncomplete(format!(
                        "{} {} is namespaced but no namespace was given",
                        scope.kind, name
                    )));
                }
                let id = ResourceIdentity { api_version: scope.api_version, kind: scope.kind, namespace: scope.namespace, name: name.to_string() };
                let out = match fetch(self.transport.as_ref(), &id).await? {
                    Some(doc) => QueryResult::Object(doc),
                    None => QueryResult::NotFound,
                };
                counter!("lookup_total", 1u64, "mode" => "get");
                debug!(target = %id, found = !matches!(out, QueryResult::NotFound), "lookup");
                Ok(out)
            }
            None => {
                let scope = resolve_scope(req.api_version.as_deref(), &req.kind, req.namespace.as_deref(), self.catalog.as_ref())?;
                let query = ListQuery {
                    api_version: scope.api_version,
                    kind: scope.kind,
                    namespace: scope.namespace,
                    label_selector: req.label_selector.clone().filter(|s| !s.is_empty()),
                    field_selector: req.field_selector.clone().filter(|s| !s.is_empty()),
                };
                let items = self.transport.list(&query).await?;
                counter!("lookup_total", 1u64, "mode" => "list");
                debug!(kind = %query.gvk_key(), namespace = ?query.namespace, count = items.len(), "lookup");
                Ok(QueryResult::List(items))
            }
        }
    }
}
