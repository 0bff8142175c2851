//! Konverge public API façade (in-process).
//!
//! Frontends (the CLI, automation wrappers) depend on [`KonvergeApi`]; [`Konverge`] is the
//! in-process implementation wiring transport, catalog, reconciler and lookup together.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use konverge_apply::{DocumentSource, Reconciler};
use konverge_core::{
    condition_true, exists, ApplyIntent, ApplyOptions, ErrorKind, IdentityOverrides, ReconcileResult, ResourceDocument,
    WaitPolicy,
};
use konverge_kubehub::{Transport, TransportKind};
use konverge_lookup::Lookup;
use konverge_schema::{MapCatalog, SchemaCatalog};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod settings;

pub use konverge_lookup::{QueryRequest, QueryResult};
pub use settings::{CatalogSource, Settings};

/// A served resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl From<konverge_schema::KindSchema> for ResourceKind {
    fn from(k: konverge_schema::KindSchema) -> Self {
        Self { api_version: k.api_version, kind: k.kind, plural: k.plural, namespaced: k.namespaced }
    }
}

/// One reconciliation in a batch.
#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    pub doc: ResourceDocument,
    pub overrides: IdentityOverrides,
    pub intent: ApplyIntent,
    pub options: ApplyOptions,
}

/// API errors for failures outside a reconciliation (which report through [`ReconcileResult`]).
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KonvergeError {
    #[error("{kind}: {message}")]
    Core { kind: ErrorKind, message: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<konverge_core::Error> for KonvergeError {
    fn from(e: konverge_core::Error) -> Self {
        KonvergeError::Core { kind: e.kind(), message: e.to_string() }
    }
}

impl KonvergeError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            KonvergeError::Core { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type KonvergeResult<T> = Result<T, KonvergeError>;

/// Declarative Konverge API surface.
#[async_trait::async_trait]
pub trait KonvergeApi: Send + Sync {
    /// Kinds the catalog can address.
    async fn discover(&self) -> KonvergeResult<Vec<ResourceKind>>;

    /// Reconcile every document in `source`, in order. A failed document does not stop later ones.
    async fn apply(
        &self,
        source: &DocumentSource,
        overrides: &IdentityOverrides,
        intent: ApplyIntent,
        options: &ApplyOptions,
    ) -> KonvergeResult<Vec<ReconcileResult>>;

    /// Independent reconciliations run concurrently; results keep request order.
    async fn apply_batch(&self, requests: Vec<ApplyRequest>) -> Vec<ReconcileResult>;

    /// Read-only lookup.
    async fn query(&self, request: &QueryRequest) -> KonvergeResult<QueryResult>;
}

/// In-process implementation.
#[derive(Clone)]
pub struct Konverge {
    settings: Settings,
    catalog: Arc<dyn SchemaCatalog>,
    reconciler: Reconciler,
    lookup: Lookup,
}

impl Konverge {
    /// Open the configured transport and build the catalog.
    pub async fn connect(settings: Settings) -> KonvergeResult<Self> {
        let t0 = Instant::now();
        let transport = konverge_kubehub::connect(&settings.transport).await.map_err(|e| KonvergeError::Internal(format!("{:#}", e)))?;
        let catalog = load_catalog(&settings).await;
        info!(kinds = catalog.kinds().len(), took_ms = %t0.elapsed().as_millis(), "api: connected");
        Ok(Self::with_parts(transport, catalog, settings))
    }

    /// Assemble from an existing transport and catalog.
    pub fn with_parts(transport: Arc<dyn Transport>, catalog: Arc<dyn SchemaCatalog>, settings: Settings) -> Self {
        let reconciler = Reconciler::new(transport.clone(), catalog.clone())
            .with_default_namespace(settings.namespace.clone())
            .with_replace_timeout(settings.replace_timeout, settings.wait_poll);
        let lookup = Lookup::new(transport, catalog.clone()).with_default_namespace(settings.namespace.clone());
        Self { settings, catalog, reconciler, lookup }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Wait policy from the configured defaults: `condition` names a status condition type
    /// that must be `True`; without one the object only has to exist.
    pub fn wait_policy(&self, condition: Option<&str>, timeout: Option<Duration>) -> WaitPolicy {
        let ready = match condition.filter(|c| !c.is_empty()) {
            Some(c) => condition_true(c),
            None => exists(),
        };
        WaitPolicy::until(timeout.unwrap_or(self.settings.wait_timeout), self.settings.wait_poll, ready)
    }
}

async fn load_catalog(settings: &Settings) -> Arc<dyn SchemaCatalog> {
    if settings.catalog == CatalogSource::Builtin || settings.transport.kind != TransportKind::Rest {
        return Arc::new(MapCatalog::builtin());
    }
    let client = konverge_kubehub::get_kube_client(settings.transport.kubeconfig.as_deref(), settings.transport.context.as_deref()).await;
    let discovered = match client {
        Ok(c) => konverge_schema::catalog_from_discovery(c).await,
        Err(e) => Err(e),
    };
    match discovered {
        Ok(cat) => Arc::new(cat),
        Err(e) => {
            warn!(error = %e, "api: discovery failed; using built-in catalog");
            Arc::new(MapCatalog::builtin())
        }
    }
}

#[async_trait::async_trait]
impl KonvergeApi for Konverge {
    async fn discover(&self) -> KonvergeResult<Vec<ResourceKind>> {
        Ok(self.catalog.kinds().into_iter().map(ResourceKind::from).collect())
    }

    async fn apply(
        &self,
        source: &DocumentSource,
        overrides: &IdentityOverrides,
        intent: ApplyIntent,
        options: &ApplyOptions,
    ) -> KonvergeResult<Vec<ReconcileResult>> {
        let t0 = Instant::now();
        let docs = source.load()?;
        if docs.is_empty() && overrides.kind.is_none() {
            return Err(KonvergeError::Validation("no resource definition given".into()));
        }
        // Overrides alone can address one object.
        let docs = if docs.is_empty() { vec![serde_json::json!({})] } else { docs };
        let mut out = Vec::with_capacity(docs.len());
        for doc in &docs {
            out.push(self.reconciler.apply(doc, overrides, intent, options).await);
        }
        let changed = out.iter().filter(|r| r.changed).count();
        let failed = out.iter().filter(|r| !r.is_ok()).count();
        info!(docs = out.len(), changed, failed, took_ms = %t0.elapsed().as_millis(), "api: apply done");
        Ok(out)
    }

    async fn apply_batch(&self, requests: Vec<ApplyRequest>) -> Vec<ReconcileResult> {
        let futs = requests
            .iter()
            .map(|r| self.reconciler.apply(&r.doc, &r.overrides, r.intent, &r.options));
        futures::future::join_all(futs).await
    }

    async fn query(&self, request: &QueryRequest) -> KonvergeResult<QueryResult> {
        Ok(self.lookup.query(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_kubehub::memory::{CallKind, MemoryTransport};
    use serde_json::json;

    fn api() -> (Arc<MemoryTransport>, Konverge) {
        let mem = Arc::new(MemoryTransport::new());
        let settings = Settings { namespace: Some("ns".into()), ..Settings::default() };
        let k = Konverge::with_parts(mem.clone(), Arc::new(MapCatalog::builtin()), settings);
        (mem, k)
    }

    #[tokio::test]
    async fn multi_document_text_applies_in_order() {
        let (mem, k) = api();
        let src = DocumentSource::Text(
            "kind: Namespace\nmetadata:\n  name: team\n---\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: team\ndata:\n  a: \"1\"\n".into(),
        );
        let res = k.apply(&src, &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await.unwrap();
        assert_eq!(res.len(), 2);
        assert!(res.iter().all(|r| r.is_ok() && r.changed));
        let calls = mem.calls().await;
        let creates: Vec<_> = calls.iter().filter(|c| c.kind == CallKind::Create).map(|c| c.target.clone()).collect();
        assert_eq!(creates, vec!["v1/Namespace team".to_string(), "v1/ConfigMap team/cfg".to_string()]);
    }

    #[tokio::test]
    async fn overrides_alone_address_an_object() {
        let (mem, k) = api();
        let ov = IdentityOverrides { kind: Some("ConfigMap".into()), name: Some("only".into()), ..Default::default() };
        let res = k.apply(&DocumentSource::Text(String::new()), &ov, ApplyIntent::Present, &ApplyOptions::default()).await.unwrap();
        assert!(res[0].changed);
        assert_eq!(mem.count(CallKind::Create).await, 1);
    }

    #[tokio::test]
    async fn empty_source_without_overrides_is_rejected() {
        let (_mem, k) = api();
        let e = k.apply(&DocumentSource::Text("".into()), &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(e, KonvergeError::Validation(_)));
    }

    #[tokio::test]
    async fn batch_results_keep_request_order() {
        let (_mem, k) = api();
        let reqs: Vec<ApplyRequest> = (0..5)
            .map(|i| ApplyRequest { doc: json!({ "kind": "ConfigMap", "metadata": { "name": format!("c{}", i) } }), ..Default::default() })
            .chain(std::iter::once(ApplyRequest { doc: json!({ "kind": "Widget", "metadata": { "name": "w" } }), ..Default::default() }))
            .collect();
        let res = k.apply_batch(reqs).await;
        assert_eq!(res.len(), 6);
        assert!(res[..5].iter().all(|r| r.changed));
        assert_eq!(res[5].error_kind(), Some(ErrorKind::SchemaUnknown));
    }

    #[tokio::test]
    async fn query_goes_through_lookup() {
        let (_mem, k) = api();
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "q" } });
        k.apply(&DocumentSource::Inline(doc), &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await.unwrap();
        let hit = k.query(&QueryRequest::kind("ConfigMap").name("q")).await.unwrap();
        assert!(matches!(hit, QueryResult::Object(_)));
        let e = k.query(&QueryRequest::kind("Widget")).await.unwrap_err();
        assert_eq!(e.kind(), Some(ErrorKind::SchemaUnknown));
    }

    #[tokio::test]
    async fn discover_lists_catalog_kinds() {
        let (_mem, k) = api();
        let kinds = k.discover().await.unwrap();
        assert!(kinds.iter().any(|r| r.kind == "Deployment" && r.api_version == "apps/v1" && r.namespaced));
    }

    #[test]
    fn wait_policy_uses_defaults() {
        let (_mem, k) = api();
        match k.wait_policy(Some("Ready"), None) {
            WaitPolicy::Until { timeout, interval, .. } => {
                assert_eq!(timeout, Duration::from_secs(120));
                assert_eq!(interval, Duration::from_millis(1000));
            }
            WaitPolicy::None => panic!("expected a wait policy"),
        }
    }
}
