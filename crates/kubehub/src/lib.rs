//! Konverge kubehub: the transport boundary between reconciliation and the cluster.
//!
//! Everything that talks to a cluster goes through [`Transport`]. Three implementations ship:
//! [`rest::KubeTransport`] (kube-rs), [`cli::CliTransport`] (kubectl/oc exec) and
//! [`memory::MemoryTransport`] (in-process, used by tests). [`connect`] picks one from config.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use konverge_core::{Error, ResourceDocument, ResourceIdentity, TransportError};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod cli;
pub mod memory;
pub mod rest;
pub mod selector;

/// Read-side query over a kind: one namespace or all, optional selectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListQuery {
    pub api_version: String,
    pub kind: String,
    /// `None` lists across all namespaces (or the whole cluster for cluster-scoped kinds).
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListQuery {
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

/// Capability interface over "talk to the cluster".
///
/// Implementations must be usable from concurrent reconciliations; absence on `get` is
/// `Ok(None)`, never an error.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError>;
    async fn list(&self, query: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError>;
    async fn create(&self, id: &ResourceIdentity, doc: &ResourceDocument) -> Result<ResourceDocument, TransportError>;
    /// Apply a JSON merge patch.
    async fn patch(&self, id: &ResourceIdentity, patch: &ResourceDocument) -> Result<ResourceDocument, TransportError>;
    async fn delete(&self, id: &ResourceIdentity) -> Result<(), TransportError>;
}

pub(crate) fn record<T>(transport: &'static str, op: &'static str, res: &Result<T, TransportError>) {
    counter!("transport_calls_total", 1u64, "transport" => transport, "op" => op);
    if let Err(e) = res {
        // 404 on get is an answer, not a failure
        if !(op == "get" && e.is_not_found()) {
            counter!("transport_errors_total", 1u64, "transport" => transport, "op" => op);
        }
    }
}

/// Live-state fetch: exactly one `get`, absence is `Ok(None)`, failures are never retried here.
pub async fn fetch(transport: &dyn Transport, id: &ResourceIdentity) -> konverge_core::Result<Option<ResourceDocument>> {
    match transport.get(id).await {
        Ok(Some(doc)) => {
            debug!(target = %id, "fetch: live object found");
            Ok(Some(doc))
        }
        Ok(None) => {
            debug!(target = %id, "fetch: not found");
            Ok(None)
        }
        Err(e) => {
            warn!(target = %id, error = %e, "fetch failed");
            Err(Error::Transport(e))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Rest,
    Kubectl,
    Oc,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rest" | "api" => Ok(TransportKind::Rest),
            "kubectl" => Ok(TransportKind::Kubectl),
            "oc" => Ok(TransportKind::Oc),
            other => Err(anyhow!("unknown transport {:?} (expect rest, kubectl or oc)", other)),
        }
    }
}

/// Connection settings owned by the transport collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Binary for the exec transports; defaults to `kubectl` / `oc` on PATH.
    pub binary: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// Build the transport selected by `cfg`.
pub async fn connect(cfg: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match cfg.kind {
        TransportKind::Rest => {
            let client = get_kube_client(cfg.kubeconfig.as_deref(), cfg.context.as_deref()).await?;
            info!("transport: kube REST client ready");
            Ok(Arc::new(rest::KubeTransport::new(client)))
        }
        TransportKind::Kubectl | TransportKind::Oc => {
            let default_bin = if cfg.kind == TransportKind::Oc { "oc" } else { "kubectl" };
            let cli_cfg = cli::CliConfig {
                binary: cfg.binary.clone().unwrap_or_else(|| PathBuf::from(default_bin)),
                kubeconfig: cfg.kubeconfig.clone(),
                context: cfg.context.clone(),
                extra_args: Vec::new(),
            };
            info!(binary = %cli_cfg.binary.display(), "transport: exec client ready");
            Ok(Arc::new(cli::CliTransport::new(cli_cfg)))
        }
    }
}

/// Kube client from an explicit kubeconfig/context, else in-cluster or default kubeconfig.
pub async fn get_kube_client(kubeconfig: Option<&std::path::Path>, context: Option<&str>) -> Result<Client> {
    let opts = KubeConfigOptions { context: context.map(|s| s.to_string()), ..Default::default() };
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")?
        }
        None if context.is_some() => Config::from_kubeconfig(&opts).await.context("loading kubeconfig context")?,
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("creating kube client")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), "discovery done");
    Ok(out)
}
