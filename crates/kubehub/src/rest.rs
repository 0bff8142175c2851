//! REST transport over kube-rs dynamic objects.

use std::collections::HashMap;

use konverge_core::{split_api_version, ResourceDocument, ResourceIdentity, TransportError};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{self, Scope},
    Client,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{record, ListQuery, Transport};

/// Talks to the API server directly. Cheap to share: the client is pooled and resolved
/// API resources are cached per GVK.
pub struct KubeTransport {
    client: Client,
    resources: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(HashMap::new()) }
    }

    async fn api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), TransportError> {
        let key = format!("{}/{}", api_version, kind);
        if let Some(hit) = self.resources.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(map_kube_err)?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources.write().await.insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), TransportError> {
        let (ar, namespaced) = self.api_resource(api_version, kind).await?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}

fn map_kube_err(e: kube::Error) -> TransportError {
    match e {
        kube::Error::Api(ae) => TransportError::new(Some(ae.code), Some(ae.reason.as_str()), ae.message),
        other => TransportError::io(other.to_string()),
    }
}

fn to_doc(mut obj: DynamicObject, ar: &ApiResource) -> Result<ResourceDocument, TransportError> {
    // list items come back without type meta
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    serde_json::to_value(&obj).map_err(|e| TransportError::io(format!("serializing {}: {}", ar.kind, e)))
}

impl KubeTransport {
    async fn get_inner(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError> {
        let (api, ar) = self.api(&id.api_version, &id.kind, id.namespace.as_deref()).await?;
        match api.get_opt(&id.name).await.map_err(map_kube_err)? {
            Some(obj) => Ok(Some(to_doc(obj, &ar)?)),
            None => Ok(None),
        }
    }

    async fn list_inner(&self, query: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError> {
        let (api, ar) = self.api(&query.api_version, &query.kind, query.namespace.as_deref()).await?;
        let mut lp = ListParams::default();
        if let Some(l) = query.label_selector.as_deref() { lp = lp.labels(l); }
        if let Some(f) = query.field_selector.as_deref() { lp = lp.fields(f); }
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        list.items.into_iter().map(|o| to_doc(o, &ar)).collect()
    }

    async fn create_inner(&self, id: &ResourceIdentity, doc: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let (api, ar) = self.api(&id.api_version, &id.kind, id.namespace.as_deref()).await?;
        let obj: DynamicObject = serde_json::from_value(doc.clone())
            .map_err(|e| TransportError::new(Some(400), Some("BadRequest"), format!("decoding {}: {}", id, e)))?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        to_doc(created, &ar)
    }

    async fn patch_inner(&self, id: &ResourceIdentity, patch: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let (api, ar) = self.api(&id.api_version, &id.kind, id.namespace.as_deref()).await?;
        let patched = api.patch(&id.name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(map_kube_err)?;
        to_doc(patched, &ar)
    }

    async fn delete_inner(&self, id: &ResourceIdentity) -> Result<(), TransportError> {
        let (api, _ar) = self.api(&id.api_version, &id.kind, id.namespace.as_deref()).await?;
        api.delete(&id.name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError> {
        let res = self.get_inner(id).await;
        record("rest", "get", &res);
        res
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError> {
        let res = self.list_inner(query).await;
        record("rest", "list", &res);
        res
    }

    async fn create(&self, id: &ResourceIdentity, doc: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let res = self.create_inner(id, doc).await;
        record("rest", "create", &res);
        res
    }

    async fn patch(&self, id: &ResourceIdentity, patch: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let res = self.patch_inner(id, patch).await;
        record("rest", "patch", &res);
        res
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), TransportError> {
        let res = self.delete_inner(id).await;
        record("rest", "delete", &res);
        res
    }
}
