//! In-process cluster stand-in. Records every call so tests can assert exactly which
//! operations a reconciliation issued.

use std::collections::{BTreeMap, HashMap};

use konverge_core::{patch::merged, FieldPath, ResourceDocument, ResourceIdentity, TransportError};
use serde_json::{json, Value as Json};
use tokio::sync::Mutex;

use crate::{selector::Selector, ListQuery, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

impl CallKind {
    pub fn is_mutating(self) -> bool {
        matches!(self, CallKind::Create | CallKind::Patch | CallKind::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    /// Rendered identity (or gvk key for lists).
    pub target: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, Option<String>, String), ResourceDocument>,
    calls: Vec<Call>,
    rv: u64,
    immutable: Vec<(String, FieldPath)>,
    defaults: HashMap<String, ResourceDocument>,
    failures: HashMap<CallKind, TransportError>,
}

impl State {
    fn bump(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }
}

fn key(id: &ResourceIdentity) -> (String, Option<String>, String) {
    (id.gvk_key(), id.namespace.clone(), id.name.clone())
}

fn not_found(id: &ResourceIdentity) -> TransportError {
    TransportError::new(Some(404), Some("NotFound"), format!("{} not found", id))
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject patches that change `path` on `gvk_key` objects with a 422 immutable error.
    pub async fn with_immutable(self, gvk_key: &str, path: &str) -> Self {
        if let Ok(p) = FieldPath::parse(path) {
            self.state.lock().await.immutable.push((gvk_key.to_string(), p));
        }
        self
    }

    /// Server-side defaults merged under every created object of `gvk_key`.
    pub async fn with_defaults(self, gvk_key: &str, defaults: ResourceDocument) -> Self {
        self.state.lock().await.defaults.insert(gvk_key.to_string(), defaults);
        self
    }

    /// Store an object as-is, without recording a call.
    pub async fn seed(&self, id: &ResourceIdentity, mut doc: ResourceDocument) {
        let mut st = self.state.lock().await;
        let rv = st.bump();
        stamp(&mut doc, id, &rv);
        st.objects.insert(key(id), doc);
    }

    pub async fn object(&self, id: &ResourceIdentity) -> Option<ResourceDocument> {
        self.state.lock().await.objects.get(&key(id)).cloned()
    }

    /// Overwrite `status` the way a controller would.
    pub async fn set_status(&self, id: &ResourceIdentity, status: Json) -> bool {
        let mut st = self.state.lock().await;
        match st.objects.get_mut(&key(id)) {
            Some(obj) => {
                if let Some(map) = obj.as_object_mut() {
                    map.insert("status".into(), status);
                }
                true
            }
            None => false,
        }
    }

    /// Remove an object without recording a call (an external actor deleting it).
    pub async fn evict(&self, id: &ResourceIdentity) -> Option<ResourceDocument> {
        self.state.lock().await.objects.remove(&key(id))
    }

    /// Make the next call of `kind` fail with `err`.
    pub async fn fail_next(&self, kind: CallKind, err: TransportError) {
        self.state.lock().await.failures.insert(kind, err);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count(&self, kind: CallKind) -> usize {
        self.state.lock().await.calls.iter().filter(|c| c.kind == kind).count()
    }

    pub async fn mutating_calls(&self) -> usize {
        self.state.lock().await.calls.iter().filter(|c| c.kind.is_mutating()).count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    async fn begin(&self, kind: CallKind, target: String) -> Result<tokio::sync::MutexGuard<'_, State>, TransportError> {
        let mut st = self.state.lock().await;
        st.calls.push(Call { kind, target });
        match st.failures.remove(&kind) {
            Some(err) => Err(err),
            None => Ok(st),
        }
    }
}

fn stamp(doc: &mut ResourceDocument, id: &ResourceIdentity, rv: &str) {
    if !doc.is_object() {
        *doc = json!({});
    }
    if let Some(map) = doc.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(id.api_version.clone()));
        map.insert("kind".into(), Json::String(id.kind.clone()));
        let meta = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(id.name.clone()));
            match &id.namespace {
                Some(ns) => { m.insert("namespace".into(), Json::String(ns.clone())); }
                None => { m.remove("namespace"); }
            }
            m.entry("uid").or_insert_with(|| Json::String(format!("mem-{}", rv)));
            m.entry("creationTimestamp").or_insert_with(|| Json::String("1970-01-01T00:00:00Z".into()));
            m.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError> {
        let st = self.begin(CallKind::Get, id.to_string()).await?;
        Ok(st.objects.get(&key(id)).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError> {
        let st = self.begin(CallKind::List, query.gvk_key()).await?;
        let labels = Selector::parse(query.label_selector.as_deref().unwrap_or(""))?;
        let fields = Selector::parse(query.field_selector.as_deref().unwrap_or(""))?;
        let gvk = query.gvk_key();
        Ok(st
            .objects
            .iter()
            .filter(|((g, ns, _), _)| *g == gvk && (query.namespace.is_none() || *ns == query.namespace))
            .map(|(_, doc)| doc)
            .filter(|doc| labels.matches_labels(doc) && fields.matches_fields(doc))
            .cloned()
            .collect())
    }

    async fn create(&self, id: &ResourceIdentity, doc: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let mut st = self.begin(CallKind::Create, id.to_string()).await?;
        if st.objects.contains_key(&key(id)) {
            return Err(TransportError::new(Some(409), Some("AlreadyExists"), format!("{} already exists", id)));
        }
        let mut obj = match st.defaults.get(&id.gvk_key()) {
            Some(defaults) => merged(defaults.clone(), doc),
            None => doc.clone(),
        };
        let rv = st.bump();
        stamp(&mut obj, id, &rv);
        st.objects.insert(key(id), obj.clone());
        Ok(obj)
    }

    async fn patch(&self, id: &ResourceIdentity, patch: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let mut st = self.begin(CallKind::Patch, id.to_string()).await?;
        let current = st.objects.get(&key(id)).cloned().ok_or_else(|| not_found(id))?;
        let gvk = id.gvk_key();
        for (_, path) in st.immutable.iter().filter(|(g, _)| *g == gvk) {
            if let Some(wanted) = path.get(patch) {
                if path.get(&current) != Some(wanted) {
                    return Err(TransportError::new(
                        Some(422),
                        Some("Invalid"),
                        format!("{} is invalid: {}: Invalid value: field is immutable", id, path),
                    ));
                }
            }
        }
        let mut obj = merged(current, patch);
        let rv = st.bump();
        stamp(&mut obj, id, &rv);
        st.objects.insert(key(id), obj.clone());
        Ok(obj)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), TransportError> {
        let mut st = self.begin(CallKind::Delete, id.to_string()).await?;
        st.objects.remove(&key(id)).map(|_| ()).ok_or_else(|| not_found(id))
    }
}
