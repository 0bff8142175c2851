//! The reconciler: resolve, fetch, diff, then at most one create/patch/delete per phase.

use std::sync::Arc;
use std::time::{Duration, Instant};

use konverge_core::{
    patch::merged, ApplyIntent, ApplyOptions, Error, IdentityOverrides, Phase, ReconcileError, ReconcileResult,
    ResourceDocument, ResourceIdentity, WaitPolicy,
};
use konverge_kubehub::{fetch, ListQuery, Transport};
use konverge_schema::{normalize, resolve, resolve_scope, split_list_kind, SchemaCatalog};
use metrics::{counter, histogram};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::diff::{compute_change, summarize, without_nulls};
use crate::redact::redact_all;
use crate::wait::{wait_for, WaitTarget};

fn replace_timeout_default() -> Duration {
    let secs = std::env::var("KONVERGE_REPLACE_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60);
    Duration::from_secs(secs)
}

fn poll_interval_default() -> Duration {
    let ms = std::env::var("KONVERGE_WAIT_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
    Duration::from_millis(ms)
}

/// Converges one object per [`Reconciler::apply`] call.
///
/// Holds no per-call state, so one value can serve many concurrent reconciliations over a
/// shared transport.
#[derive(Clone)]
pub struct Reconciler {
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn SchemaCatalog>,
    default_namespace: Option<String>,
    replace_timeout: Duration,
    replace_interval: Duration,
}

/// Per-call bookkeeping; becomes the [`ReconcileResult`].
struct Run {
    started: Instant,
    intent: ApplyIntent,
    transitions: Vec<Phase>,
    result: ReconcileResult,
}

impl Run {
    fn new(intent: ApplyIntent) -> Self {
        counter!("reconcile_total", 1u64, "intent" => intent_label(intent));
        Self { started: Instant::now(), intent, transitions: Vec::new(), result: ReconcileResult::default() }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(?phase, "reconcile: enter");
        self.transitions.push(phase);
    }

    fn done(mut self) -> ReconcileResult {
        self.enter(Phase::Done);
        if self.result.changed {
            counter!("reconcile_changed_total", 1u64, "intent" => intent_label(self.intent));
        }
        self.finish()
    }

    fn fail(mut self, err: Error) -> ReconcileResult {
        let kind = err.kind();
        warn!(error = %err, kind = %kind, changed = self.result.changed, "reconcile failed");
        counter!("reconcile_failed_total", 1u64, "kind" => kind.as_str());
        self.enter(Phase::Failed);
        self.result.error = Some(ReconcileError::from(&err));
        self.finish()
    }

    fn finish(mut self) -> ReconcileResult {
        histogram!("reconcile_latency_ms", self.started.elapsed().as_secs_f64() * 1000.0);
        self.result.transitions = self.transitions;
        self.result
    }
}

fn intent_label(intent: ApplyIntent) -> &'static str {
    match intent {
        ApplyIntent::Present => "present",
        ApplyIntent::Absent => "absent",
    }
}

macro_rules! step {
    ($run:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => return $run.fail(err.into()),
        }
    };
}

impl Reconciler {
    pub fn new(transport: Arc<dyn Transport>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self {
            transport,
            catalog,
            default_namespace: None,
            replace_timeout: replace_timeout_default(),
            replace_interval: poll_interval_default(),
        }
    }

    /// Namespace used for namespaced kinds when neither overrides nor the document set one.
    pub fn with_default_namespace(mut self, ns: Option<String>) -> Self {
        self.default_namespace = ns.filter(|s| !s.is_empty());
        self
    }

    /// How long a force replace waits for the deleted object to disappear.
    pub fn with_replace_timeout(mut self, timeout: Duration, interval: Duration) -> Self {
        self.replace_timeout = timeout;
        self.replace_interval = interval;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn catalog(&self) -> &Arc<dyn SchemaCatalog> {
        &self.catalog
    }

    /// Converge one object toward `doc` under `intent`.
    ///
    /// Never returns `Err`: failures land in [`ReconcileResult::error`] with `changed`
    /// reporting whether a mutation was already accepted.
    pub async fn apply(
        &self,
        doc: &ResourceDocument,
        overrides: &IdentityOverrides,
        intent: ApplyIntent,
        options: &ApplyOptions,
    ) -> ReconcileResult {
        let run = Run::new(intent);
        let mut result = self.drive(run, doc, overrides, intent, options).await;
        if options.redact_secrets {
            if let Some(obj) = result.object.as_mut() {
                redact_all(obj);
            }
            if let Some(p) = result.patch.as_mut() {
                redact_all(p);
            }
        }
        result
    }

    async fn drive(
        &self,
        mut run: Run,
        doc: &ResourceDocument,
        overrides: &IdentityOverrides,
        intent: ApplyIntent,
        options: &ApplyOptions,
    ) -> ReconcileResult {
        run.enter(Phase::Resolving);
        if let Some(base) = self.list_kind(doc, overrides) {
            return self.read_list(run, doc, overrides, intent, base).await;
        }
        let resolved = step!(run, resolve(doc, overrides, self.catalog.as_ref(), self.default_namespace.as_deref()));
        let id = resolved.identity;
        let desired = normalize(doc, &id);
        info!(target = %id, ?intent, check_mode = options.check_mode, "reconcile");

        run.enter(Phase::Fetching);
        let live = step!(run, fetch(self.transport.as_ref(), &id).await);

        run.enter(Phase::Diffing);
        match (intent, live) {
            (ApplyIntent::Absent, None) => {
                debug!(target = %id, "already absent");
                run.done()
            }
            (ApplyIntent::Absent, Some(live)) => {
                if options.check_mode {
                    run.result.changed = true;
                    run.result.object = Some(live);
                    return run.done();
                }
                run.enter(Phase::Deleting);
                step!(run, self.transport.delete(&id).await);
                run.result.changed = true;
                info!(target = %id, "deleted");
                if let WaitPolicy::Until { timeout, interval, .. } = &options.wait {
                    run.enter(Phase::Waiting);
                    step!(run, wait_for(self.transport.as_ref(), &id, WaitTarget::Gone, *timeout, *interval).await);
                }
                run.done()
            }
            (ApplyIntent::Present, live) => {
                let change = step!(run, compute_change(&desired, live.as_ref(), &resolved.schema));
                if change.needs_create {
                    return self.create(run, &id, &desired, options).await;
                }
                let (live, patch) = match (live, change.patch) {
                    (Some(l), Some(p)) => (l, p),
                    (live, _) => {
                        debug!(target = %id, "already converged");
                        run.result.object = live;
                        return run.done();
                    }
                };
                run.result.summary = summarize(&patch, &live);
                run.result.patch = Some(patch.clone());
                if options.check_mode {
                    run.result.changed = true;
                    run.result.object = Some(merged(live, &patch));
                    return run.done();
                }
                self.patch(run, &id, &desired, &patch, options).await
            }
        }
    }

    async fn create(&self, mut run: Run, id: &ResourceIdentity, desired: &ResourceDocument, options: &ApplyOptions) -> ReconcileResult {
        let body = without_nulls(desired);
        run.result.summary = summarize(&body, &Json::Object(Default::default()));
        if options.check_mode {
            run.result.changed = true;
            run.result.object = Some(body);
            return run.done();
        }
        run.enter(Phase::Creating);
        let created = step!(run, self.transport.create(id, &body).await);
        run.result.changed = true;
        run.result.object = Some(created);
        info!(target = %id, "created");
        self.settle(run, id, options).await
    }

    async fn patch(
        &self,
        mut run: Run,
        id: &ResourceIdentity,
        desired: &ResourceDocument,
        patch: &ResourceDocument,
        options: &ApplyOptions,
    ) -> ReconcileResult {
        run.enter(Phase::Patching);
        match self.transport.patch(id, patch).await {
            Ok(obj) => {
                run.result.changed = true;
                run.result.object = Some(obj);
                info!(target = %id, "patched");
                self.settle(run, id, options).await
            }
            Err(e) if e.is_immutable_conflict() && options.force => {
                info!(target = %id, reason = %e, "immutable field changed; replacing");
                self.replace(run, id, desired, options).await
            }
            Err(e) if e.is_immutable_conflict() => {
                run.fail(Error::ImmutableFieldConflict { target: id.to_string(), message: e.message })
            }
            Err(e) => run.fail(e.into()),
        }
    }

    /// Delete then create, each exactly once.
    async fn replace(&self, mut run: Run, id: &ResourceIdentity, desired: &ResourceDocument, options: &ApplyOptions) -> ReconcileResult {
        run.enter(Phase::Deleting);
        step!(run, self.transport.delete(id).await);
        run.result.changed = true;
        run.result.object = None;
        step!(run, wait_for(self.transport.as_ref(), id, WaitTarget::Gone, self.replace_timeout, self.replace_interval).await);

        run.enter(Phase::Creating);
        let body = without_nulls(desired);
        let created = step!(run, self.transport.create(id, &body).await);
        run.result.object = Some(created);
        info!(target = %id, "replaced");
        self.settle(run, id, options).await
    }

    /// Optional `Waiting` after a create or patch.
    async fn settle(&self, mut run: Run, id: &ResourceIdentity, options: &ApplyOptions) -> ReconcileResult {
        if let WaitPolicy::Until { timeout, interval, ready } = &options.wait {
            run.enter(Phase::Waiting);
            let seen = step!(run, wait_for(self.transport.as_ref(), id, WaitTarget::Ready(ready), *timeout, *interval).await);
            if seen.is_some() {
                run.result.object = seen;
            }
        }
        run.done()
    }

    /// Base kind when the target is a `...List` kind the catalog does not serve directly.
    fn list_kind(&self, doc: &ResourceDocument, overrides: &IdentityOverrides) -> Option<String> {
        let kind = overrides.kind.as_deref().or_else(|| doc.get("kind").and_then(|k| k.as_str()))?;
        let av = overrides.api_version.as_deref().or_else(|| doc.get("apiVersion").and_then(|v| v.as_str())).unwrap_or("v1");
        if self.catalog.lookup(av, kind).is_some() {
            return None;
        }
        split_list_kind(kind).filter(|base| self.catalog.lookup(av, base).is_some()).map(|s| s.to_string())
    }

    /// `...List` kinds are read-only: `Present` returns the items, nothing is mutated.
    async fn read_list(
        &self,
        mut run: Run,
        doc: &ResourceDocument,
        overrides: &IdentityOverrides,
        intent: ApplyIntent,
        base: String,
    ) -> ReconcileResult {
        if intent == ApplyIntent::Absent {
            return run.fail(Error::InvalidDocument(format!("{}List is read-only; state=absent is not supported", base)));
        }
        let av = overrides.api_version.as_deref().or_else(|| doc.get("apiVersion").and_then(|v| v.as_str())).unwrap_or("v1");
        let ns = overrides
            .namespace
            .clone()
            .or_else(|| doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .or_else(|| self.default_namespace.clone());
        let scope = step!(run, resolve_scope(Some(av), &base, ns.as_deref(), self.catalog.as_ref()));
        run.enter(Phase::Fetching);
        let query = ListQuery { api_version: scope.api_version.clone(), kind: scope.kind.clone(), namespace: scope.namespace.clone(), ..Default::default() };
        let items = step!(run, self.transport.list(&query).await);
        debug!(kind = %scope.kind, count = items.len(), "list read");
        run.result.object = Some(json!({
            "apiVersion": scope.api_version,
            "kind": format!("{}List", scope.kind),
            "items": items,
        }));
        run.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_kubehub::memory::MemoryTransport;
    use konverge_schema::MapCatalog;

    fn reconciler(mem: Arc<MemoryTransport>) -> Reconciler {
        Reconciler::new(mem, Arc::new(MapCatalog::builtin())).with_default_namespace(Some("default".into()))
    }

    #[tokio::test]
    async fn transitions_for_create() {
        let mem = Arc::new(MemoryTransport::new());
        let r = reconciler(mem.clone());
        let doc = json!({ "kind": "ConfigMap", "metadata": { "name": "cfg" }, "data": { "a": "1" } });
        let res = r.apply(&doc, &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await;
        assert!(res.is_ok(), "{:?}", res.error);
        assert_eq!(res.transitions, vec![Phase::Resolving, Phase::Fetching, Phase::Diffing, Phase::Creating, Phase::Done]);
        assert_eq!(res.object.unwrap()["metadata"]["namespace"], "default");
    }

    #[tokio::test]
    async fn resolve_failures_make_no_calls() {
        let mem = Arc::new(MemoryTransport::new());
        let r = reconciler(mem.clone());
        let doc = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w" } });
        let res = r.apply(&doc, &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await;
        assert_eq!(res.error_kind(), Some(konverge_core::ErrorKind::SchemaUnknown));
        assert_eq!(res.transitions, vec![Phase::Resolving, Phase::Failed]);
        assert!(!res.changed);
        assert!(mem.calls().await.is_empty());
    }

    #[tokio::test]
    async fn list_kind_reads_without_mutating() {
        let mem = Arc::new(MemoryTransport::new());
        let id = ResourceIdentity::new("v1", "ConfigMap", Some("ns"), "a");
        mem.seed(&id, json!({ "data": {} })).await;
        let r = reconciler(mem.clone());
        let doc = json!({ "kind": "ConfigMapList", "metadata": { "namespace": "ns" } });
        let res = r.apply(&doc, &IdentityOverrides::default(), ApplyIntent::Present, &ApplyOptions::default()).await;
        assert!(res.is_ok(), "{:?}", res.error);
        assert!(!res.changed);
        let obj = res.object.unwrap();
        assert_eq!(obj["kind"], "ConfigMapList");
        assert_eq!(obj["items"].as_array().unwrap().len(), 1);
        assert_eq!(mem.mutating_calls().await, 0);

        let res = r.apply(&doc, &IdentityOverrides::default(), ApplyIntent::Absent, &ApplyOptions::default()).await;
        assert_eq!(res.error_kind(), Some(konverge_core::ErrorKind::InvalidDocument));
    }
}
