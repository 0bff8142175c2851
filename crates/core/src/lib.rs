//! Konverge core types: documents, identities, apply intents and reconcile results.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
pub mod patch;
pub mod path;

pub use error::{Error, ErrorKind, Result, TransportError};
pub use path::FieldPath;

/// Desired or live object state. Always a JSON object at the root; key order is preserved.
pub type ResourceDocument = serde_json::Value;

pub mod prelude {
    pub use super::{
        ApplyIntent, ApplyOptions, Error, ErrorKind, FieldPath, IdentityOverrides, Phase, ReconcileError,
        ReconcileResult, ResourceDocument, ResourceIdentity, TransportError, WaitPolicy,
    };
}

/// Fully resolved address of a single object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    /// API group; empty for the core group.
    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    pub fn version(&self) -> &str {
        split_api_version(&self.api_version).1
    }

    /// `v1/Kind` for core kinds, `group/v1/Kind` otherwise.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Identity fields supplied separately from the document body. Set fields win over the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityOverrides {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApplyIntent {
    #[default]
    Present,
    Absent,
}

impl std::str::FromStr for ApplyIntent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "present" => Ok(ApplyIntent::Present),
            "absent" => Ok(ApplyIntent::Absent),
            other => Err(Error::InvalidDocument(format!("unknown state {:?} (expect present or absent)", other))),
        }
    }
}

/// Caller-supplied readiness check evaluated against the live document while waiting.
pub type Readiness = Arc<dyn Fn(&ResourceDocument) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub enum WaitPolicy {
    #[default]
    None,
    Until { timeout: Duration, interval: Duration, ready: Readiness },
}

impl WaitPolicy {
    pub fn until(timeout: Duration, interval: Duration, ready: Readiness) -> Self {
        WaitPolicy::Until { timeout, interval, ready }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, WaitPolicy::Until { .. })
    }
}

impl fmt::Debug for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPolicy::None => f.write_str("None"),
            WaitPolicy::Until { timeout, interval, .. } => f
                .debug_struct("Until")
                .field("timeout", timeout)
                .field("interval", interval)
                .finish_non_exhaustive(),
        }
    }
}

/// Readiness that holds as soon as the object can be read back.
pub fn exists() -> Readiness {
    Arc::new(|_doc: &ResourceDocument| true)
}

/// Readiness that holds when `status.conditions` has an entry of `type_` with status `"True"`.
pub fn condition_true(type_: &str) -> Readiness {
    let wanted = type_.to_string();
    Arc::new(move |doc: &ResourceDocument| {
        doc.get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .map(|conds| {
                conds.iter().any(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some(wanted.as_str())
                        && c.get("status").and_then(|s| s.as_str()) == Some("True")
                })
            })
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Replace (delete then create) when a patch hits an immutable field.
    pub force: bool,
    pub wait: WaitPolicy,
    /// Compute and report the outcome without issuing mutating calls.
    pub check_mode: bool,
    /// Strip secret payloads from the returned object.
    pub redact_secrets: bool,
}

/// Reconciler states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Resolving,
    Fetching,
    Diffing,
    Creating,
    Patching,
    Deleting,
    Waiting,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ReconcileError {
    fn from(e: &Error) -> Self {
        Self { kind: e.kind(), message: e.to_string() }
    }
}

/// Counts of keys a patch adds, changes and removes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Outcome of one reconciliation.
///
/// `changed` reports whether the cluster was (or, in check mode, would be) mutated.
/// A failure after a confirmed mutation keeps `changed = true`, so a `WaitTimeout`
/// after a successful create is distinguishable from a create that never happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub changed: bool,
    pub object: Option<ResourceDocument>,
    pub error: Option<ReconcileError>,
    pub patch: Option<ResourceDocument>,
    pub summary: DiffSummary,
    pub transitions: Vec<Phase>,
}

impl ReconcileResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Final state of the machine.
    pub fn phase(&self) -> Phase {
        if self.error.is_some() { Phase::Failed } else { Phase::Done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_splits_group_and_version() {
        let core = ResourceIdentity::new("v1", "ConfigMap", Some("ns"), "cfg");
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
        assert_eq!(core.gvk_key(), "v1/ConfigMap");
        assert_eq!(core.to_string(), "v1/ConfigMap ns/cfg");

        let apps = ResourceIdentity::new("apps/v1", "Deployment", None, "web");
        assert_eq!(apps.group(), "apps");
        assert_eq!(apps.version(), "v1");
        assert_eq!(apps.gvk_key(), "apps/v1/Deployment");
        assert_eq!(apps.to_string(), "apps/v1/Deployment web");
    }

    #[test]
    fn intent_parses_case_insensitively() {
        assert_eq!("Present".parse::<ApplyIntent>().unwrap(), ApplyIntent::Present);
        assert_eq!("absent".parse::<ApplyIntent>().unwrap(), ApplyIntent::Absent);
        assert!("gone".parse::<ApplyIntent>().is_err());
    }

    #[test]
    fn condition_true_matches_only_true_status() {
        let ready = condition_true("Available");
        let doc = serde_json::json!({
            "status": { "conditions": [
                { "type": "Progressing", "status": "True" },
                { "type": "Available", "status": "False" }
            ]}
        });
        assert!(!ready(&doc));
        let doc = serde_json::json!({
            "status": { "conditions": [ { "type": "Available", "status": "True" } ] }
        });
        assert!(ready(&doc));
        assert!(!ready(&serde_json::json!({})));
    }

    #[test]
    fn result_phase_follows_error() {
        let mut r = ReconcileResult::default();
        assert_eq!(r.phase(), Phase::Done);
        r.error = Some(ReconcileError { kind: ErrorKind::WaitTimeout, message: "late".into() });
        assert_eq!(r.phase(), Phase::Failed);
        assert_eq!(r.error_kind(), Some(ErrorKind::WaitTimeout));
    }
}
