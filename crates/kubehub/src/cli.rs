//! Exec transport: drives `kubectl` or `oc` as a child process with `-o json`.
//!
//! Errors are recovered from the binary's `Error from server (Reason): ...` stderr line so
//! callers see the same status taxonomy as the REST transport.

use std::path::PathBuf;
use std::process::Stdio;

use konverge_core::{split_api_version, ResourceDocument, ResourceIdentity, TransportError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{record, ListQuery, Transport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub binary: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Appended to every invocation before the verb.
    pub extra_args: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self { binary: PathBuf::from("kubectl"), kubeconfig: None, context: None, extra_args: Vec::new() }
    }
}

pub struct CliTransport {
    cfg: CliConfig,
}

static SERVER_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Error from server \((?P<reason>[A-Za-z]+)\)").expect("literal regex is valid"));

fn status_for_reason(reason: &str) -> Option<u16> {
    Some(match reason {
        "BadRequest" => 400,
        "Unauthorized" => 401,
        "Forbidden" => 403,
        "NotFound" => 404,
        "MethodNotAllowed" => 405,
        "AlreadyExists" | "Conflict" => 409,
        "Gone" | "Expired" => 410,
        "Invalid" => 422,
        "TooManyRequests" => 429,
        "InternalError" => 500,
        "ServiceUnavailable" => 503,
        "Timeout" | "ServerTimeout" => 504,
        _ => return None,
    })
}

/// Translate the binary's stderr into a [`TransportError`].
pub fn parse_cli_error(stderr: &str) -> TransportError {
    let message = stderr.trim().to_string();
    match SERVER_ERROR.captures(stderr).and_then(|c| c.name("reason")) {
        Some(m) => TransportError::new(status_for_reason(m.as_str()), Some(m.as_str()), message),
        None => TransportError::io(message),
    }
}

/// kubectl resource argument: `Kind` for the core group, `Kind.version.group` otherwise.
pub fn resource_arg(api_version: &str, kind: &str) -> String {
    match split_api_version(api_version) {
        ("", _) => kind.to_string(),
        (group, version) => format!("{}.{}.{}", kind, version, group),
    }
}

fn ns_args(namespace: Option<&str>) -> Vec<String> {
    match namespace {
        Some(ns) => vec!["-n".into(), ns.to_string()],
        None => Vec::new(),
    }
}

impl CliTransport {
    pub fn new(cfg: CliConfig) -> Self {
        Self { cfg }
    }

    /// Full argument vector for one invocation (connection flags first).
    pub fn command_args(&self, verb_args: Vec<String>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kc) = &self.cfg.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kc.display().to_string());
        }
        if let Some(ctx) = &self.cfg.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        args.extend(self.cfg.extra_args.iter().cloned());
        args.extend(verb_args);
        args
    }

    pub fn get_args(id: &ResourceIdentity) -> Vec<String> {
        let mut a = vec!["get".to_string(), resource_arg(&id.api_version, &id.kind), id.name.clone()];
        a.extend(ns_args(id.namespace.as_deref()));
        a.extend(["-o".to_string(), "json".to_string()]);
        a
    }

    pub fn list_args(q: &ListQuery) -> Vec<String> {
        let mut a = vec!["get".to_string(), resource_arg(&q.api_version, &q.kind)];
        match q.namespace.as_deref() {
            Some(ns) => a.extend(ns_args(Some(ns))),
            None => a.push("--all-namespaces".to_string()),
        }
        if let Some(l) = q.label_selector.as_deref() { a.extend(["-l".to_string(), l.to_string()]); }
        if let Some(f) = q.field_selector.as_deref() { a.extend(["--field-selector".to_string(), f.to_string()]); }
        a.extend(["-o".to_string(), "json".to_string()]);
        a
    }

    pub fn patch_args(id: &ResourceIdentity, patch: &ResourceDocument) -> Vec<String> {
        let mut a = vec!["patch".to_string(), resource_arg(&id.api_version, &id.kind), id.name.clone()];
        a.extend(ns_args(id.namespace.as_deref()));
        a.extend(["--type".to_string(), "merge".to_string(), "-p".to_string(), patch.to_string()]);
        a.extend(["-o".to_string(), "json".to_string()]);
        a
    }

    pub fn delete_args(id: &ResourceIdentity) -> Vec<String> {
        let mut a = vec!["delete".to_string(), resource_arg(&id.api_version, &id.kind), id.name.clone()];
        a.extend(ns_args(id.namespace.as_deref()));
        a.push("--wait=false".to_string());
        a
    }

    pub fn create_args(id: &ResourceIdentity) -> Vec<String> {
        let mut a = vec!["create".to_string(), "-f".to_string(), "-".to_string()];
        a.extend(ns_args(id.namespace.as_deref()));
        a.extend(["-o".to_string(), "json".to_string()]);
        a
    }

    async fn run(&self, verb_args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
        let args = self.command_args(verb_args);
        debug!(binary = %self.cfg.binary.display(), args = ?args, "exec");
        let mut child = Command::new(&self.cfg.binary)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::io(format!("spawning {}: {}", self.cfg.binary.display(), e)))?;
        if let (Some(body), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&body).await.map_err(|e| TransportError::io(format!("writing stdin: {}", e)))?;
            // close stdin so the binary sees EOF
            drop(pipe);
        }
        let out = child.wait_with_output().await.map_err(|e| TransportError::io(format!("waiting for {}: {}", self.cfg.binary.display(), e)))?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(parse_cli_error(&String::from_utf8_lossy(&out.stderr)))
        }
    }

    async fn run_json(&self, verb_args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<ResourceDocument, TransportError> {
        let bytes = self.run(verb_args, stdin).await?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::io(format!("decoding {} output: {}", self.cfg.binary.display(), e)))
    }

    async fn get_inner(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError> {
        match self.run_json(Self::get_args(id), None).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_inner(&self, q: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError> {
        let list = self.run_json(Self::list_args(q), None).await?;
        Ok(list.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl Transport for CliTransport {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<ResourceDocument>, TransportError> {
        let res = self.get_inner(id).await;
        record("exec", "get", &res);
        res
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<ResourceDocument>, TransportError> {
        let res = self.list_inner(query).await;
        record("exec", "list", &res);
        res
    }

    async fn create(&self, id: &ResourceIdentity, doc: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let res = self.run_json(Self::create_args(id), Some(doc.to_string().into_bytes())).await;
        record("exec", "create", &res);
        res
    }

    async fn patch(&self, id: &ResourceIdentity, patch: &ResourceDocument) -> Result<ResourceDocument, TransportError> {
        let res = self.run_json(Self::patch_args(id, patch), None).await;
        record("exec", "patch", &res);
        res
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), TransportError> {
        let res = self.run(Self::delete_args(id), None).await.map(|_| ());
        record("exec", "delete", &res);
        res
    }
}
