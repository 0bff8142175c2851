use std::path::PathBuf;
use std::time::Duration;

use konverge_kubehub::{TransportConfig, TransportKind};
use serde::{Deserialize, Serialize};

/// Where the schema catalog comes from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CatalogSource {
    /// Built-in rows only.
    Builtin,
    /// Live API discovery over the built-ins; REST transport only.
    #[default]
    Discovery,
}

impl std::str::FromStr for CatalogSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "builtin" => Ok(CatalogSource::Builtin),
            "discovery" => Ok(CatalogSource::Discovery),
            other => Err(anyhow::anyhow!("unknown catalog source {:?} (expect builtin or discovery)", other)),
        }
    }
}

/// Runtime configuration, environment-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub transport: TransportConfig,
    pub catalog: CatalogSource,
    /// Default namespace for namespaced kinds.
    pub namespace: Option<String>,
    pub wait_timeout: Duration,
    pub wait_poll: Duration,
    pub replace_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            catalog: CatalogSource::default(),
            namespace: None,
            wait_timeout: Duration::from_secs(120),
            wait_poll: Duration::from_millis(1000),
            replace_timeout: Duration::from_secs(60),
        }
    }
}

impl Settings {
    /// Read `KONVERGE_*` variables; unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        let get = |k: &str| var(k).filter(|v| !v.trim().is_empty());
        let num = |k: &str| get(k).and_then(|v| v.trim().parse::<u64>().ok());
        let kind = get("KONVERGE_TRANSPORT").and_then(|v| v.parse::<TransportKind>().ok()).unwrap_or_default();
        Self {
            transport: TransportConfig {
                kind,
                binary: get("KONVERGE_KUBECTL_BIN").map(PathBuf::from),
                kubeconfig: get("KONVERGE_KUBECONFIG").map(PathBuf::from),
                context: get("KONVERGE_CONTEXT"),
            },
            catalog: get("KONVERGE_CATALOG").and_then(|v| v.parse().ok()).unwrap_or_default(),
            namespace: get("KONVERGE_NAMESPACE"),
            wait_timeout: num("KONVERGE_WAIT_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.wait_timeout),
            wait_poll: num("KONVERGE_WAIT_POLL_MS").map(Duration::from_millis).unwrap_or(d.wait_poll),
            replace_timeout: num("KONVERGE_REPLACE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.replace_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_nothing_is_set() {
        let s = Settings::from_vars(|_| None);
        assert_eq!(s.transport.kind, TransportKind::Rest);
        assert_eq!(s.catalog, CatalogSource::Discovery);
        assert_eq!(s.wait_timeout, Duration::from_secs(120));
        assert_eq!(s.namespace, None);
    }

    #[test]
    fn reads_konverge_variables() {
        let vars: HashMap<&str, &str> = [
            ("KONVERGE_TRANSPORT", "oc"),
            ("KONVERGE_KUBECTL_BIN", "/usr/local/bin/oc"),
            ("KONVERGE_NAMESPACE", "apps"),
            ("KONVERGE_CATALOG", "builtin"),
            ("KONVERGE_WAIT_TIMEOUT_SECS", "30"),
            ("KONVERGE_WAIT_POLL_MS", "250"),
            ("KONVERGE_REPLACE_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(s.transport.kind, TransportKind::Oc);
        assert_eq!(s.transport.binary, Some(PathBuf::from("/usr/local/bin/oc")));
        assert_eq!(s.namespace.as_deref(), Some("apps"));
        assert_eq!(s.catalog, CatalogSource::Builtin);
        assert_eq!(s.wait_timeout, Duration::from_secs(30));
        assert_eq!(s.wait_poll, Duration::from_millis(250));
        assert_eq!(s.replace_timeout, Duration::from_secs(60));
    }
}
