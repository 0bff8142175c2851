use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use konverge_api::{Konverge, KonvergeApi, QueryRequest, QueryResult, Settings};
use konverge_apply::DocumentSource;
use konverge_core::{ApplyIntent, ApplyOptions, IdentityOverrides, ReconcileResult, WaitPolicy};
use konverge_kubehub::TransportKind;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "konvergectl", version, about = "Converge cluster objects to a declared state")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Default namespace for namespaced kinds
    #[arg(long = "ns", global = true, env = "KONVERGE_NAMESPACE")]
    namespace: Option<String>,

    /// Transport: rest, kubectl or oc
    #[arg(long = "transport", global = true)]
    transport: Option<String>,

    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// Binary for the kubectl/oc transports
    #[arg(long = "kubectl-bin", global = true)]
    kubectl_bin: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum State { Present, Absent }

impl From<State> for ApplyIntent {
    fn from(s: State) -> Self {
        match s {
            State::Present => ApplyIntent::Present,
            State::Absent => ApplyIntent::Absent,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, update or delete objects so the cluster matches the definition
    Apply {
        /// YAML/JSON file, may hold several documents
        #[arg(short = 'f', long = "filename", conflicts_with = "definition")]
        file: Option<PathBuf>,
        /// Inline YAML/JSON definition
        #[arg(long = "definition")]
        definition: Option<String>,
        #[arg(long = "state", value_enum, default_value_t = State::Present)]
        state: State,
        /// Delete and recreate when a patch hits an immutable field
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Wait until the object is ready (or gone, for --state absent)
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Seconds; default from KONVERGE_WAIT_TIMEOUT_SECS
        #[arg(long = "wait-timeout")]
        wait_timeout: Option<u64>,
        /// Status condition type that must be True, e.g. Available
        #[arg(long = "wait-condition")]
        wait_condition: Option<String>,
        /// Report what would change without changing it
        #[arg(long = "check", action = ArgAction::SetTrue)]
        check: bool,
        /// Mask Secret payloads in the output
        #[arg(long = "redact-secrets", action = ArgAction::SetTrue)]
        redact_secrets: bool,
        #[arg(long = "kind")]
        kind: Option<String>,
        #[arg(long = "api-version")]
        api_version: Option<String>,
        #[arg(long = "name")]
        name: Option<String>,
    },
    /// Read one object by name, or list by selectors
    Get {
        /// Kind, resource name or ...List kind (e.g. ConfigMap, configmaps, ConfigMapList)
        #[arg(required_unless_present = "file")]
        kind: Option<String>,
        name: Option<String>,
        /// Definition file supplying apiVersion, kind, name and namespace
        #[arg(short = 'f', long = "filename")]
        file: Option<PathBuf>,
        #[arg(long = "api-version")]
        api_version: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
    },
    /// List kinds the catalog can address
    Discover,
}

fn init_tracing() {
    let env = std::env::var("KONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Environment first, flags on top.
fn settings_from(cli: &Cli) -> Result<Settings> {
    let mut s = Settings::from_env();
    if let Some(t) = cli.transport.as_deref() {
        s.transport.kind = TransportKind::from_str(t)?;
    }
    if cli.kubeconfig.is_some() { s.transport.kubeconfig = cli.kubeconfig.clone(); }
    if cli.context.is_some() { s.transport.context = cli.context.clone(); }
    if cli.kubectl_bin.is_some() { s.transport.binary = cli.kubectl_bin.clone(); }
    if cli.namespace.is_some() { s.namespace = cli.namespace.clone(); }
    Ok(s)
}

fn target_label(r: &ReconcileResult) -> String {
    let obj = match r.object.as_ref() {
        Some(o) => o,
        None => return "-".to_string(),
    };
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("?");
    let name = obj.pointer("/metadata/name").and_then(|v| v.as_str());
    match (obj.pointer("/metadata/namespace").and_then(|v| v.as_str()), name) {
        (Some(ns), Some(n)) => format!("{} {}/{}", kind, ns, n),
        (None, Some(n)) => format!("{} {}", kind, n),
        _ => kind.to_string(),
    }
}

fn print_results(output: Output, results: &[ReconcileResult]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(results)?),
        Output::Human => {
            for r in results {
                let status = match (&r.error, r.changed) {
                    (Some(e), true) => format!("partial ({}): {}", e.kind, e.message),
                    (Some(e), false) => format!("failed ({}): {}", e.kind, e.message),
                    (None, true) => "changed".to_string(),
                    (None, false) => "unchanged".to_string(),
                };
                println!("{:<10} {}", status, target_label(r));
                if r.changed && r.patch.is_some() {
                    println!("           +{} ~{} -{}", r.summary.adds, r.summary.updates, r.summary.removes);
                }
            }
        }
    }
    Ok(())
}

fn print_query(output: Output, res: &QueryResult) -> Result<()> {
    match (output, res) {
        (Output::Json, _) => println!("{}", serde_json::to_string_pretty(res)?),
        (Output::Human, QueryResult::NotFound) => eprintln!("not found"),
        (Output::Human, QueryResult::Object(doc)) => print!("{}", serde_yaml::to_string(doc)?),
        (Output::Human, QueryResult::List(items)) => {
            println!("{:<20} {}", "NAMESPACE", "NAME");
            for item in items {
                let ns = item.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("-");
                let name = item.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("?");
                println!("{:<20} {}", ns, name);
            }
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = settings_from(&cli)?;
    let api = Konverge::connect(settings).await.context("connecting")?;

    match cli.command {
        Commands::Apply {
            file,
            definition,
            state,
            force,
            wait,
            wait_timeout,
            wait_condition,
            check,
            redact_secrets,
            kind,
            api_version,
            name,
        } => {
            let source = match (file, definition) {
                (Some(path), _) => DocumentSource::File(path),
                (None, Some(text)) => DocumentSource::Text(text),
                (None, None) => DocumentSource::Text(String::new()),
            };
            let overrides = IdentityOverrides { api_version, kind, namespace: None, name };
            let wait = if wait || wait_condition.is_some() {
                api.wait_policy(wait_condition.as_deref(), wait_timeout.map(Duration::from_secs))
            } else {
                WaitPolicy::None
            };
            let options = ApplyOptions { force, wait, check_mode: check, redact_secrets };
            info!(?state, force, check, "apply invoked");
            let results = api.apply(&source, &overrides, state.into(), &options).await?;
            print_results(cli.output, &results)?;
            let failed = results.iter().filter(|r| !r.is_ok()).count();
            Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Get { kind, name, file, api_version, selector, field_selector } => {
            let definition = match file {
                Some(path) => {
                    let docs = DocumentSource::File(path.clone()).load()?;
                    let first = docs.into_iter().next();
                    Some(first.with_context(|| format!("{} holds no document", path.display()))?)
                }
                None => None,
            };
            // --ns is a default; a namespace in the definition wins
            let pinned_ns = definition.as_ref().and_then(|d| d.pointer("/metadata/namespace")).is_some();
            let req = QueryRequest {
                kind: kind.unwrap_or_default(),
                api_version,
                namespace: if pinned_ns { None } else { cli.namespace.clone() },
                name,
                label_selector: selector,
                field_selector,
                definition,
            };
            info!(kind = %req.kind, name = ?req.name, from_file = req.definition.is_some(), "get invoked");
            let res = api.query(&req).await?;
            print_query(cli.output, &res)?;
            Ok(if res == QueryResult::NotFound { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Discover => {
            let kinds = api.discover().await?;
            match cli.output {
                Output::Human => {
                    for k in kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", k.api_version, k.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    tokio::select! {
        res = run(cli) => match res {
            Ok(code) => Ok(code),
            Err(e) => {
                error!(error = ?e, "command failed");
                eprintln!("error: {:#}", e);
                Ok(ExitCode::FAILURE)
            }
        },
        _ = signal::ctrl_c() => {
            warn!("interrupted; a mutation already sent may have been applied");
            Ok(ExitCode::from(130))
        }
    }
}
