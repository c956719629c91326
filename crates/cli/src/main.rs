use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kapply_apply::{
    load_documents, ImmutablePolicy, PlannedAction, PlannedChange, ReconcileConfig, Reconciler, RunResult,
};
use kapply_core::{Document, ManagedSet, TypeCategory};
use kapply_kubehub::KubeRemote;
use kapply_persist::{ManagedSetStore, SqliteStore};
use kapply_schema::PolicyRegistry;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kapplyctl", version, about = "Reconcile desired resources with a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for documents that do not set one
    #[arg(long = "ns", global = true, env = "KAPPLY_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Managed-set environment; separate environments never collect each other's objects
    #[arg(long = "env", global = true, env = "KAPPLY_ENV", default_value = "default")]
    env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply documents and delete objects the previous apply created but these no longer list
    Apply {
        /// Files or directories; `-` reads stdin
        #[arg(required = true)]
        files: Vec<String>,
        /// Keep orphans instead of deleting them
        #[arg(long = "skip-gc", action = ArgAction::SetTrue)]
        skip_gc: bool,
        /// Identities applied at once
        #[arg(long = "concurrency")]
        concurrency: Option<usize>,
        /// Fail identities whose patch would change an immutable field, before writing
        #[arg(long = "reject-immutable", action = ArgAction::SetTrue)]
        reject_immutable: bool,
    },
    /// Show what apply would change, without writing
    Diff {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Delete the objects the documents describe
    Delete {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print the managed set recorded for the environment
    Managed,
}

fn init_tracing() {
    let env = std::env::var("KAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Logs go to stderr so `-o json` stays parseable.
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAPPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAPPLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

/// Read every input. Directories contribute their manifests, sorted by name, non-recursively.
fn read_inputs(inputs: &[String]) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for input in inputs {
        if input == "-" {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).context("reading stdin")?;
            docs.extend(load_documents(&text).context("stdin")?);
            continue;
        }
        let path = PathBuf::from(input);
        let files: Vec<PathBuf> = if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&path)
                .with_context(|| format!("reading directory {}", path.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_manifest(p))
                .collect();
            entries.sort();
            entries
        } else {
            vec![path]
        };
        for file in files {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            docs.extend(load_documents(&text).with_context(|| file.display().to_string())?);
        }
    }
    Ok(docs)
}

/// Built-in policies plus those of any custom kind the documents use.
async fn policies_for(remote: &KubeRemote, docs: &[Document]) -> PolicyRegistry {
    let mut reg = PolicyRegistry::builtin();
    let kinds: BTreeSet<TypeCategory> = docs.iter().filter_map(TypeCategory::of).collect();
    for ty in kinds {
        if ty.group.is_empty() || reg.knows(&ty) {
            continue;
        }
        match kapply_schema::fetch_crd_policies(remote.client(), &ty).await {
            Ok(Some(policies)) => reg.extend(&ty.group, &ty.kind, policies),
            Ok(None) => {}
            Err(e) => warn!(kind = %ty, error = %e, "CRD merge policies unavailable; using defaults"),
        }
    }
    reg
}

async fn reconciler(env: &str, docs: &[Document], config: ReconcileConfig) -> Result<Reconciler> {
    let remote = KubeRemote::try_default().await.context("connecting to cluster")?;
    let store = SqliteStore::open_default(env)?;
    let policies = policies_for(&remote, docs).await;
    Ok(Reconciler::new(Arc::new(remote), Arc::new(store), Arc::new(policies), config))
}

fn print_run(output: Output, res: &RunResult) -> Result<()> {
    match output {
        Output::Human => {
            for (id, r) in res.outcomes.iter() {
                let stage = match r.stage {
                    kapply_apply::Stage::Apply => "",
                    kapply_apply::Stage::GarbageCollect => " (gc)",
                };
                println!("{:<40} {:<32} {}{}", id.to_string(), r.type_category.to_string(), r.outcome, stage);
            }
            let counts: Vec<String> = res.counts().iter().map(|(k, n)| format!("{} {}", n, k)).collect();
            println!("run {}: {}", res.run_id, if counts.is_empty() { "nothing to do".to_string() } else { counts.join(", ") });
            if res.cancelled {
                println!("cancelled; garbage collection skipped");
            }
            if let Some(e) = &res.store_error {
                println!("managed set not saved: {}", e);
            }
        }
        Output::Json => {
            let objects: Vec<serde_json::Value> = res
                .outcomes
                .iter()
                .map(|(id, r)| json!({
                    "namespace": id.namespace,
                    "name": id.name,
                    "apiVersion": r.type_category.api_version(),
                    "kind": r.type_category.kind,
                    "result": r.outcome,
                    "attempts": r.attempts,
                    "stage": r.stage,
                }))
                .collect();
            let out = json!({
                "runId": res.run_id,
                "succeeded": res.aggregate_succeeded,
                "cancelled": res.cancelled,
                "gcRan": res.gc_ran,
                "storeError": res.store_error,
                "objects": objects,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn print_plan(output: Output, plan: &[PlannedChange]) -> Result<()> {
    match output {
        Output::Human => {
            for c in plan {
                let what = match &c.action {
                    PlannedAction::Create => "create".to_string(),
                    PlannedAction::Patch { summary, .. } => {
                        format!("patch (+{} ~{} -{})", summary.adds, summary.updates, summary.removes)
                    }
                    PlannedAction::Replace { from } => format!("replace (was {})", from),
                    PlannedAction::Unchanged => "unchanged".to_string(),
                    PlannedAction::Delete => "delete".to_string(),
                    PlannedAction::Error { reason } => format!("error: {}", reason),
                };
                println!("{:<40} {:<32} {}", c.identity.to_string(), c.type_category.to_string(), what);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(plan)?),
    }
    Ok(())
}

fn print_managed(output: Output, set: &ManagedSet) -> Result<()> {
    match output {
        Output::Human => {
            for (id, ty) in set.iter() {
                println!("{:<40} {}", id.to_string(), ty);
            }
        }
        Output::Json => {
            let rows: Vec<serde_json::Value> = set
                .iter()
                .map(|(id, ty)| json!({"namespace": id.namespace, "name": id.name, "apiVersion": ty.api_version(), "kind": ty.kind}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { files, skip_gc, concurrency, reject_immutable } => {
            let docs = read_inputs(&files)?;
            let mut config = ReconcileConfig::from_env();
            if skip_gc {
                config.gc = false;
            }
            if let Some(n) = concurrency.filter(|n| *n > 0) {
                config.concurrency = n;
            }
            if reject_immutable {
                config.immutable_policy = ImmutablePolicy::RejectEarly;
            }
            info!(documents = docs.len(), env = %cli.env, concurrency = config.concurrency, gc = config.gc, "apply invoked");
            let r = reconciler(&cli.env, &docs, config).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight writes");
                    on_signal.cancel();
                }
            });

            let res = r.reconcile(docs, &cli.namespace, cancel).await?;
            print_run(cli.output, &res)?;
            Ok(if res.aggregate_succeeded { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Commands::Diff { files } => {
            let docs = read_inputs(&files)?;
            let r = reconciler(&cli.env, &docs, ReconcileConfig::from_env()).await?;
            let plan = r.plan(docs, &cli.namespace).await?;
            print_plan(cli.output, &plan)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { files } => {
            let docs = read_inputs(&files)?;
            let r = reconciler(&cli.env, &docs, ReconcileConfig::from_env()).await?;
            let res = r.delete_all(docs, &cli.namespace).await?;
            print_run(cli.output, &res)?;
            Ok(if res.aggregate_succeeded { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Commands::Managed => {
            let store = SqliteStore::open_default(&cli.env)?;
            let set = store.load()?;
            if cli.output == Output::Human {
                if let Some(ts) = store.last_saved()? {
                    println!("# env {} saved at {} ({} objects)", cli.env, ts, set.len());
                }
            }
            print_managed(cli.output, &set)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
