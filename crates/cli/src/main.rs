use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn};

use piceli_compare::{decide, DiffClass};
use piceli_core::K8sObject;
use piceli_exec::{ClusterClient, ExecConfig, ExecutionStatus, Executor};
use piceli_kubehub::KubeClient;
use piceli_plan::{plan, DependencyHints, Plan};

#[derive(Parser, Debug)]
#[command(name = "piceli", version, about = "Declarative Kubernetes deployments")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Target namespace for objects that do not set one explicitly
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Manifest file to load (repeatable)
    #[arg(long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Folder of manifests to load (repeatable)
    #[arg(long = "folder", global = true)]
    folders: Vec<PathBuf>,

    /// Descend into sub-folders when loading
    #[arg(long = "sub-elements", global = true, action = ArgAction::SetTrue)]
    sub_elements: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect the loaded object model
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// Plan and execute deployments
    Deploy {
        #[command(subcommand)]
        command: DeployCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommands {
    /// Emit identity and origin for every loaded object
    List,
}

#[derive(Subcommand, Debug)]
enum DeployCommands {
    /// Build and print the layered deployment plan
    Plan {
        /// Validate cycles and dangling references before printing
        #[arg(short = 'v', long = "validate", action = ArgAction::SetTrue)]
        validate: bool,
    },
    /// Compare every planned object against the live cluster
    Detail {
        /// Suppress rows that need no action
        #[arg(long = "hide-no-action", alias = "hna", action = ArgAction::SetTrue)]
        hide_no_action: bool,
    },
    /// Execute the plan against the cluster
    Run {
        /// Create the target namespace if it does not exist
        #[arg(short = 'c', long = "create-namespace", action = ArgAction::SetTrue)]
        create_namespace: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("PICELI_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PICELI_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PICELI_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_objects(cli: &Cli) -> Result<Vec<K8sObject>> {
    if cli.files.is_empty() && cli.folders.is_empty() {
        return Err(anyhow!("no manifest sources; pass --file and/or --folder"));
    }
    let mut objects = piceli_load::load_all(&cli.files, &cli.folders, cli.sub_elements)?;
    if let Some(ns) = cli.namespace.as_deref() {
        objects = objects.iter().map(|o| o.with_default_namespace(ns)).collect();
    }
    Ok(objects)
}

fn build_plan(cli: &Cli, validate: bool) -> Result<Plan, ExitCode> {
    let objects = match load_objects(cli) {
        Ok(objects) => objects,
        Err(e) => {
            error!(error = %e, "loading failed");
            eprintln!("load error: {e}");
            return Err(ExitCode::from(1));
        }
    };
    match plan(objects, &DependencyHints::default(), validate) {
        Ok(p) => Ok(p),
        Err(e) => {
            error!(error = %e, "planning failed");
            eprintln!("plan error: {e}");
            Err(ExitCode::from(1))
        }
    }
}

fn print_plan(p: &Plan, output: Output) {
    match output {
        Output::Human => {
            println!("Deployment plan ({} objects)", p.object_count());
            for (index, level) in p.levels().iter().enumerate() {
                println!("Step {}:", index + 1);
                for id in level {
                    let origin = p
                        .object(id)
                        .map(|o| o.origin().to_string())
                        .unwrap_or_default();
                    println!("  {} ({})", id, origin);
                }
            }
        }
        Output::Json => match serde_json::to_string_pretty(&p.to_json()) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("render error: {e}"),
        },
    }
}

#[derive(Debug, Serialize)]
struct DetailRow {
    id: piceli_core::ObjectId,
    action: String,
    live_present: bool,
    differing: Vec<String>,
    defaulted: Vec<String>,
    ignored: Vec<String>,
}

async fn detail_rows(p: &Plan, client: &dyn ClusterClient) -> Result<Vec<DetailRow>> {
    let mut rows = Vec::new();
    for level in p.levels() {
        for id in level {
            let desired = match p.object(id) {
                Some(o) => o,
                None => continue,
            };
            let live = client
                .get(id)
                .await
                .map_err(|e| anyhow!("reading {}: {}", id, e))?;
            let decision = decide(desired, live.as_ref());
            let paths_with = |class: DiffClass| -> Vec<String> {
                decision
                    .diff
                    .as_ref()
                    .map(|d| {
                        d.entries
                            .iter()
                            .filter(|e| e.class == class)
                            .map(|e| e.path.to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            rows.push(DetailRow {
                id: id.clone(),
                action: decision.action.verb().to_string(),
                live_present: live.is_some(),
                differing: paths_with(DiffClass::Differing),
                defaulted: paths_with(DiffClass::Defaulted),
                ignored: paths_with(DiffClass::Ignored),
            });
        }
    }
    Ok(rows)
}

fn print_detail(rows: &[DetailRow], hide_no_action: bool, output: Output) {
    let visible: Vec<&DetailRow> = rows
        .iter()
        .filter(|r| !(hide_no_action && r.action == "no-action"))
        .collect();
    match output {
        Output::Human => {
            println!("{:<10} {:<9} {}", "ACTION", "LIVE", "OBJECT");
            for row in visible {
                let live = if row.live_present { "present" } else { "absent" };
                println!("{:<10} {:<9} {}", row.action, live, row.id);
                for path in &row.differing {
                    println!("    ~ {}", path);
                }
                for path in &row.defaulted {
                    println!("    = {} (server default)", path);
                }
            }
        }
        Output::Json => match serde_json::to_string_pretty(&visible) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("render error: {e}"),
        },
    }
}

async fn run_deploy(cli: &Cli, create_namespace: bool) -> ExitCode {
    let p = match build_plan(cli, false) {
        Ok(p) => p,
        Err(code) => return code,
    };
    if create_namespace {
        if let Some(ns) = cli.namespace.as_deref() {
            if let Err(e) = piceli_kubehub::ensure_namespace(ns).await {
                error!(error = %e, namespace = %ns, "namespace upsert failed");
                eprintln!("namespace error: {e}");
                return ExitCode::from(1);
            }
        }
    }
    let client = match KubeClient::connect().await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "cluster connection failed");
            eprintln!("cluster error: {e}");
            return ExitCode::from(1);
        }
    };
    let executor = Executor::new(client, ExecConfig::from_env());

    // Ctrl-C aborts into the normal rollback path.
    let abort = executor.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; aborting deployment");
            abort.store(true, Ordering::SeqCst);
        }
    });

    let report = executor.deploy(&p).await;
    match cli.output {
        Output::Human => {
            for outcome in &report.outcomes {
                println!(
                    "{:<10} {:<9} {}",
                    outcome.verb,
                    format!("x{}", outcome.attempts),
                    outcome.id
                );
            }
            println!("deployment {:?}", report.status);
            for failure in &report.rollback_failures {
                eprintln!("rollback: {failure}");
            }
        }
        Output::Json => match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("render error: {e}"),
        },
    }
    match report.status {
        ExecutionStatus::Completed => ExitCode::SUCCESS,
        ExecutionStatus::RollbackFailed => ExitCode::from(3),
        _ => ExitCode::from(2),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Model { command: ModelCommands::List } => {
            let objects = match load_objects(&cli) {
                Ok(objects) => objects,
                Err(e) => {
                    eprintln!("load error: {e}");
                    return ExitCode::from(1);
                }
            };
            match cli.output {
                Output::Human => {
                    for obj in &objects {
                        println!("{} ({})", obj.id(), obj.origin());
                    }
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Row {
                        #[serde(flatten)]
                        id: piceli_core::ObjectId,
                        origin: String,
                    }
                    let rows: Vec<Row> = objects
                        .iter()
                        .map(|o| Row { id: o.id(), origin: o.origin().to_string() })
                        .collect();
                    match serde_json::to_string_pretty(&rows) {
                        Ok(text) => println!("{text}"),
                        Err(e) => eprintln!("render error: {e}"),
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Deploy { command } => match command {
            DeployCommands::Plan { validate } => match build_plan(&cli, *validate) {
                Ok(p) => {
                    print_plan(&p, cli.output);
                    ExitCode::SUCCESS
                }
                Err(code) => code,
            },
            DeployCommands::Detail { hide_no_action } => {
                let p = match build_plan(&cli, false) {
                    Ok(p) => p,
                    Err(code) => return code,
                };
                let client = match KubeClient::connect().await {
                    Ok(client) => client,
                    Err(e) => {
                        eprintln!("cluster error: {e}");
                        return ExitCode::from(1);
                    }
                };
                match detail_rows(&p, &client).await {
                    Ok(rows) => {
                        print_detail(&rows, *hide_no_action, cli.output);
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("detail error: {e}");
                        ExitCode::from(1)
                    }
                }
            }
            DeployCommands::Run { create_namespace } => run_deploy(&cli, *create_namespace).await,
        },
    }
}
