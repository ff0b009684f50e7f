use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tandem_core::{ConfigStore, JsonStateStore, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use tandem_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tandem_server::{build_launcher, default_worker_id, now_ms, serve, AppState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tandem-engine")]
#[command(about = "Tandem mission and routine engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct StateArgs {
    /// Directory holding the JSON state files and logs.
    #[arg(long, env = "TANDEM_STATE_DIR")]
    state_dir: Option<String>,
    /// Project config file. Defaults to `<state-dir>/config.json`.
    #[arg(long)]
    config: Option<String>,
    /// Run API base url, overrides `launcher.base_url`.
    #[arg(long)]
    run_api_url: Option<String>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[arg(long)]
    lease_ttl_ms: Option<u64>,
    /// Record launches in memory instead of calling the run api.
    #[arg(long, default_value_t = false)]
    dry_launcher: bool,
    /// Lease holder identity. Defaults to a per-process id.
    #[arg(long)]
    worker_id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[command(flatten)]
        state: StateArgs,
    },
    Routines {
        #[command(subcommand)]
        command: RoutinesCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RoutinesCommand {
    /// Run a single scheduler pass and print the report.
    Tick {
        #[command(flatten)]
        state: StateArgs,
    },
    List {
        #[command(flatten)]
        state: StateArgs,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective config and every layer it was merged from.
    Show {
        #[command(flatten)]
        state: StateArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state,
        } => {
            let state_dir = resolve_state_dir(state.state_dir.clone());
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("logging.initialized", "engine.main")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            let app_state = build_state(&state_dir, &state).await?;
            serve(addr, app_state).await?;
        }
        Command::Routines { command } => match command {
            RoutinesCommand::Tick { state } => {
                let state_dir = resolve_state_dir(state.state_dir.clone());
                let logs_dir = canonical_logs_dir_from_root(&state_dir);
                let (_log_guard, _) = init_process_logging(ProcessKind::Scheduler, &logs_dir, 14)?;
                let app_state = build_state(&state_dir, &state).await?;
                let report = app_state
                    .scheduler
                    .tick(now_ms())
                    .await
                    .context("scheduler pass failed")?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            RoutinesCommand::List { state } => {
                let state_dir = resolve_state_dir(state.state_dir.clone());
                let app_state = build_state(&state_dir, &state).await?;
                let routines = app_state.scheduler.routines().list().await?;
                let output = json!({
                    "routines": routines,
                    "count": routines.len(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        },
        Command::Config { command } => match command {
            ConfigCommand::Show { state } => {
                let state_dir = resolve_state_dir(state.state_dir.clone());
                let config = open_config(&state_dir, &state).await?;
                let output = json!({
                    "effective": config.get_effective_value().await,
                    "layers": config.get_layers_value().await,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        },
    }

    Ok(())
}

fn build_cli_overrides(args: &StateArgs) -> Option<Value> {
    let mut root = serde_json::Map::new();

    let mut scheduler = serde_json::Map::new();
    if let Some(poll) = args.poll_interval_ms {
        scheduler.insert("poll_interval_ms".to_string(), json!(poll));
    }
    if let Some(ttl) = args.lease_ttl_ms {
        scheduler.insert("lease_ttl_ms".to_string(), json!(ttl));
    }
    if !scheduler.is_empty() {
        root.insert("scheduler".to_string(), Value::Object(scheduler));
    }

    if let Some(url) = args
        .run_api_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        root.insert("launcher".to_string(), json!({ "base_url": url }));
    }

    if root.is_empty() {
        return None;
    }
    Some(Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|dir| !dir.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("tandem").join("engine"))
        .unwrap_or_else(|| PathBuf::from(".tandem"))
}

async fn open_config(state_dir: &Path, args: &StateArgs) -> anyhow::Result<ConfigStore> {
    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"));
    ConfigStore::new(&config_path, build_cli_overrides(args))
        .await
        .with_context(|| format!("loading config {}", config_path.display()))
}

async fn build_state(state_dir: &Path, args: &StateArgs) -> anyhow::Result<AppState> {
    let config = open_config(state_dir, args).await?;
    let engine_config = config.get().await.context("invalid engine config")?;
    let store = JsonStateStore::open(state_dir)
        .await
        .with_context(|| format!("opening state store {}", state_dir.display()))?;
    let launcher = build_launcher(&engine_config.launcher, args.dry_launcher)?;
    let worker_id = args.worker_id.clone().unwrap_or_else(default_worker_id);
    info!(worker_id = %worker_id, "engine state ready");
    AppState::new(config, Arc::new(store), launcher, worker_id).await
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting tandem-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}
