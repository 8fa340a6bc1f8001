use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tether_core::{
    resolve_state_dir, ActiveRunManager, EngineConfig, PersistenceWriter, ProcessSpec,
    RunRegistry, RunStore, SubagentRunManager, SubscriberHub,
};
use tether_gateway::GatewayClient;
use tether_observability::{
    canonical_logs_dir_from_root, init_process_logging, ProcessKind,
};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tether-engine")]
#[command(about = "Headless tether run engine")]
struct Cli {
    /// Path to an engine config file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the state directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch an agent run and stream its wire events to stdout.
    Run {
        /// Run identity; generated when omitted.
        #[arg(long)]
        identity: Option<String>,
        /// Working directory for the agent process.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Payload written to the agent's stdin.
        #[arg(long)]
        input: Option<String>,
        /// Agent command and arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Attach to a rehydrated dependent run and replay its event stream.
    Attach {
        identity: String,
    },
    /// List persisted runs.
    List,
    /// Abort a live run.
    Abort {
        identity: String,
    },
}

struct Engine {
    hub: SubscriberHub,
    active: ActiveRunManager,
    subagents: SubagentRunManager,
    store: Arc<RunStore>,
}

async fn build_engine(config: EngineConfig) -> anyhow::Result<Engine> {
    let state_dir = resolve_state_dir(config.state_dir.as_deref());
    let store = Arc::new(RunStore::new(&state_dir).await?);
    let persist = PersistenceWriter::new(store.clone());
    let registry = RunRegistry::global();
    let gateway = GatewayClient::new(config.gateway_config());
    let subagents = SubagentRunManager::new(
        registry.clone(),
        persist.clone(),
        gateway.clone(),
        config.clone(),
    );
    let active = ActiveRunManager::new(
        registry.clone(),
        persist,
        gateway,
        subagents.clone(),
        config,
    );
    Ok(Engine {
        hub: SubscriberHub::new(registry),
        active,
        subagents,
        store,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = Some(dir);
    }

    let logs_dir = canonical_logs_dir_from_root(&resolve_state_dir(config.state_dir.as_deref()));
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
    info!(
        logs_dir = %log_info.logs_dir,
        prefix = %log_info.prefix,
        "logging initialized"
    );

    let engine = build_engine(config).await?;

    match cli.command {
        Command::Run {
            identity,
            cwd,
            input,
            command,
        } => {
            let identity = identity.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut parts = command.into_iter();
            let program = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing agent command"))?;
            let spec = ProcessSpec {
                program,
                args: parts.collect(),
                cwd,
                env: Vec::new(),
                stdin_payload: input,
            };

            let run = engine.active.start(&identity, spec).await?;
            let mut sub = engine
                .hub
                .subscribe(&identity, true)
                .ok_or_else(|| anyhow::anyhow!("run vanished before attach"))?;
            while let Some(event) = sub.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            let status = run.status();
            eprintln!("run {identity} finished: {status}");
        }
        Command::Attach { identity } => {
            engine.subagents.rehydrate().await?;
            let mut sub = engine
                .hub
                .subscribe(&identity, true)
                .ok_or_else(|| anyhow::anyhow!("no run found for `{identity}`"))?;
            while let Some(event) = sub.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::List => {
            for entry in engine.store.list_runs().await {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Abort { identity } => {
            if engine.active.abort(&identity).await {
                eprintln!("aborted {identity}");
            } else {
                eprintln!("no live run for {identity}");
            }
        }
    }

    Ok(())
}
