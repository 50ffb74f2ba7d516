use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stackflow::config::StackflowConfig;
use stackflow::events::LoggingEventSink;
use stackflow::logging::{self, LogFormat};
use stackflow::stacks::{LocalStackBackend, Reconciler, StackBackend};
use stackflow::store::InMemoryResourceStore;
use stackflow::workflow::{Transition, WorkflowDefinition};

#[derive(Parser)]
#[command(
    name = "stackflow",
    version,
    about = "Provision pipeline stacks and validate workflow definitions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring every declared resource group to HEALTHY
    Reconcile {
        /// Path to the stackflow config file
        #[arg(long, short)]
        config: PathBuf,
        /// State file for the local backend (overrides the config)
        #[arg(long, env = "STACKFLOW_STATE_FILE")]
        state: Option<PathBuf>,
    },
    /// Print the live status of one resource group
    Status {
        /// Path to the stackflow config file
        #[arg(long, short)]
        config: PathBuf,
        /// State file for the local backend (overrides the config)
        #[arg(long, env = "STACKFLOW_STATE_FILE")]
        state: Option<PathBuf>,
        /// Group id
        group: String,
    },
    /// Load and validate a workflow definition
    Validate {
        /// Path to the definition (JSON or YAML)
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Text };
    logging::init(&cli.log_level, format);

    match cli.command {
        Commands::Reconcile { config, state } => reconcile(&config, state).await,
        Commands::Status { config, state, group } => status(&config, state, &group).await,
        Commands::Validate { workflow } => validate(&workflow),
    }
}

fn load_config(path: &Path, state: Option<PathBuf>) -> anyhow::Result<StackflowConfig> {
    let mut config = StackflowConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(state) = state {
        config.state_file = state;
    }
    Ok(config)
}

async fn reconcile(path: &Path, state: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = load_config(path, state)?;
    let backend = Arc::new(LocalStackBackend::new(&config.state_file));
    let store = Arc::new(InMemoryResourceStore::with_specs(config.stacks.clone()));
    let reconciler = Reconciler::new(backend, store)
        .with_config(config.reconciler.clone())
        .with_event_sink(Arc::new(LoggingEventSink::default()));

    let report = reconciler.reconcile_declared().await?;
    print!("{report}");

    match &report.first_error {
        None if report.success() => Ok(ExitCode::SUCCESS),
        None => Ok(ExitCode::FAILURE),
        Some(error) => {
            eprintln!("error: {} in group '{}': {}", error.kind, error.entity, error.message);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn status(path: &Path, state: Option<PathBuf>, group: &str) -> anyhow::Result<ExitCode> {
    let config = load_config(path, state)?;
    if !config.stacks.iter().any(|s| s.id == group) {
        anyhow::bail!("group '{group}' is not declared in {}", path.display());
    }
    let backend = LocalStackBackend::new(&config.state_file);
    let status = backend.describe_status(group).await?;
    println!("{group} {status}");
    for (key, value) in backend.outputs(group).await? {
        println!("  {key} = {value}");
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    match WorkflowDefinition::load(path) {
        Ok(definition) => {
            println!("{}: {} states", definition.name(), definition.states().len());
            for state in definition.states() {
                let next = match &state.transition {
                    Transition::Next(next) => next.as_str(),
                    Transition::End => "END",
                };
                println!(
                    "  {} [{} {} {}] -> {}",
                    state.name, state.runner_kind, state.mode, state.failure_policy, next
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("invalid workflow {}: {e}", path.display());
            if let Some(info) = &e.info {
                eprintln!("  code: {}", info.code);
                if let Some(hint) = &info.fix_hint {
                    eprintln!("  hint: {hint}");
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
