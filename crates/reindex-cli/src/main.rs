//! Reindex CLI
//!
//! Starts and inspects reindex runs for targets declared in a TOML file.
//!
//! ```toml
//! [reindex]
//! max_concurrency = 4
//!
//! [[targets]]
//! kind = "library"
//! key = "contracts"
//! root = "docs/contracts"
//! index_name = "contracts-v2"
//! ```
//!
//! Logs go to stderr; command results are printed to stdout as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use reindex_core::{
    JsonFileStateStore, LogSink, OrchestrationId, OrchestrationState, OrchestrationStatus,
    ReindexConfig, ReindexCoordinator, ReindexService, TargetCatalog, TargetKind,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod catalog;
mod fs_reindexer;

use catalog::FsCatalog;
use fs_reindexer::FsReindexer;

#[derive(Parser)]
#[command(name = "reindex", version, about = "Start and inspect reindex runs")]
struct Cli {
    /// Config file with the `[reindex]` table and `[[targets]]` entries
    #[arg(long, global = true, default_value = "reindex.toml")]
    config: PathBuf,

    /// Where run state and index entries are kept (default: `.reindex` next to the config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start (or attach to) a reindex run and follow it to the end
    Start {
        /// library | process | cr
        #[arg(long)]
        kind: TargetKind,

        #[arg(long)]
        key: String,

        #[arg(long)]
        reason: Option<String>,
    },
    /// Print the state of a run
    Status { id: String },
    /// Print whether a run is actually in progress
    Running { id: String },
    /// Print every known run
    List,
    /// Print the configured targets and whether each can be reindexed
    Targets,
    /// Print the JSON Schema of run records as printed by `status` and `list`
    Schema,
}

#[derive(Serialize)]
struct TargetRow {
    orchestration_id: String,
    kind: TargetKind,
    key: String,
    backend: String,
    eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    if matches!(cli.command, Command::Schema) {
        return print_json(&OrchestrationState::json_schema()?);
    }

    let config = ReindexConfig::load(&cli.config)
        .await
        .with_context(|| format!("load {}", cli.config.display()))?;
    let catalog = Arc::new(FsCatalog::load(&cli.config).await?);
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| config_dir(&cli.config).join(".reindex"));

    let store = Arc::new(JsonFileStateStore::open(state_dir.join("runs")).await?);
    let reindexer = Arc::new(FsReindexer::new(catalog.clone(), state_dir.join("index")));
    let coordinator = ReindexCoordinator::new(
        store,
        catalog.clone(),
        reindexer,
        Arc::new(LogSink),
        config,
    );
    let service = ReindexService::new(coordinator);

    match cli.command {
        Command::Start { kind, key, reason } => {
            run_start(&service, kind, &key, reason.as_deref()).await
        }
        Command::Status { id } => print_json(&service.get_state(&id).await?),
        Command::Running { id } => print_json(&service.is_running(&id).await?),
        Command::List => print_json(&service.list().await?),
        Command::Targets => {
            let mut rows = Vec::new();
            for (kind, entry) in catalog.entries() {
                let descriptor = catalog.resolve_target(kind, &entry.key).await?;
                let detail = descriptor
                    .as_ref()
                    .and_then(|d| catalog.check_eligible(d).err());
                rows.push(TargetRow {
                    orchestration_id: OrchestrationId::resolve(kind, &entry.key)?.to_string(),
                    kind,
                    key: entry.key.clone(),
                    backend: entry.backend.clone(),
                    eligible: detail.is_none(),
                    detail,
                });
            }
            print_json(&rows)
        }
        Command::Schema => print_json(&OrchestrationState::json_schema()?),
    }
}

async fn run_start(
    service: &ReindexService,
    kind: TargetKind,
    key: &str,
    reason: Option<&str>,
) -> Result<()> {
    let accepted = service.start(kind, key, reason, None).await?;
    let id = accepted.orchestration_id.clone();
    if accepted.already_running {
        info!("Attached to running reindex {id} ({})", accepted.reason);
    } else {
        info!("Accepted reindex {id} ({})", accepted.reason);
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let coordinator = service.coordinator();
    let mut ticks = tokio::time::interval(Duration::from_millis(200));
    let mut interrupted = false;
    let state = loop {
        tokio::select! {
            _ = ticks.tick() => {}
            result = tokio::signal::ctrl_c(), if !interrupted => {
                result?;
                interrupted = true;
                if coordinator.cancel(&id) {
                    warn!("Interrupted; cancelling {id}");
                } else {
                    warn!("Interrupted; {id} is owned by another process and keeps running");
                    break coordinator.get_state(&id).await?;
                }
            }
        }
        let state = coordinator.get_state(&id).await?;
        show_progress(&bar, &state);
        if state.is_terminal() || !coordinator.is_running(&id).await? {
            break state;
        }
    };
    bar.finish_and_clear();

    print_json(&state)?;
    match state.status {
        OrchestrationStatus::Completed => Ok(()),
        OrchestrationStatus::Failed => {
            anyhow::bail!("reindex {id} failed: {}", state.recent_errors(3))
        }
        other => anyhow::bail!("reindex {id} stopped while {other:?}"),
    }
}

fn show_progress(bar: &ProgressBar, state: &OrchestrationState) {
    bar.set_length(state.total_items);
    bar.set_position(state.processed_items);
    bar.set_message(format!("{} failed", state.failed_items));
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn config_dir(config: &Path) -> PathBuf {
    config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
