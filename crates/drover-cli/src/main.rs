use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_core::event::LoopEventKind;
use drover_core::loops::LoopId;
use drover_core::telemetry::{TelemetryConfig, init_telemetry};
use drover_engine::adapter::AdapterRegistry;
use drover_engine::engine::{EngineConfig, LoopEngine};
use drover_engine::issues::FileIssueTracker;
use drover_store::journal::DEFAULT_POLL_INTERVAL;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Supervise autonomous coding-agent loops against tracked issues"
)]
struct Cli {
    /// Data directory holding state.json and per-loop logs.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    /// Log filter (e.g. "drover=debug").
    #[arg(long, default_value = "drover=info")]
    log_filter: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a loop for an issue file and drive it to completion.
    Run {
        /// Path to a markdown issue file (first `# ` line is the title,
        /// criteria under `## Acceptance Criteria`).
        issue: String,

        /// Agent adapter to drive.
        #[arg(long, default_value = "claude")]
        agent: String,

        /// Working directory for the agent. Defaults to the current dir.
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Forward the adapter's skip-permissions flag.
        #[arg(long)]
        skip_permissions: bool,

        /// Close the issue automatically when the loop completes.
        #[arg(long)]
        close_issue: bool,
    },

    /// List all loops.
    List,

    /// Show a loop's journal.
    Logs {
        id: String,

        /// Only the most recent N entries.
        #[arg(short = 'n', long)]
        recent: Option<usize>,

        /// Keep following the journal.
        #[arg(long)]
        follow: bool,
    },

    /// Resume a loop paused by a previous supervisor session.
    Resume { id: String },

    /// Discard a previous-session paused loop (state and journal).
    Discard { id: String },

    /// Mark loops orphaned by a previous supervisor run as paused.
    Sweep,

    /// Print the cross-session work summary for a loop.
    Summary { id: String },

    /// Close the issue for a completed loop.
    Close {
        id: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Toggle an acceptance criterion as the operator.
    Check {
        id: String,
        /// 1-based criterion index.
        index: usize,
        /// Mark incomplete instead of complete.
        #[arg(long)]
        undo: bool,
    },
}

fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drover")
}

fn build_engine(data_root: PathBuf) -> Arc<LoopEngine> {
    LoopEngine::new(
        EngineConfig::new(data_root),
        AdapterRegistry::with_defaults(),
        Arc::new(FileIssueTracker),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_logs: cli.json_logs,
        log_filter: cli.log_filter.clone(),
        log_dir: None,
    })?;

    let data_root = cli.data_root.clone().unwrap_or_else(default_data_root);
    let engine = build_engine(data_root);

    match cli.command {
        Commands::Run {
            issue,
            agent,
            repo_root,
            skip_permissions,
            close_issue,
        } => {
            let orphans = engine.startup().await?;
            if orphans > 0 {
                println!("(marked {orphans} orphaned loop(s) as paused; see `drover list`)");
            }

            let repo_root = match repo_root {
                Some(root) => root,
                None => std::env::current_dir().context("cannot resolve current dir")?,
            };
            let lp = engine
                .create_loop(&issue, &agent, repo_root, skip_permissions)
                .await?;
            println!("created {} for issue: {}", lp.id, lp.issue.title);

            engine.start_loop(&lp.id).await?;
            drive_to_completion(&engine, &lp.id).await?;

            let done = engine.get_loop(&lp.id)?;
            if close_issue && done.status == drover_core::loops::LoopStatus::Completed {
                engine.close_issue(&lp.id, None).await?;
                println!("issue closed");
            }
        }

        Commands::List => {
            let loops = engine.list_loops()?;
            if loops.is_empty() {
                println!("no loops");
            }
            for lp in loops {
                let flags = if lp.paused_from_previous_session {
                    " (previous session)"
                } else {
                    ""
                };
                println!(
                    "{}  {:9}{}  #{} {}",
                    lp.id,
                    lp.status.label(),
                    flags,
                    lp.issue.number,
                    lp.issue.title
                );
                for (i, criterion) in lp.issue.acceptance_criteria.iter().enumerate() {
                    let mark = if criterion.completed { "x" } else { " " };
                    println!("    [{mark}] {}. {}", i + 1, criterion.text);
                }
                if let Some(error) = lp.error {
                    println!("    error: {error}");
                }
            }
        }

        Commands::Logs { id, recent, follow } => {
            let id = LoopId::from(id.as_str());
            let entries = match recent {
                Some(n) => engine.journal().read_recent(&id, n)?,
                None => engine.journal().read_all(&id)?,
            };
            for entry in entries {
                print_entry(&entry);
            }
            if follow {
                let mut tail = engine.journal().tail(&id, DEFAULT_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        entry = tail.recv() => match entry {
                            Some(entry) => print_entry(&entry),
                            None => break,
                        },
                    }
                }
                tail.shutdown().await;
            }
        }

        Commands::Resume { id } => {
            let id = LoopId::from(id.as_str());
            engine.startup().await?;
            engine.resume_paused_loop(&id).await?;
            println!("resumed {id}");
            drive_to_completion(&engine, &id).await?;
        }

        Commands::Discard { id } => {
            let id = LoopId::from(id.as_str());
            engine.discard_paused_loop(&id).await?;
            println!("discarded {id}");
        }

        Commands::Sweep => {
            let count = engine.mark_orphaned_paused_loops().await?;
            println!("marked {count} orphaned loop(s) as paused");
        }

        Commands::Summary { id } => {
            let id = LoopId::from(id.as_str());
            println!("{}", engine.summarize_loop(&id)?);
        }

        Commands::Close { id, comment } => {
            let id = LoopId::from(id.as_str());
            let outcome = engine.close_issue(&id, comment.as_deref()).await?;
            println!("{outcome:?}");
        }

        Commands::Check { id, index, undo } => {
            let id = LoopId::from(id.as_str());
            engine.toggle_criterion(&id, index, !undo).await?;
            let state = if undo { "incomplete" } else { "complete" };
            println!("criterion {index} marked {state}");
        }
    }

    Ok(())
}

/// Stream events and journal output until the loop reaches a terminal
/// status. Ctrl-C stops the loop (terminate, grace, kill) and returns.
async fn drive_to_completion(engine: &LoopEngine, id: &LoopId) -> Result<()> {
    let mut events = engine.subscribe();
    let mut tail = engine.journal().tail(id, DEFAULT_POLL_INTERVAL);
    let mut stopping = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                eprintln!("stopping loop {id}…");
                stopping = true;
                if let Err(e) = engine.stop_loop(id).await {
                    tracing::warn!(error = %e, "stop failed");
                }
            }
            event = events.recv() => {
                match event {
                    // Journal content arrives through the tail below.
                    Ok(event) => {
                        if !matches!(event.kind, LoopEventKind::LogAppended { .. }) {
                            println!("{event}");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            entry = tail.recv() => {
                if let Some(entry) = entry {
                    print_entry(&entry);
                }
            }
            // Re-check terminal status even when nothing is flowing.
            _ = tokio::time::sleep(DEFAULT_POLL_INTERVAL) => {}
        }

        let lp = engine.get_loop(id)?;
        if lp.status.is_terminal() {
            // Give the tail one more interval to drain trailing output.
            tokio::time::sleep(DEFAULT_POLL_INTERVAL * 2).await;
            while let Ok(Some(entry)) =
                tokio::time::timeout(std::time::Duration::from_millis(10), tail.recv()).await
            {
                print_entry(&entry);
            }
            println!(
                "loop {id} finished: {}{}",
                lp.status,
                lp.error.map(|e| format!(" ({e})")).unwrap_or_default()
            );
            break;
        }
    }

    tail.shutdown().await;
    Ok(())
}

fn print_entry(entry: &drover_core::log::LogEntry) {
    println!(
        "{} [{}] {}",
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.kind,
        entry.content
    );
}
