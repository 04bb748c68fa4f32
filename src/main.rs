// src/main.rs
//
// =============================================================================
// VOXLOGICA: COMMAND LINE ENTRY POINT (v 2.0)
// =============================================================================
//
// Modes:
// 1. RUN:     Parse, reduce and execute a program; optionally export the
//             task graph (JSON / Graphviz DOT) on the side.
// 2. INSPECT: Reduce only; emit the task graph without executing.
// 3. STATS:   Print result-store statistics.
//
// Exit code is non-zero when any goal fails.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use voxlogica::{Session, SessionConfig};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "voxlogica", version, about = "ImgQL analysis engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an ImgQL program.
    Run {
        /// Path to the program file.
        program: PathBuf,

        /// Directory for the result store.
        #[arg(long, default_value = ".")]
        store_dir: PathBuf,

        /// Worker pool size (default: hardware concurrency).
        #[arg(long)]
        workers: Option<usize>,

        /// Write the task graph as JSON before executing.
        #[arg(long)]
        save_task_graph: Option<PathBuf>,

        /// Write the task graph as Graphviz DOT before executing.
        #[arg(long)]
        save_dot: Option<PathBuf>,

        /// Forget recorded failures so they re-run.
        #[arg(long)]
        clear_failed: bool,

        /// Soft cap (entries) on the in-memory value cache.
        #[arg(long, default_value_t = 256)]
        memory_cap: usize,
    },

    /// Reduce a program and print its task graph without executing.
    Inspect {
        /// Path to the program file.
        program: PathBuf,

        /// Output format: json or dot.
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Print result-store statistics.
    Stats {
        #[arg(long, default_value = ".")]
        store_dir: PathBuf,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            program,
            store_dir,
            workers,
            save_task_graph,
            save_dot,
            clear_failed,
            memory_cap,
        } => {
            let config = SessionConfig {
                store_dir,
                workers: workers.unwrap_or_else(num_cpus::get),
                memory_cap,
                clear_failed,
            };
            run_program(program, config, save_task_graph, save_dot).await
        }
        Commands::Inspect { program, format } => inspect_program(program, &format),
        Commands::Stats { store_dir } => {
            let session = Session::open(SessionConfig {
                store_dir,
                ..SessionConfig::default()
            })?;
            println!("{}", session.stats()?);
            Ok(())
        }
    }
}

// ============================================================================
// 3. RUNTIME
// ============================================================================

async fn run_program(
    program: PathBuf,
    config: SessionConfig,
    save_task_graph: Option<PathBuf>,
    save_dot: Option<PathBuf>,
) -> Result<()> {
    let source = std::fs::read_to_string(&program)
        .with_context(|| format!("cannot read program {}", program.display()))?;

    let session = Session::open(config).context("session init")?;

    // Ctrl-C flips the cancellation flag; the scheduler stops accepting work
    // and drains in-flight computations.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            signal::ctrl_c().await.ok();
            log::warn!("interrupt received, stopping after in-flight work");
            cancel.store(true, Ordering::SeqCst);
        });
    }

    let report = session.run_source(&source, cancel).await?;

    if let Some(path) = save_task_graph {
        let json = serde_json::to_string_pretty(&report.plan.to_json())?;
        std::fs::write(&path, json)
            .with_context(|| format!("cannot write {}", path.display()))?;
        log::info!("task graph written to {}", path.display());
    }
    if let Some(path) = save_dot {
        std::fs::write(&path, report.plan.to_dot())
            .with_context(|| format!("cannot write {}", path.display()))?;
        log::info!("dot graph written to {}", path.display());
    }

    for outcome in &report.goals {
        if let Err(e) = &outcome.result {
            log::error!("goal '{}': {}", outcome.goal.name, e);
        }
    }

    if !report.ok() {
        // Diagnostics already went to stderr, one line per failure.
        std::process::exit(1);
    }
    Ok(())
}

fn inspect_program(program: PathBuf, format: &str) -> Result<()> {
    let source = std::fs::read_to_string(&program)
        .with_context(|| format!("cannot read program {}", program.display()))?;

    // Inspection never touches the store; use a throwaway temp dir.
    let tmp = scratch_dir()?;
    let session = Session::open(SessionConfig {
        store_dir: tmp.clone(),
        ..SessionConfig::default()
    })?;
    let plan = session.reduce_source(&source)?;

    match format {
        "dot" => println!("{}", plan.to_dot()),
        "json" => println!("{}", serde_json::to_string_pretty(&plan.to_json())?),
        other => anyhow::bail!("unknown format '{other}' (expected json or dot)"),
    }
    let _ = std::fs::remove_dir_all(&tmp);
    Ok(())
}

fn scratch_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("voxlogica_inspect_{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
