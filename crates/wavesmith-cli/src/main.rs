mod render;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wavesmith_orchestrator::WavesmithConfig;
use wavesmith_store::{TaskQuery, TaskState, TaskStore};

#[derive(Parser)]
#[command(name = "wavesmith", about = "Wavesmith task store inspector")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wavesmith.toml")]
    config: PathBuf,

    /// Database file (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending tasks whose dependencies are all completed
    Ready,
    /// List tasks by state or workflow
    List {
        #[arg(long, conflicts_with = "workflow", required_unless_present = "workflow")]
        state: Option<TaskState>,
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show every field of a task
    Show { id: Uuid },
    /// Show the state history of a task
    History { id: Uuid },
    /// Per-state counts and completion reason of a workflow
    Summary { workflow: String },
    /// Dump a workflow with its tasks and history as JSON
    Export {
        workflow: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete tasks older than the retention window
    Cleanup {
        /// Retention in days (overrides config)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Re-queue tasks left in flight by a crashed orchestrator
    Recover {
        #[arg(long)]
        workflow: Option<String>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<WavesmithConfig> {
    if path.exists() {
        Ok(WavesmithConfig::load(path)?)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(WavesmithConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let db_path = cli.db.unwrap_or_else(|| config.database_path.clone());
    let store = TaskStore::open(&db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open task store '{}': {e}", db_path.display()))?;

    match cli.command {
        Commands::Ready => {
            let tasks = store.get_ready_tasks()?;
            if tasks.is_empty() {
                println!("No ready tasks.");
            }
            for task in &tasks {
                println!("{}", render::task_line(task));
            }
        }
        Commands::List { state, workflow } => {
            let query = match (state, workflow) {
                (Some(state), _) => TaskQuery::State(state),
                (None, Some(workflow)) => TaskQuery::Workflow(workflow),
                (None, None) => anyhow::bail!("pass --state or --workflow"),
            };
            let tasks = store.get_tasks_by(&query)?;
            for task in &tasks {
                println!("{}", render::task_line(task));
            }
            println!("\nTotal: {} task(s)", tasks.len());
        }
        Commands::Show { id } => {
            print!("{}", render::task_detail(&store.get_task(id)?));
        }
        Commands::History { id } => {
            for line in render::history_lines(&store.get_history(id)?) {
                println!("{line}");
            }
        }
        Commands::Summary { workflow } => {
            print!("{}", render::summary_text(&store.workflow_summary(&workflow)?));
        }
        Commands::Export { workflow, output } => {
            let json = serde_json::to_string_pretty(&store.export(&workflow)?)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    info!(workflow_id = %workflow, path = %path.display(), "Workflow exported");
                }
                None => println!("{json}"),
            }
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let removed = store.cleanup(days)?;
            println!("Removed {removed} task(s) older than {days} day(s).");
        }
        Commands::Recover { workflow } => {
            let recovered =
                store.recover_in_flight(workflow.as_deref(), &config.coordinator.actor)?;
            println!("Re-queued {} task(s).", recovered.len());
            for id in recovered {
                println!("  {id}");
            }
        }
    }

    Ok(())
}
