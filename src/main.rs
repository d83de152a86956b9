use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use faultline::config::{ANALYSIS_CHANNEL, FaultlineConfig};
use faultline::db::{DbHandle, NewErrorEvent};
use faultline::engine::OpenAiEngine;
use faultline::queue::TaskQueue;
use faultline::source::HttpSnippetFetcher;
use faultline::trigger::TriggerPolicy;
use faultline::worker::WorkerPool;

#[derive(Parser)]
#[command(name = "faultline")]
#[command(version, about = "AI root-cause analysis pipeline for ingested error events")]
struct Cli {
    /// Path to the config file. Defaults to ./faultline.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis worker pool until interrupted
    Worker {
        /// Number of workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show queue depth and dead-task count
    Status,
    /// Store an error event and apply the trigger policy
    Ingest {
        #[arg(long)]
        project: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        status_code: Option<i64>,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long)]
        stack: Option<String>,
    },
    /// Enqueue an analysis task for an already-stored event
    Enqueue {
        #[arg(long)]
        event_id: i64,
    },
    /// Requeue all dead analysis tasks for reprocessing
    RequeueDead,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = FaultlineConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = cli.db {
        config.database.path = db_path;
    }

    let db = DbHandle::open(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    let queue = TaskQueue::new(db.clone(), config.queue.clone());

    match cli.command {
        Commands::Worker { workers } => {
            if let Some(n) = workers {
                config.worker.count = n;
            }
            let engine = OpenAiEngine::from_env(config.engine.clone())
                .context("Analysis engine unavailable")?;
            let fetcher = HttpSnippetFetcher::new(config.fetcher.clone())
                .context("Failed to build snippet fetcher")?;
            let pool = WorkerPool::new(
                db,
                queue,
                Arc::new(fetcher),
                Arc::new(engine),
                config.worker.clone(),
                config.fetcher.clone(),
            );

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                eprintln!("shutting down, draining in-flight work...");
                let _ = tx.send(true);
            });
            pool.run(rx).await;
        }
        Commands::Status => {
            let depth = queue.depth(ANALYSIS_CHANNEL).await?;
            let dead = queue.dead_count(ANALYSIS_CHANNEL).await?;
            println!("channel {}: depth={} dead={}", ANALYSIS_CHANNEL, depth, dead);
        }
        Commands::Ingest {
            project,
            message,
            status_code,
            method,
            path,
            stack,
        } => {
            let event = db
                .call(move |db| {
                    db.insert_error_event(&NewErrorEvent {
                        project_key: project,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        status_code,
                        message,
                        stack,
                        method,
                        path,
                    })
                })
                .await?;
            let enqueued = TriggerPolicy::decide(&event);
            TriggerPolicy::new(queue).on_error_stored(&event).await;
            if enqueued {
                println!("Stored event {} (analysis enqueued)", event.id);
            } else {
                println!("Stored event {} (below analysis threshold)", event.id);
            }
        }
        Commands::Enqueue { event_id } => {
            let event = db
                .call(move |db| db.get_event(event_id))
                .await?
                .with_context(|| format!("Event {} not found", event_id))?;
            let task = queue.enqueue(ANALYSIS_CHANNEL, event.id).await?;
            println!("Enqueued task {} for event {}", task.id, event.id);
        }
        Commands::RequeueDead => {
            let requeued = queue.requeue_dead(ANALYSIS_CHANNEL).await?;
            println!("Requeued {} dead task(s)", requeued);
        }
    }

    Ok(())
}
