//! # MailClaw: background mail job scheduler
//!
//! Usage:
//!   mailclaw run                          # Run the scheduler until Ctrl-C
//!   mailclaw run --db ~/.mailclaw/tasks.db --max-concurrent 5
//!   mailclaw tasks                        # List journaled tasks (same journal as `run`)
//!   mailclaw init-config                  # Write a default config file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailclaw_core::{LogConfig, MailClawConfig, SchedulerConfig};
use mailclaw_scheduler::{
    FnWork, Scheduler, SchedulerDb, SchedulerEvent, TaskContext, TaskSpec, TaskView, TaskWork,
    spawn_scheduler,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KIND_HEARTBEAT: &str = "heartbeat";

#[derive(Parser)]
#[command(name = "mailclaw", version, about = "📬 MailClaw: background mail job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run {
        /// Config file (default: ~/.mailclaw/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Task journal database (default: scheduler.db_path, then ~/.mailclaw/tasks.db)
        #[arg(long)]
        db: Option<String>,

        /// Overrides scheduler.max_concurrent_tasks
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Schedule a heartbeat task with this period (0 disables)
        #[arg(long, default_value = "5")]
        heartbeat_minutes: u32,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// List tasks recorded in the journal
    Tasks {
        /// Config file (default: ~/.mailclaw/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Task journal database (default: scheduler.db_path, then ~/.mailclaw/tasks.db)
        #[arg(long)]
        db: Option<String>,

        /// Number of recent events to show
        #[arg(long, default_value = "10")]
        events: usize,
    },
    /// Write a default config file
    InitConfig {
        #[arg(long)]
        path: Option<String>,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&str>) -> Result<MailClawConfig> {
    Ok(match path {
        Some(path) => MailClawConfig::load_from(Path::new(&expand_path(path)))?,
        None => MailClawConfig::load()?,
    })
}

/// Journal shared by `run` and `tasks`: `--db`, then the config, then the
/// default under the MailClaw home directory.
fn journal_path(cli_db: Option<&str>, scheduler: &SchedulerConfig) -> PathBuf {
    match cli_db.or(scheduler.db_path.as_deref()) {
        Some(path) => PathBuf::from(expand_path(path)),
        None => MailClawConfig::home_dir().join("tasks.db"),
    }
}

fn init_logging(log: &LogConfig, verbose: bool) {
    let level = if verbose {
        "mailclaw=debug,mailclaw_scheduler=debug"
    } else {
        log.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn heartbeat_work() -> Arc<dyn TaskWork> {
    Arc::new(FnWork::new(|ctx: TaskContext| async move {
        info!("💓 Heartbeat ({})", ctx.task_id);
        Ok(serde_json::json!({ "alive": true }))
    }))
}

fn rebind(view: &TaskView) -> Option<Arc<dyn TaskWork>> {
    match view.kind.as_str() {
        KIND_HEARTBEAT => Some(heartbeat_work()),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            db,
            max_concurrent,
            heartbeat_minutes,
            verbose,
        } => {
            let mut config = load_config(config.as_deref())?;
            init_logging(&config.log, verbose);

            let db_path = journal_path(db.as_deref(), &config.scheduler);
            config.scheduler.db_path = Some(db_path.to_string_lossy().into_owned());
            if let Some(n) = max_concurrent {
                config.scheduler.max_concurrent_tasks = n;
            }

            run(config, heartbeat_minutes).await
        }
        Command::Tasks { config, db, events } => {
            let config = load_config(config.as_deref())?;
            list_tasks(&journal_path(db.as_deref(), &config.scheduler), events)
        }
        Command::InitConfig { path } => {
            let path = path
                .map(|p| PathBuf::from(expand_path(&p)))
                .unwrap_or_else(MailClawConfig::default_path);
            if path.exists() {
                println!("⚠️  Config already exists: {}", path.display());
                return Ok(());
            }
            MailClawConfig::default().save_to(&path)?;
            println!("✅ Config written: {}", path.display());
            Ok(())
        }
    }
}

async fn run(config: MailClawConfig, heartbeat_minutes: u32) -> Result<()> {
    let scheduler = Scheduler::open(config.scheduler).context("Failed to open scheduler")?;
    let restored = scheduler.restore(rebind).await?;

    let has_heartbeat = scheduler
        .get_scheduled_tasks()
        .await
        .iter()
        .any(|t| t.kind == KIND_HEARTBEAT && !t.status.is_terminal());
    if heartbeat_minutes > 0 && !has_heartbeat {
        let spec = TaskSpec::new("Heartbeat")
            .description("Scheduler liveness check")
            .every_minutes(heartbeat_minutes)
            .kind(KIND_HEARTBEAT);
        scheduler.schedule_task(spec, heartbeat_work()).await;
    }

    let stats = scheduler.get_statistics().await;
    info!(
        "📬 MailClaw scheduler: {} task(s) ({} restored), max {} concurrent",
        stats.total_tasks, restored, stats.max_concurrent
    );

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::TaskFailed { name, error, .. }) => {
                    warn!("📣 '{name}' gave up: {error}");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("📣 Event listener lagged, {n} event(s) dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let shutdown = CancellationToken::new();
    let handle = spawn_scheduler(scheduler.clone(), shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down...");
    shutdown.cancel();
    handle.await?;

    let stats = scheduler.get_statistics().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn list_tasks(db_path: &Path, events: usize) -> Result<()> {
    if !db_path.exists() {
        println!("No task journal at {}", db_path.display());
        return Ok(());
    }
    let db = SchedulerDb::open(db_path)?;
    let tasks = db.load_tasks()?;

    println!("📋 {} task(s) in {}\n", tasks.len(), db_path.display());
    for t in &tasks {
        let next = t
            .next_run_time
            .map(|n| n.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<38} {:<10} {:<7} next={:<16} runs={} retries={}/{}  {}",
            t.id,
            t.status.as_str(),
            t.priority.as_str(),
            next,
            t.run_count,
            t.retry_count,
            t.max_retries,
            t.name
        );
        if let Some(err) = &t.last_error {
            println!("  {:<38} last error: {err}", "");
        }
    }

    if let Some(at) = db.last_event_time()? {
        println!("\n🕒 Last activity: {}", at.to_rfc3339());
    }
    if events > 0 {
        println!("\n📣 Recent events:");
        for event in db.recent_events(events)? {
            println!("  {}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}
