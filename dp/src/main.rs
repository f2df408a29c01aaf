//! Datapress - data resource publishing pipeline
//!
//! CLI entry point for launching and managing the worker daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{CommandFactory, Parser};
use docstore::{DocumentStore, LockService, MemoryLocks, MemoryStore, SqliteStore};
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use datapress::cli::{Cli, Command, OutputFormat, get_log_path};
use datapress::config::Config;
use datapress::daemon::DaemonManager;
use datapress::journal::StoreJournal;
use datapress::metrics::TaskMetrics;
use datapress::progress::StoreProgress;
use datapress::runner::{EXIT_INPUT_ERROR, ExecutionStrategy, InProcess, Isolated, TaskRunner};
use datapress::scheduler::{Scheduler, SchedulerConfig};
use datapress::tasks::{TaskError, TaskId, TaskRegistry};
use datapress::{Resource, ResourceKind, WaitRegistry};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let level = match cli_log_level.map(|s| s.to_uppercase()).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Start { foreground }) => cmd_start(&config, cli.config.as_deref(), foreground).await,
        Some(Command::Stop) => cmd_stop(),
        Some(Command::Status { format }) => cmd_status(format),
        Some(Command::RunDaemon) => {
            let daemon = DaemonManager::new();
            daemon.register_self()?;
            run_daemon(&config, cli.config.clone()).await
        }
        Some(Command::ExecTask { kind, id, task }) => cmd_exec_task(&config, &kind, &id, &task).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<&Path>, foreground: bool) -> Result<()> {
    let daemon = DaemonManager::new();

    if daemon.is_running() {
        if let Some(pid) = daemon.running_pid() {
            println!("Datapress is already running (PID: {})", pid);
        } else {
            println!("Datapress is already running");
        }
        return Ok(());
    }

    if foreground {
        println!("Starting Datapress in foreground mode...");
        run_daemon(config, config_path.map(Path::to_path_buf)).await
    } else {
        let pid = daemon.start(config_path)?;
        println!("Datapress started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
fn cmd_stop() -> Result<()> {
    let daemon = DaemonManager::new();

    if !daemon.is_running() {
        println!("Datapress is not running");
        return Ok(());
    }

    let pid = daemon.running_pid();
    daemon.stop()?;
    if let Some(pid) = pid {
        println!("Datapress stopped (was PID: {})", pid);
    } else {
        println!("Datapress stopped");
    }
    Ok(())
}

/// Show daemon status
fn cmd_status(format: OutputFormat) -> Result<()> {
    let daemon = DaemonManager::new();
    let status = daemon.status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "pid_file": status.pid_file.to_string_lossy(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Datapress Status");
            println!("----------------");
            if status.running {
                println!("Status: running");
                if let Some(pid) = status.pid {
                    println!("PID: {}", pid);
                }
            } else {
                println!("Status: stopped");
            }
            println!("PID file: {}", status.pid_file.display());
            println!("Log file: {}", get_log_path().display());
        }
    }

    Ok(())
}

fn build_storage(config: &Config) -> Result<(Arc<dyn DocumentStore>, Arc<dyn LockService>)> {
    match config.storage.backend.as_str() {
        "memory" => Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryLocks::new()))),
        "sqlite" => {
            let path = config.storage_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create storage directory")?;
            }
            let store = Arc::new(SqliteStore::open(&path)?);
            info!(path = %path.display(), "storage: sqlite backend");
            Ok((store.clone(), store))
        }
        other => Err(eyre!("Unknown storage backend: {other}. Use: sqlite or memory")),
    }
}

/// Run the worker until ctrl-c or SIGTERM
async fn run_daemon(config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    info!(version = datapress::daemon::VERSION, "Datapress worker starting");
    let (store, locks) = build_storage(config)?;

    let hooks = Arc::new(WaitRegistry::new());
    let metrics = Arc::new(TaskMetrics::new());
    let stopped = Arc::new(AtomicBool::new(false));
    let registry = Arc::new(TaskRegistry::builtin());

    let strategy: Arc<dyn ExecutionStrategy> = if config.worker.spawn_task {
        info!("execution: isolated child processes");
        Arc::new(Isolated::new(config_path))
    } else {
        Arc::new(InProcess::new(store.clone(), registry))
    };

    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        locks.clone(),
        Arc::new(StoreJournal::new(store.clone())),
        Arc::new(StoreProgress::new(store.clone())),
        hooks.clone(),
        metrics.clone(),
        strategy,
        config.error_retry_delay(),
        stopped.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        store,
        locks,
        runner,
        hooks.clone(),
        metrics,
        SchedulerConfig {
            concurrency: config.worker.concurrency,
            poll_interval: config.poll_interval(),
            owner: config.worker.owner.clone(),
        },
        stopped,
    ));

    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    wait_for_shutdown().await;

    scheduler.stop().await;
    hooks.clear();
    running.await.context("scheduler task panicked")?;
    info!("Datapress worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "could not install SIGTERM handler, ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
        _ = sigterm.recv() => warn!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("ctrl-c received, shutting down");
}

/// Execute one task against one resource and report through the exit
/// code: 0 success, [`EXIT_INPUT_ERROR`] input error, 1 anything else
async fn cmd_exec_task(config: &Config, kind: &str, id: &str, task: &str) -> Result<()> {
    let kind: ResourceKind = kind.parse().map_err(|err: String| eyre!(err))?;
    let task: TaskId = task.parse().map_err(|err: String| eyre!(err))?;
    let (store, _locks) = build_storage(config)?;

    let Some(doc) = store.get(kind.collection(), id).await? else {
        eprintln!("{kind} {id} not found");
        std::process::exit(1);
    };
    let resource: Resource = serde_json::from_value(doc)?;
    let view = if resource.has_live_draft() { resource.merged() } else { resource };

    let strategy = InProcess::new(store, Arc::new(TaskRegistry::builtin()));
    match strategy.execute(kind, &view, task).await {
        Ok(()) => Ok(()),
        Err(TaskError::Input(message)) => {
            eprintln!("{message}");
            std::process::exit(EXIT_INPUT_ERROR);
        }
        Err(TaskError::Transient(err)) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}
