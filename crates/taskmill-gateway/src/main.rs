use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use taskmill_core::{Clock, SystemClock, TaskmillConfig};
use taskmill_executor::{
    Backends, ContainerExecutor, DockerRuntime, HttpExecutor, RuntimeError, SandboxedExecutor,
};
use taskmill_sandbox::SafetyChecker;
use taskmill_scheduler::{DispatchLoop, LocalQueue, StoreReporter, TaskManager};
use taskmill_store::{SqliteKv, TaskStore};
use tokio::sync::watch;
use tracing::{info, warn};

mod app;
mod http;

/// Task execution gateway: HTTP API, periodic dispatch and in-process workers.
#[derive(Parser)]
#[command(name = "taskmill-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file (defaults to ./taskmill.toml)
    #[arg(long, env = "TASKMILL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmill=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = TaskmillConfig::load(cli.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "taskmill gateway starting");

    // single SQLite file backs the whole KV store
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = TaskStore::new(Arc::new(SqliteKv::open(db_path)?));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let checker = SafetyChecker::new(config.sandbox.max_code_size);
    let backends = build_backends(&config, checker.clone()).await?;
    info!(executors = ?backends.kinds(), "execution back-ends ready");

    // workers report status straight into the store
    let reporter = StoreReporter::new(store.clone(), clock.clone());
    let queue = Arc::new(LocalQueue::new(
        backends,
        Arc::new(reporter),
        config.queue.max_concurrent,
    ));
    let manager = Arc::new(TaskManager::new(
        store,
        queue.clone(),
        clock.clone(),
        checker,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatch = DispatchLoop::new(manager.clone(), clock, config.scheduler.clone());
    let dispatch_handle = tokio::spawn(dispatch.run(shutdown_rx.clone()));
    let maintenance_handle = tokio::spawn(run_maintenance(
        manager.clone(),
        config.retention.result_expiry_secs,
        config.retention.cleanup_interval_secs,
        shutdown_rx,
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, manager));
    let router = app::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "taskmill gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop both loops and refuse new work
    let _ = shutdown_tx.send(true);
    queue.close();
    let _ = dispatch_handle.await;
    let _ = maintenance_handle.await;
    info!("taskmill gateway stopped");
    Ok(())
}

/// Register the three executors. A missing container runtime degrades the
/// isolated executor to reporting infrastructure failures instead of
/// failing startup.
async fn build_backends(
    config: &TaskmillConfig,
    checker: SafetyChecker,
) -> anyhow::Result<Backends> {
    let container = if config.container.enabled {
        match DockerRuntime::connect().await {
            Ok(runtime) => {
                ContainerExecutor::new(Arc::new(runtime), config.container.clone(), checker)
            }
            Err(e) => {
                warn!(error = %e, "container runtime unreachable; isolated tasks will fail");
                let reason = match e {
                    RuntimeError::Unavailable(reason) => reason,
                    other => other.to_string(),
                };
                ContainerExecutor::unavailable(config.container.clone(), checker, reason)
            }
        }
    } else {
        ContainerExecutor::unavailable(
            config.container.clone(),
            checker,
            "disabled by configuration".to_string(),
        )
    };

    Ok(Backends::new()
        .with(Arc::new(SandboxedExecutor::new(&config.sandbox)))
        .with(Arc::new(container))
        .with(Arc::new(HttpExecutor::new(&config.http)?)))
}

/// Purge expired results every `interval_secs` until shutdown.
async fn run_maintenance(
    manager: Arc<TaskManager>,
    expiry_secs: u64,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let retention = Duration::from_secs(expiry_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // the first tick completes immediately; skip it so startup stays quiet
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                match manager.purge_expired(retention) {
                    Ok(purged) => info!(
                        purged,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "expired results purged"
                    ),
                    Err(e) => warn!(error = %e, "result purge failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("maintenance loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
