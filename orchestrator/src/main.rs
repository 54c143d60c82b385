//! Multi-account operations orchestrator: scheduler, sidecar lifecycle manager
//! and control-plane API in a single process.
//!
//! Grounded on `agent/src/main.rs`'s startup shape: jemalloc global allocator,
//! JSON-formatted daily-rolling file logging via `tracing-appender`, `clap` CLI
//! args layered over a TOML config file, and a `tokio::select!` between the
//! main workload and a unix-signal/Ctrl+C shutdown future.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod api;
mod cookie_courier;
mod dispatcher_store;
mod error;
mod license_gate;
mod log_collector;
mod scheduler;
mod sidecar;
mod task_runner;

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use api::AppState;
use dispatcher_store::DispatcherStore;
use license_gate::LicenseGate;
use log_collector::LogCollector;
use scheduler::Scheduler;
use sidecar::SidecarManager;
use task_runner::TaskRunner;

/// Command-line arguments for the orchestrator binary.
#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "Scheduler, sidecar lifecycle manager and control-plane API for multi-account social-media operations", long_about = None)]
struct CliArgs {
    /// Path to orchestrator.toml. Defaults are used for any field it omits.
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Override the HTTP bind address from the config file.
    #[arg(long = "bind-addr", value_name = "ADDR")]
    bind_addr: Option<String>,

    /// Override the on-disk data directory from the config file.
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "orchestrator.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("orchestrator=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    guard
}

async fn build_state(config: AppConfig) -> Result<(AppState, Arc<Scheduler>)> {
    std::fs::create_dir_all(&config.app_data_dir)
        .with_context(|| format!("failed to create app data dir {}", config.app_data_dir.display()))?;

    let store = DispatcherStore::load(config.dispatcher_store_path())
        .context("failed to load dispatcher store")?;

    let sidecar = Arc::new(SidecarManager::new(config.sidecar.clone()));
    let log_collector = Arc::new(LogCollector::new(config.logs_dir(), config.max_logs_per_file));
    let license_gate = Arc::new(LicenseGate::new(
        config.license.clone(),
        config.license_config_path(),
        config.license_key_path(),
    ));

    let account_cookies_root = config.app_data_dir.join("task_data");
    let context_store_root = config.app_data_dir.join("task_context");
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&sidecar),
        Arc::clone(&log_collector),
        account_cookies_root,
        context_store_root,
        Box::new(|_task| Arc::new(NotImplementedSidecarClient)),
    ));

    let scheduler = Arc::new(Scheduler::new(store, runner, config.scheduler_max_sleep_secs));

    let state = AppState {
        config: Arc::new(config),
        scheduler: Arc::clone(&scheduler),
        license_gate,
        log_collector,
    };
    Ok((state, scheduler))
}

/// Placeholder `SidecarClient`: the real implementation speaks the sidecar's
/// HTTP browser-automation protocol, which is external to this process (spec §1
/// Non-goals). Every call fails fast with `SidecarUnavailable` so the runner's
/// existing error handling path (log + continue) takes over cleanly.
struct NotImplementedSidecarClient;

#[async_trait::async_trait]
impl task_runner::SidecarClient for NotImplementedSidecarClient {
    async fn ensure_connected(&self) -> shared::Result<()> {
        Err(shared::OrchestratorError::SidecarUnavailable(
            "sidecar browser-automation protocol is not wired up in this build".to_string(),
        )
        .into())
    }

    async fn check_login_status(&self) -> shared::Result<bool> {
        Ok(false)
    }

    async fn run_mode(&self, _mode: shared::model::TaskMode, _count: u8) -> shared::Result<()> {
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logging();

    let cli_args = CliArgs::parse();
    info!("orchestrator starting up");

    let mut config = match &cli_args.config_file {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(bind_addr) = cli_args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(data_dir) = cli_args.data_dir {
        config.app_data_dir = data_dir;
    }
    config.validate().context("invalid configuration")?;

    let (state, scheduler) = build_state(config.clone()).await?;

    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run().await }
    });

    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "control-plane API listening");

    let server = axum::serve(listener, router);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with an error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    scheduler.stop().await;
    let timeout = std::time::Duration::from_secs(config.graceful_shutdown_timeout_secs);
    if tokio::time::timeout(timeout, scheduler_handle).await.is_err() {
        error!("scheduler loop did not stop within the graceful shutdown timeout");
    }

    info!("orchestrator shutdown complete");
    Ok(())
}
