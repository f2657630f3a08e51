// Daemon bootstrap: config, PID file, logging, components, poller and HTTP server.

pub mod poller;
#[cfg(windows)]
pub mod windows_service;

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tracing_appender::non_blocking::WorkerGuard;

use crate::daemon::poller::Poller;
use crate::fetcher::netdrive::default_drive_mapper;
use crate::fetcher::ArtifactFetcher;
use crate::installer::script::ShellScriptRunner;
use crate::installer::{CommandRunner, InstallRunner, SystemCommandRunner};
use crate::models::AgentConfig;
use crate::notify::notifier_from_config;
use crate::orchestrator::{Orchestrator, OrchestratorEvent};
use crate::remote::{BuildSource, JenkinsClient};
use crate::server::{self, AppState};
use crate::storage::packages::JsonPackageStore;
use crate::storage::PackageStore;

const APP_DIR: &str = "autoinstall";

/// How long a poll pass in progress may take to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PidFile: exclusive PID file acquisition
// ---------------------------------------------------------------------------

/// Ensures only one daemon instance runs per data directory.
///
/// Uses exclusive file creation (CREATE_NEW / O_EXCL). If the PID file
/// exists, the recorded PID is checked and a stale file is replaced.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Acquire the PID file, replacing it if its process is gone.
    pub fn acquire(&self) -> Result<()> {
        if self.path.exists() {
            let content =
                std::fs::read_to_string(&self.path).context("Failed to read existing PID file")?;
            let existing_pid: u32 = content
                .trim()
                .parse()
                .context("Failed to parse PID from PID file")?;

            if is_process_alive(existing_pid) {
                return Err(anyhow::anyhow!(
                    "Daemon is already running (PID {existing_pid}). \
                     PID file: {}",
                    self.path.display()
                ));
            }

            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing_pid
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file (exclusive create)")?;

        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID to PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    /// Whether the PID file exists and its process is alive.
    pub fn is_alive(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) => is_process_alive(pid),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // signal 0 tests process existence
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                false
            } else {
                CloseHandle(handle);
                true
            }
        }
    }
}

#[cfg(windows)]
extern "system" {
    fn OpenProcess(
        dwDesiredAccess: u32,
        bInheritHandle: i32,
        dwProcessId: u32,
    ) -> *mut std::ffi::c_void;
    fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AgentConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the [`AgentConfig`]. Resolution order:
///   1. `--config` flag (`config_path`)
///   2. `AUTOINSTALL_CONFIG_DIR/config.json`
///   3. `<platform config dir>/autoinstall/config.json`
///   4. `<data_dir>/config.json`
///   5. defaults
pub fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("AUTOINSTALL_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path);
    }

    tracing::info!("No config file found, using defaults");
    Ok(AgentConfig::default())
}

/// Resolve the data directory: `override_dir`, then `AUTOINSTALL_DATA_DIR`,
/// then `C:\ProgramData\autoinstall` on Windows or `dirs::data_dir()/autoinstall`
/// elsewhere.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("AUTOINSTALL_DATA_DIR") {
        return PathBuf::from(d);
    }

    #[cfg(target_os = "windows")]
    {
        // Services run as LocalSystem, so the shared ProgramData folder is used.
        std::env::var("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\ProgramData"))
            .join(APP_DIR)
    }

    #[cfg(not(target_os = "windows"))]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

/// Create `data_dir` with its `logs/` and artifacts directories.
pub async fn create_data_dirs(data_dir: &Path, artifacts_root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    tokio::fs::create_dir_all(data_dir.join("logs"))
        .await
        .context("Failed to create logs directory")?;
    tokio::fs::create_dir_all(artifacts_root)
        .await
        .context("Failed to create artifacts directory")?;
    tracing::info!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

/// Load the config and apply command-line overrides. The returned config
/// always has `data_dir` set.
pub fn prepare_config(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<AgentConfig> {
    let mut config = load_config(config_path)?;

    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = match (data_dir_override, config.data_dir.as_deref()) {
        (Some(d), _) => d.to_path_buf(),
        (None, Some(d)) => d.to_path_buf(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir);
    Ok(config)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log to stderr and to `<data_dir>/logs/autoinstall.log` (rotated daily).
///
/// The returned guard flushes the file writer when dropped and must be held
/// for the life of the daemon. Does nothing if a subscriber is already set.
pub fn init_tracing(data_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        tracing::warn!(
            "Could not create log directory {}: {}. Logging to stderr only.",
            log_dir.display(),
            e
        );
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, "autoinstall.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if result.is_ok() {
        tracing::info!("Logging to stderr and {}", log_dir.display());
    }
    Some(guard)
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Wire the production components: Jenkins client, JSON package store,
/// artifact fetcher, msiexec runner, hook scripts and notifier.
pub async fn build_orchestrator(
    config: Arc<AgentConfig>,
    data_dir: &Path,
) -> Result<Arc<Orchestrator>> {
    let source: Arc<dyn BuildSource> =
        Arc::new(JenkinsClient::from_config(&config).context("Failed to create CI client")?);
    let store: Arc<dyn PackageStore> = Arc::new(
        JsonPackageStore::new(data_dir.to_path_buf())
            .await
            .context("Failed to open package store")?,
    );
    let fetcher = Arc::new(ArtifactFetcher::new(
        Arc::clone(&source),
        config.max_concurrent_downloads,
        default_drive_mapper(),
        config.network_drive.clone(),
    ));

    let commands: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let scripts = Arc::new(ShellScriptRunner::new(
        Arc::clone(&commands),
        Some(Duration::from_secs(config.installer_timeout_secs)),
    ));
    let installer = Arc::new(InstallRunner::new(Arc::clone(&config), commands, scripts));
    let notifier =
        notifier_from_config(&config, data_dir).context("Failed to configure notifications")?;

    let (event_tx, _) = broadcast::channel::<OrchestratorEvent>(config.broadcast_capacity.max(1));

    Ok(Arc::new(Orchestrator::new(
        config, source, store, fetcher, installer, notifier, event_tx,
    )))
}

// ---------------------------------------------------------------------------
// Daemon lifecycle
// ---------------------------------------------------------------------------

/// Foreground daemon entry point: runs until Ctrl+C, SIGTERM or
/// `POST /api/shutdown`.
pub async fn start_daemon(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
) -> Result<()> {
    let config = prepare_config(config_path, data_dir_override, host_override, port_override)?;
    run_daemon(config, wait_for_signal()).await
}

/// Service entry point: runs until a message arrives on `shutdown_rx`
/// (or its sender is dropped).
pub async fn run_daemon_until_shutdown(shutdown_rx: std::sync::mpsc::Receiver<()>) -> Result<()> {
    let config = prepare_config(None, None, None, None)?;
    let stop = async move {
        let _ = tokio::task::spawn_blocking(move || shutdown_rx.recv()).await;
        tracing::info!("Received service stop request");
    };
    run_daemon(config, stop).await
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received Ctrl+C signal");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM signal");
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received Ctrl+C signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C signal");
    }
}

/// Run the daemon with a fully resolved config until `stop` completes or the
/// API requests shutdown.
pub async fn run_daemon(config: AgentConfig, stop: impl Future<Output = ()>) -> Result<()> {
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| resolve_data_dir(None));
    create_data_dirs(&data_dir, &config.artifacts_root()).await?;
    let _log_guard = init_tracing(&data_dir);
    tracing::info!("Data directory: {}", data_dir.display());

    let pid_file = PidFile::new(data_dir.join("autoinstall.pid"));
    pid_file.acquire()?;

    let result = serve(Arc::new(config), &data_dir, stop).await;

    if let Err(e) = pid_file.release() {
        tracing::error!("Failed to release PID file: {}", e);
    }
    match result {
        Ok(()) => tracing::info!("Daemon exited cleanly."),
        Err(ref e) => tracing::error!("Daemon stopped with error: {:#}", e),
    }
    result
}

async fn serve(config: Arc<AgentConfig>, data_dir: &Path, stop: impl Future<Output = ()>) -> Result<()> {
    let orchestrator = build_orchestrator(Arc::clone(&config), data_dir).await?;
    let poll_notify = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        poll_notify: Arc::clone(&poll_notify),
        config: Arc::clone(&config),
        start_time: Instant::now(),
        shutdown_tx: Some(shutdown_tx.clone()),
    });

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let local_addr = listener.local_addr().context("Failed to read bound address")?;
    tracing::info!("Daemon started. Listening on http://{}", local_addr);

    let event_logger = spawn_event_logger(orchestrator.subscribe());

    let poller = Poller::new(
        Arc::clone(&orchestrator) as Arc<dyn poller::PollTarget>,
        config.jobs.clone(),
        Duration::from_secs(config.poll_interval_secs.max(1)),
        Arc::clone(&poll_notify),
    );
    let poller_shutdown = shutdown_rx.clone();
    let mut poller_handle = tokio::spawn(async move { poller.run(poller_shutdown).await });

    let router = server::create_router(state);
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_shutdown.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
    });

    // `autoinstall stop` arrives through the API when there is no console.
    let mut api_shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = stop => {}
        _ = api_shutdown_rx.changed() => {
            tracing::info!("Received API shutdown signal");
        }
    }
    let _ = shutdown_tx.send(());

    // A running msiexec is allowed to finish before the poller is dropped.
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut poller_handle)
        .await
        .is_err()
    {
        tracing::warn!(
            "Poller did not stop within {}s, aborting",
            SHUTDOWN_GRACE.as_secs()
        );
        poller_handle.abort();
    }
    event_logger.abort();

    match server_handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("HTTP server failed")),
        Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
    }
}

/// Log every orchestrator event at debug level, plus a line per finished
/// install for the daemon log.
fn spawn_event_logger(
    mut rx: broadcast::Receiver<OrchestratorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(OrchestratorEvent::Installed {
                    ref job,
                    build_number,
                    previous,
                    ref outcomes,
                    ..
                }) => {
                    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
                    tracing::info!(
                        "Job '{}' now at build #{} (was {}), {} package(s), {} failed",
                        job,
                        build_number,
                        previous
                            .map(|p| format!("#{}", p))
                            .unwrap_or_else(|| "not installed".to_string()),
                        outcomes.len(),
                        failed
                    );
                }
                Ok(event) => {
                    tracing::debug!("Event {} for job '{}'", event.name(), event.job());
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
