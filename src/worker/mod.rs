//! The supervised worker process (`bdg __worker`): owns the Chrome process
//! (or attaches to one already listening), drives the CDP session, runs the
//! requested telemetry collectors, and is the only process that writes
//! `session.preview.json` / `session.json` (spec.md §4.6, §4.7).
//!
//! The daemon re-execs the current binary with `__worker`, pipes its stdin
//! and stdout, and hands it exactly one JSONL line on stdin before anything
//! else: the resolved start configuration. Everything after that is
//! [`crate::ipc::WorkerRequest`]/[`crate::ipc::WorkerResponse`] frames on the
//! same pipes, until `SIGTERM` (graceful stop) or stdin EOF (daemon died).

mod commands;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{Stdin, Stdout};
use tracing::{error, info, warn};

use crate::cdp::{CdpClient, CdpConfig};
use crate::chrome::{self, LaunchConfig};
use crate::connection::ManagedSession;
use crate::error::{AppError, ExitCode};
use crate::ipc::{FramedReader, FramedWriter, WorkerReady, WorkerRequest, WorkerResponse};
use crate::session::{self, BdgData, BdgOutput, BdgPaths, TargetInfo};
use crate::telemetry::{self, ConsoleCollector, ConsoleConfig, NetworkCollector, NetworkConfig};

/// How long a disconnected CDP transport is given to recover via its own
/// reconnect loop (5 retries, backoff doubling 1s→10s cap, worst case ~25s)
/// before the worker treats the session as permanently lost.
const RECONNECT_GRACE: Duration = Duration::from_secs(40);

/// How often the worker polls `CdpClient::is_connected()` while idle.
const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Start configuration handed to the worker as the first JSONL line on
/// stdin. Mirrors the `start_session` params the CLI sends the daemon, so
/// the daemon can forward them unmodified (spec.md §4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartConfig {
    url: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    headless: bool,
    #[serde(default)]
    chrome_path: Option<String>,
    #[serde(default)]
    user_data_dir: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_telemetry")]
    telemetry: Vec<String>,
    #[serde(default)]
    include_all: bool,
    #[serde(default = "default_max_body_size_mb")]
    max_body_size_mb: u64,
    #[serde(default)]
    network_include: Vec<String>,
    #[serde(default)]
    network_exclude: Vec<String>,
    #[serde(default)]
    fetch_all_bodies: bool,
    #[serde(default = "default_preview_interval_secs")]
    preview_interval_secs: u64,
    #[serde(default = "default_preview_max_entries")]
    preview_max_entries: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_telemetry() -> Vec<String> {
    vec!["network".to_owned(), "console".to_owned(), "dom".to_owned()]
}
fn default_max_body_size_mb() -> u64 {
    crate::config::DEFAULT_MAX_BODY_SIZE_MB
}
fn default_preview_interval_secs() -> u64 {
    crate::config::DEFAULT_PREVIEW_INTERVAL_SECS
}
fn default_preview_max_entries() -> usize {
    crate::config::DEFAULT_PREVIEW_MAX_ENTRIES
}

impl StartConfig {
    fn wants(&self, telemetry: &str) -> bool {
        self.telemetry.iter().any(|t| t == telemetry)
    }
}

/// Why the worker's main loop exited, decided which flavor of
/// `session.json` gets written.
enum ShutdownReason {
    /// `SIGTERM` from the daemon, or the daemon closed our stdin.
    Graceful,
    /// The CDP transport's own reconnect loop gave up.
    ChromeLost(String),
}

/// Entry point for `bdg __worker`. Reads the start configuration from
/// stdin, launches or attaches to Chrome, runs telemetry collection until
/// told to stop, and writes `session.json` before exiting.
///
/// # Errors
///
/// Returns `AppError` on any unrecoverable startup failure, or when the
/// worker terminates because the CDP connection was permanently lost.
pub async fn run() -> Result<(), AppError> {
    let paths = BdgPaths::new()?;
    let start = Instant::now();

    let mut stdin_reader = FramedReader::new(tokio::io::stdin());
    let mut stdout_writer = FramedWriter::new(tokio::io::stdout());

    let config: StartConfig = stdin_reader
        .read_frame()
        .await
        .map_err(|e| AppError::new(format!("failed to read start config: {e}"), ExitCode::WorkerStartFailed))?
        .ok_or_else(|| AppError::new("daemon closed stdin before sending start config", ExitCode::WorkerStartFailed))?;

    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let (browser_ws_url, chrome_pid, port) = acquire_chrome(&config, connect_timeout).await?;

    let cdp_config = CdpConfig {
        connect_timeout,
        ..CdpConfig::default()
    };
    let client = CdpClient::connect(&browser_ws_url, cdp_config)
        .await
        .map_err(AppError::from)?;

    let target_id = client
        .send_command("Target.createTarget", Some(serde_json::json!({ "url": config.url })))
        .await
        .map_err(AppError::from)?["targetId"]
        .as_str()
        .ok_or_else(|| AppError::new("Target.createTarget returned no targetId", ExitCode::ProtocolError))?
        .to_owned();

    let session = client.create_session(&target_id).await.map_err(AppError::from)?;
    let mut managed = ManagedSession::new(session);

    let wants_console = config.wants("console");
    let wants_dom = config.wants("dom");
    let wants_network = config.wants("network");

    if wants_console {
        managed.ensure_domain("Runtime").await.map_err(AppError::from)?;
        managed.ensure_domain("Log").await.map_err(AppError::from)?;
    }
    if wants_dom {
        managed.ensure_domain("Page").await.map_err(AppError::from)?;
        managed.ensure_domain("DOM").await.map_err(AppError::from)?;
    }

    let managed = Arc::new(managed);

    let network_collector = if wants_network {
        let net_config = NetworkConfig {
            fetch_all_bodies: config.fetch_all_bodies,
            max_body_size: config.max_body_size_mb * 1024 * 1024,
            include_patterns: config.network_include.clone(),
            exclude_patterns: config.network_exclude.clone(),
            include_all: config.include_all,
        };
        Some(Arc::new(
            NetworkCollector::start(Arc::clone(&managed), net_config)
                .await
                .map_err(AppError::from)?,
        ))
    } else {
        None
    };

    let console_collector = if wants_console {
        let console_config = ConsoleConfig {
            include_all: config.include_all,
        };
        Some(Arc::new(
            ConsoleCollector::start(Arc::clone(&managed), console_config)
                .await
                .map_err(AppError::from)?,
        ))
    } else {
        None
    };

    let ready = WorkerReady::new(
        std::process::id(),
        chrome_pid,
        port,
        target_id.clone(),
        browser_ws_url.clone(),
        config.url.clone(),
    );
    stdout_writer
        .write_frame(&ready)
        .await
        .map_err(|e| AppError::new(format!("failed to send worker_ready: {e}"), ExitCode::WorkerStartFailed))?;

    info!(target_id = %target_id, url = %config.url, "worker ready");

    let preview_handle = tokio::spawn(run_preview_writer(
        paths.clone(),
        network_collector.clone(),
        console_collector.clone(),
        Duration::from_secs(config.preview_interval_secs),
        config.preview_max_entries,
        config.url.clone(),
        start,
    ));

    let shutdown_reason = main_loop(&mut stdin_reader, &mut stdout_writer, &client, &managed, network_collector.as_deref(), console_collector.as_deref()).await;

    preview_handle.abort();
    let _ = preview_handle.await;

    let network_collector = network_collector.and_then(|c| Arc::try_unwrap(c).ok());
    let console_collector = console_collector.and_then(|c| Arc::try_unwrap(c).ok());

    match shutdown_reason {
        ShutdownReason::Graceful => {
            graceful_shutdown(&paths, client, &managed, network_collector, console_collector, wants_dom, config.url, start).await;
            Ok(())
        }
        ShutdownReason::ChromeLost(reason) => {
            abnormal_shutdown(&paths, client, network_collector, console_collector, config.url, start, reason.clone()).await;
            Err(AppError::new(reason, ExitCode::ConnectionError))
        }
    }
}

/// Find or launch Chrome, returning the browser-level WebSocket URL to
/// connect to, the Chrome PID (`None` when attaching to a process we did
/// not spawn), and the debugging port in use.
async fn acquire_chrome(config: &StartConfig, connect_timeout: Duration) -> Result<(String, Option<u32>, u16), AppError> {
    if let Some(port) = config.port {
        if let Ok(version) = chrome::discovery::query_version("127.0.0.1", port).await {
            info!(port, "attached to already-running Chrome");
            return Ok((version.ws_debugger_url, None, port));
        }
    }

    let executable = match &config.chrome_path {
        Some(path) => std::path::PathBuf::from(path),
        None => chrome::platform::find_chrome_executable(chrome::platform::Channel::Stable)
            .map_err(AppError::from)?,
    };

    let port = match config.port {
        Some(p) => p,
        None => chrome::launcher::find_available_port().map_err(AppError::from)?,
    };

    let launch_config = LaunchConfig {
        executable,
        port,
        headless: config.headless,
        extra_args: Vec::new(),
        user_data_dir: config.user_data_dir.as_ref().map(std::path::PathBuf::from),
    };

    let process = chrome::launcher::launch_chrome(launch_config, connect_timeout)
        .await
        .map_err(AppError::from)?;

    let version = chrome::discovery::query_version("127.0.0.1", port)
        .await
        .map_err(AppError::from)?;

    let (pid, port) = process.detach();
    info!(pid, port, "launched Chrome");
    Ok((version.ws_debugger_url, Some(pid), port))
}

/// Drives the daemon-facing command loop until a `SIGTERM`, a closed stdin,
/// or a permanently lost CDP connection ends the session.
async fn main_loop(
    stdin_reader: &mut FramedReader<Stdin>,
    stdout_writer: &mut FramedWriter<Stdout>,
    client: &CdpClient,
    managed: &Arc<ManagedSession>,
    network_collector: Option<&NetworkCollector>,
    console_collector: Option<&ConsoleCollector>,
) -> ShutdownReason {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            return ShutdownReason::Graceful;
        }
    };

    let mut connectivity_ticker = tokio::time::interval(CONNECTIVITY_POLL_INTERVAL);
    let mut disconnected_since: Option<Instant> = None;

    loop {
        tokio::select! {
            frame = stdin_reader.read_frame::<WorkerRequest>() => {
                match frame {
                    Ok(Some(request)) => {
                        let command = request.command().to_owned();
                        let request_id = request.request_id.clone();
                        let result = commands::handle_request(&command, request.params, network_collector, console_collector, managed).await;
                        let response = match result {
                            Ok(data) => WorkerResponse::ok(&command, request_id, data),
                            Err(err) => WorkerResponse::err(&command, request_id, err),
                        };
                        if let Err(e) = stdout_writer.write_frame(&response).await {
                            warn!("failed to write response to daemon: {e}");
                            return ShutdownReason::Graceful;
                        }
                    }
                    Ok(None) => {
                        info!("daemon closed worker stdin, shutting down");
                        return ShutdownReason::Graceful;
                    }
                    Err(e) => {
                        warn!("malformed request from daemon: {e}");
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, starting graceful shutdown");
                return ShutdownReason::Graceful;
            }
            _ = connectivity_ticker.tick() => {
                if client.is_connected() {
                    disconnected_since = None;
                } else {
                    let since = *disconnected_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > RECONNECT_GRACE {
                        return ShutdownReason::ChromeLost(
                            "CDP connection lost and did not recover within the reconnect window".to_owned(),
                        );
                    }
                }
            }
        }
    }
}

async fn graceful_shutdown(
    paths: &BdgPaths,
    client: CdpClient,
    managed: &ManagedSession,
    network_collector: Option<NetworkCollector>,
    console_collector: Option<ConsoleCollector>,
    dom_enabled: bool,
    target_url: String,
    start: Instant,
) {
    let dom_data = if dom_enabled {
        telemetry::capture_dom_snapshot(managed).await
    } else {
        None
    };

    let network_snapshot = network_collector.as_ref().map(NetworkCollector::snapshot);
    let console_snapshot = console_collector.as_ref().map(ConsoleCollector::snapshot);

    if let Some(collector) = network_collector {
        collector.cleanup().await;
    }
    if let Some(collector) = console_collector {
        collector.cleanup().await;
    }

    let title = dom_data.as_ref().map_or_else(|| target_url.clone(), |d| d.title.clone());
    let url = dom_data.as_ref().map_or_else(|| target_url.clone(), |d| d.url.clone());

    let output = BdgOutput {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        success: true,
        timestamp: session::now_iso8601(),
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        duration: start.elapsed().as_millis() as i64,
        target: TargetInfo { url, title },
        data: BdgData {
            network: network_snapshot,
            console: console_snapshot,
            dom: dom_data,
        },
        error: None,
        partial: None,
    };

    if let Err(e) = session::atomic_write_json(&paths.output_file(), &output) {
        error!("failed to write session.json: {e}");
    }

    let _ = client.close().await;
}

async fn abnormal_shutdown(
    paths: &BdgPaths,
    client: CdpClient,
    network_collector: Option<NetworkCollector>,
    console_collector: Option<ConsoleCollector>,
    target_url: String,
    start: Instant,
    reason: String,
) {
    let network_snapshot = network_collector.as_ref().map(NetworkCollector::snapshot);
    let console_snapshot = console_collector.as_ref().map(ConsoleCollector::snapshot);

    if let Some(collector) = network_collector {
        collector.cleanup().await;
    }
    if let Some(collector) = console_collector {
        collector.cleanup().await;
    }

    let output = BdgOutput {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        success: false,
        timestamp: session::now_iso8601(),
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        duration: start.elapsed().as_millis() as i64,
        target: TargetInfo {
            url: target_url.clone(),
            title: target_url,
        },
        data: BdgData {
            network: network_snapshot,
            console: console_snapshot,
            dom: None,
        },
        error: Some(reason),
        partial: Some(true),
    };

    if let Err(e) = session::atomic_write_json(&paths.output_file(), &output) {
        error!("failed to write session.json: {e}");
    }

    let _ = client.close().await;
}

fn bounded_tail<T>(mut items: Vec<T>, max: usize) -> Vec<T> {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(0..excess);
    }
    items
}

/// Periodically writes a bounded `session.preview.json` so `bdg peek` has
/// something to read before the session ends (spec.md §4.7).
async fn run_preview_writer(
    paths: BdgPaths,
    network_collector: Option<Arc<NetworkCollector>>,
    console_collector: Option<Arc<ConsoleCollector>>,
    interval: Duration,
    max_entries: usize,
    target_url: String,
    start: Instant,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;

        let network_snapshot = network_collector
            .as_ref()
            .map(|c| bounded_tail(c.snapshot(), max_entries));
        let console_snapshot = console_collector
            .as_ref()
            .map(|c| bounded_tail(c.snapshot(), max_entries));

        let output = BdgOutput {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            success: true,
            timestamp: session::now_iso8601(),
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            duration: start.elapsed().as_millis() as i64,
            target: TargetInfo {
                url: target_url.clone(),
                title: String::new(),
            },
            data: BdgData {
                network: network_snapshot,
                console: console_snapshot,
                dom: None,
            },
            error: None,
            partial: Some(true),
        };

        if let Err(e) = session::atomic_write_json(&paths.preview_file(), &output) {
            warn!("failed to write session.preview.json: {e}");
        }
    }
}
