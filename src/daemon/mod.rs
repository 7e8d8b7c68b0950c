//! The persistent daemon process (`bdg __daemon`): owns the Unix socket the
//! CLI talks to, supervises the worker subprocess, and is the only process
//! that writes `session.pid` / `session.meta.json` (spec.md §4.5, §4.6).

pub mod lifecycle;
pub mod worker_proc;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::error::{AppError, ExitCode};
use crate::ipc::{ClientRequest, ClientResponse, FramedReader, FramedWriter, IpcError};
use crate::session::{self, BdgPaths, SessionMetadata};

use lifecycle::{LockGuard, SessionState, acquire_lock, check_existing_session};
use worker_proc::{WorkerHandle, spawn_worker};

/// How long the daemon waits for a freshly spawned worker to report
/// `worker_ready` (covers Chrome launch plus the CDP connect/handshake
/// window from spec.md §4.1).
const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for `peek`/`details`/`cdp_call` forwarded to the worker
/// (spec.md §4.5: 5-10s depending on command).
const PEEK_TIMEOUT: Duration = Duration::from_secs(5);
const CDP_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the daemon waits for the worker to exit after `SIGTERM` before
/// giving up and proceeding with cleanup anyway (spec.md §4.6 "Stop-session
/// from daemon").
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon exits this long after a successful `stop_session`, so the
/// response has already reached the CLI over the socket.
const EXIT_DELAY: Duration = Duration::from_millis(100);

struct DaemonState {
    lifecycle: SessionState,
    worker: Option<WorkerHandle>,
    meta: Option<SessionMetadata>,
}

impl DaemonState {
    fn idle() -> Self {
        Self {
            lifecycle: SessionState::Idle,
            worker: None,
            meta: None,
        }
    }
}

/// Run the daemon to completion. Returns once a client has requested
/// `stop_session` and the grace period has elapsed, or on a fatal startup
/// error. Dropping the returned lock (on any return path) releases
/// `session.lock`.
///
/// # Errors
///
/// Returns `AppError` if the singleton lock cannot be acquired or the Unix
/// socket cannot be bound.
pub async fn run(paths: BdgPaths) -> Result<(), AppError> {
    paths
        .ensure_base_dir()
        .map_err(|e| AppError::new(e.to_string(), ExitCode::DaemonError))?;

    let lock = acquire_lock(&paths)
        .map_err(|e| AppError::new(e.to_string(), ExitCode::ResourceBusy))?;

    session::write_pid_file(&paths.daemon_pid_file(), std::process::id())
        .map_err(|e| AppError::new(e.to_string(), ExitCode::DaemonError))?;

    let _ = session::remove_if_exists(&paths.socket_file());
    let listener = UnixListener::bind(paths.socket_file())
        .map_err(|e| AppError::new(format!("failed to bind daemon socket: {e}"), ExitCode::DaemonError))?;

    info!("daemon listening on {}", paths.socket_file().display());

    let state = Arc::new(Mutex::new(DaemonState::idle()));
    let shutdown = Arc::new(Notify::new());
    let paths = Arc::new(paths);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let paths = Arc::clone(&paths);
                        let shutdown = Arc::clone(&shutdown);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state, paths, shutdown).await {
                                warn!("connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            () = shutdown.notified() => {
                info!("daemon shutting down");
                break;
            }
        }
    }

    let _ = session::remove_if_exists(&paths.socket_file());
    let _ = session::remove_if_exists(&paths.daemon_pid_file());
    drop_lock(lock);
    Ok(())
}

/// Explicit drop, named so the release is visible at the call site rather
/// than implicit in scope exit.
fn drop_lock(lock: LockGuard) {
    drop(lock);
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<Mutex<DaemonState>>,
    paths: Arc<BdgPaths>,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedReader::new(read_half);
    let mut writer = FramedWriter::new(write_half);

    loop {
        let request: ClientRequest = match reader.read_frame().await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("malformed client request: {e}");
                return Ok(());
            }
        };

        let command = request.command().to_owned();
        let response = match dispatch(&command, request.params.clone(), &state, &paths, &shutdown).await {
            Ok(data) => ClientResponse::ok(&command, request.session_id.clone(), data),
            Err(err) => ClientResponse::err(&command, request.session_id.clone(), err),
        };

        if writer.write_frame(&response).await.is_err() {
            return Ok(());
        }
    }
}

async fn dispatch(
    command: &str,
    params: Value,
    state: &Arc<Mutex<DaemonState>>,
    paths: &Arc<BdgPaths>,
    shutdown: &Arc<Notify>,
) -> Result<Value, IpcError> {
    match command {
        "handshake" => Ok(json!({
            "daemonPid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
        "status" => Ok(status(state).await),
        "start_session" => start_session(params, state, paths).await,
        "stop_session" => stop_session(state, paths, shutdown).await,
        "peek" => forward_to_worker("peek", params, state, PEEK_TIMEOUT).await,
        "details" => forward_to_worker("details", params, state, PEEK_TIMEOUT).await,
        "cdp_call" => forward_to_worker("cdp_call", params, state, CDP_CALL_TIMEOUT).await,
        other => Err(IpcError::new(
            crate::error::ErrorCode::UnknownCommand.as_str(),
            format!("unknown command: {other}"),
        )),
    }
}

async fn status(state: &Arc<Mutex<DaemonState>>) -> Value {
    let guard = state.lock().await;
    json!({
        "daemonPid": std::process::id(),
        "state": guard.lifecycle.to_string(),
        "session": guard.meta,
    })
}

async fn start_session(
    params: Value,
    state: &Arc<Mutex<DaemonState>>,
    paths: &Arc<BdgPaths>,
) -> Result<Value, IpcError> {
    if let Some(conflict) = check_existing_session(paths) {
        let extra = serde_json::to_value(&conflict).unwrap_or(Value::Null);
        return Err(IpcError::new(
            crate::error::ErrorCode::SessionAlreadyRunning.as_str(),
            format!("a session is already running (pid {})", conflict.pid),
        )
        .with_extra(extra));
    }

    {
        let mut guard = state.lock().await;
        guard.lifecycle = SessionState::WorkerStarting;
    }

    let (worker, ready) = spawn_worker(paths, &params, WORKER_READY_TIMEOUT)
        .await
        .map_err(|e| IpcError::new(e.error_code().as_str(), e.message))?;

    let telemetry = params["telemetry"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let meta = SessionMetadata {
        daemon_pid: std::process::id(),
        worker_pid: ready.worker_pid,
        chrome_pid: ready.chrome_pid.unwrap_or(0),
        start_time: session::now_epoch_millis(),
        port: ready.port,
        target_id: ready.target_id.clone(),
        web_socket_debugger_url: ready.web_socket_debugger_url.clone(),
        target_url: ready.target_url.clone(),
        active_telemetry: telemetry,
    };

    if let Err(e) = session::write_pid_file(&paths.pid_file(), ready.worker_pid) {
        warn!("failed to write session.pid: {e}");
    }
    if let Err(e) = session::atomic_write_json(&paths.meta_file(), &meta) {
        warn!("failed to write session.meta.json: {e}");
    }

    let response = json!({
        "workerPid": ready.worker_pid,
        "chromePid": ready.chrome_pid,
        "port": ready.port,
        "targetId": ready.target_id,
        "webSocketDebuggerUrl": ready.web_socket_debugger_url,
        "targetUrl": ready.target_url,
    });

    // `worker` is moved into the shared state only after every fallible
    // step above has succeeded, so a mid-setup failure never leaves a
    // zombie worker handle behind.
    let mut guard = state.lock().await;
    guard.lifecycle = SessionState::Collecting;
    guard.worker = Some(worker);
    guard.meta = Some(meta);

    Ok(response)
}

async fn stop_session(
    state: &Arc<Mutex<DaemonState>>,
    paths: &Arc<BdgPaths>,
    shutdown: &Arc<Notify>,
) -> Result<Value, IpcError> {
    let (mut worker, chrome_pid) = {
        let mut guard = state.lock().await;
        let Some(worker) = guard.worker.take() else {
            return Err(IpcError::new(
                crate::error::ErrorCode::SessionNotFound.as_str(),
                "no active session",
            ));
        };
        guard.lifecycle = SessionState::Stopping;
        let chrome_pid = guard.meta.as_ref().map(|m| m.chrome_pid);
        (worker, chrome_pid)
    };

    worker.terminate();
    if tokio::time::timeout(STOP_WAIT_TIMEOUT, worker.wait()).await.is_err() {
        warn!("worker did not exit within {STOP_WAIT_TIMEOUT:?} of SIGTERM");
    }

    let _ = session::remove_if_exists(&paths.pid_file());
    let _ = session::remove_if_exists(&paths.meta_file());
    let _ = session::remove_if_exists(&paths.preview_file());

    {
        let mut guard = state.lock().await;
        guard.lifecycle = SessionState::Stopped;
    }

    let shutdown = Arc::clone(shutdown);
    tokio::spawn(async move {
        tokio::time::sleep(EXIT_DELAY).await;
        shutdown.notify_waiters();
    });

    Ok(json!({ "stopped": true, "chromePid": chrome_pid }))
}

async fn forward_to_worker(
    command: &str,
    params: Value,
    state: &Arc<Mutex<DaemonState>>,
    timeout: Duration,
) -> Result<Value, IpcError> {
    let mut guard = state.lock().await;
    let Some(worker) = guard.worker.as_mut() else {
        return Err(IpcError::new(
            crate::error::ErrorCode::SessionNotFound.as_str(),
            "no active session",
        ));
    };

    match worker.call(command, params, timeout).await {
        Ok(resp) if resp.success => Ok(resp.data.unwrap_or(Value::Null)),
        Ok(resp) => Err(resp
            .error
            .unwrap_or_else(|| IpcError::new(crate::error::ErrorCode::GeneralError.as_str(), "worker reported failure"))),
        Err(app_err) => Err(IpcError::new(app_err.error_code().as_str(), app_err.message)),
    }
}
