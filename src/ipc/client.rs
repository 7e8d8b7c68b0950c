//! CLI-side half of the Unix-socket IPC transport (spec.md §4.5, §4.6
//! Idle→Acquiring→DaemonReady): connect to an already-running daemon, or
//! spawn one detached and wait for its socket to come up.

use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, ExitCode};
use crate::ipc::{ClientRequest, ClientResponse, FramedReader, FramedWriter, IpcError, ResponseStatus};
use crate::session::BdgPaths;

/// Upper bound on how long `ensure_daemon_running` waits for a freshly
/// spawned daemon's socket to accept connections.
const DAEMON_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the handshake probe used to detect an already-running daemon.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// One request/response round trip over the daemon's Unix socket.
///
/// # Errors
///
/// Returns `AppError` if the socket cannot be connected to, the round trip
/// exceeds `timeout`, or the daemon responds with an error envelope (in
/// which case the `IpcError`'s wire code is mapped back onto an `ExitCode`).
pub async fn call(paths: &BdgPaths, command: &str, params: Value, timeout: Duration) -> Result<Value, AppError> {
    let stream = UnixStream::connect(paths.socket_file())
        .await
        .map_err(|e| AppError::new(format!("could not connect to daemon: {e}"), ExitCode::ConnectionError))?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedReader::new(read_half);
    let mut writer = FramedWriter::new(write_half);

    let session_id = Uuid::new_v4().to_string();
    let request = ClientRequest::new(command, session_id, params);

    let round_trip = async {
        writer
            .write_frame(&request)
            .await
            .map_err(|e| AppError::new(format!("failed to send {command} request: {e}"), ExitCode::ConnectionError))?;

        let response: ClientResponse = reader
            .read_frame()
            .await
            .map_err(|e| AppError::new(format!("failed to read {command} response: {e}"), ExitCode::ConnectionError))?
            .ok_or_else(|| AppError::new("daemon closed the connection without responding", ExitCode::ConnectionError))?;

        to_result(response)
    };

    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| AppError::new(format!("{command} request to daemon timed out"), ExitCode::CdpTimeout))?
}

fn to_result(response: ClientResponse) -> Result<Value, AppError> {
    match response.status {
        ResponseStatus::Ok => Ok(response.data.unwrap_or(Value::Null)),
        ResponseStatus::Error => {
            let err = response
                .error
                .unwrap_or_else(|| IpcError::new("GENERAL_ERROR", "daemon reported an error with no detail"));
            Err(AppError {
                message: err.message,
                code: exit_code_from_wire(&err.code),
                custom_json: err.extra,
            })
        }
    }
}

fn exit_code_from_wire(code: &str) -> ExitCode {
    match code {
        "INVALID_ARGS" | "UNKNOWN_COMMAND" => ExitCode::InvalidArgs,
        "SESSION_ALREADY_RUNNING" => ExitCode::ResourceBusy,
        "SESSION_NOT_FOUND" => ExitCode::ResourceNotFound,
        "WORKER_START_FAILED" => ExitCode::WorkerStartFailed,
        "CDP_TIMEOUT" => ExitCode::CdpTimeout,
        "CONNECTION_ERROR" => ExitCode::ConnectionError,
        "PROTOCOL_ERROR" => ExitCode::ProtocolError,
        "KILL_FAILED" => ExitCode::ResourceKillFailed,
        "DAEMON_ERROR" => ExitCode::DaemonError,
        _ => ExitCode::GeneralError,
    }
}

/// Connect to an already-running daemon; if none answers, spawn one
/// detached and poll its socket with exponential backoff until it accepts
/// connections or `DAEMON_READY_TIMEOUT` elapses.
///
/// # Errors
///
/// Returns `AppError` if the daemon binary cannot be spawned, or never
/// becomes reachable within the timeout.
pub async fn ensure_daemon_running(paths: &BdgPaths) -> Result<(), AppError> {
    if handshake(paths).await.is_ok() {
        return Ok(());
    }

    spawn_detached_daemon(paths)?;

    let deadline = tokio::time::Instant::now() + DAEMON_READY_TIMEOUT;
    let mut backoff = Duration::from_millis(50);
    loop {
        if handshake(paths).await.is_ok() {
            info!("daemon is up");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::new("daemon did not become ready in time", ExitCode::DaemonError));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(500));
    }
}

async fn handshake(paths: &BdgPaths) -> Result<(), AppError> {
    call(paths, "handshake", serde_json::json!({}), HANDSHAKE_TIMEOUT).await.map(|_| ())
}

/// Re-exec the current binary as `bdg __daemon`, detached from the
/// controlling terminal (`setsid`) with its stdio closed, so it survives
/// the CLI process exiting.
fn spawn_detached_daemon(paths: &BdgPaths) -> Result<(), AppError> {
    paths.ensure_base_dir().map_err(AppError::from)?;

    let exe = std::env::current_exe()
        .map_err(|e| AppError::new(format!("could not resolve current executable: {e}"), ExitCode::DaemonError))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("__daemon");
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid(2) is async-signal-safe; called here between fork
        // and exec to detach the daemon from the CLI's session so it is not
        // killed by a SIGHUP when the CLI's terminal closes.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    debug!("spawning detached daemon");
    cmd.spawn()
        .map(|_child| ())
        .map_err(|e| AppError::new(format!("failed to spawn daemon process: {e}"), ExitCode::DaemonError))
}
