use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, ExitCode};
use crate::ipc::{FramedReader, FramedWriter, WorkerReady, WorkerRequest, WorkerResponse};
use crate::session::BdgPaths;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<WorkerResponse>>>>;

/// A handle to the spawned `bdg __worker` child process, correlating
/// forwarded commands with their responses by `requestId` (spec.md §4.5).
pub struct WorkerHandle {
    child: Child,
    writer: FramedWriter<ChildStdin>,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send a command to the worker and await its response, correlated by a
    /// freshly minted `requestId`.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the worker's stdin is closed, or times out.
    pub async fn call(
        &mut self,
        command: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<WorkerResponse, AppError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let request = WorkerRequest::new(command, request_id.clone(), params);
        if let Err(e) = self.writer.write_frame(&request).await {
            self.pending.lock().remove(&request_id);
            return Err(AppError::new(
                format!("failed to forward {command} to worker: {e}"),
                ExitCode::WorkerStartFailed,
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AppError::new(
                format!("worker closed its response stream while handling {command}"),
                ExitCode::CdpTimeout,
            )),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(AppError::new(
                    format!("worker did not respond to {command} in time"),
                    ExitCode::CdpTimeout,
                ))
            }
        }
    }

    /// Send `SIGTERM` to the worker process (spec.md §4.6 "Stop-session").
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.pid();
        }
    }

    /// Waits for the child process to exit, aborting the response-forwarding
    /// task afterward.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        let status = self.child.wait().await;
        self.reader_task.abort();
        status
    }
}

/// Spawn the worker subprocess (re-exec of the current binary with
/// `__worker`), hand it the start configuration as the first JSONL line on
/// stdin, and wait (bounded by `ready_timeout`) for its `worker_ready` line.
///
/// # Errors
///
/// Returns `AppError::new(.., ExitCode::WorkerStartFailed)` if the process
/// cannot be spawned or exits/sends invalid data before becoming ready, or
/// `ExitCode::CdpTimeout` if no ready signal arrives in time (spec.md §4.6
/// "Worker start failure").
pub async fn spawn_worker(
    paths: &BdgPaths,
    start_config: &serde_json::Value,
    ready_timeout: Duration,
) -> Result<(WorkerHandle, WorkerReady), AppError> {
    let exe = std::env::current_exe()
        .map_err(|e| AppError::new(format!("could not resolve current executable: {e}"), ExitCode::WorkerStartFailed))?;

    let log_file = File::create(paths.worker_log_file())
        .map_err(|e| AppError::new(format!("could not open worker log file: {e}"), ExitCode::WorkerStartFailed))?;

    let mut child = tokio::process::Command::new(exe)
        .arg("__worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file))
        .spawn()
        .map_err(|e| AppError::new(format!("failed to spawn worker process: {e}"), ExitCode::WorkerStartFailed))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::new("worker stdin unavailable", ExitCode::WorkerStartFailed))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::new("worker stdout unavailable", ExitCode::WorkerStartFailed))?;

    let mut writer = FramedWriter::new(stdin);
    writer
        .write_frame(start_config)
        .await
        .map_err(|e| AppError::new(format!("failed to send start config to worker: {e}"), ExitCode::WorkerStartFailed))?;

    let mut reader = FramedReader::new(stdout);
    let ready = match tokio::time::timeout(ready_timeout, reader.read_frame::<WorkerReady>()).await {
        Ok(Ok(Some(ready))) => ready,
        Ok(Ok(None)) => {
            let _ = child.kill().await;
            return Err(AppError::new("worker exited before sending worker_ready", ExitCode::WorkerStartFailed));
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(AppError::new(format!("invalid worker_ready payload: {e}"), ExitCode::WorkerStartFailed));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(AppError::new("worker did not become ready in time", ExitCode::CdpTimeout));
        }
    };

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let reader_task = tokio::spawn(forward_responses(reader, Arc::clone(&pending)));

    Ok((
        WorkerHandle {
            child,
            writer,
            pending,
            reader_task,
        },
        ready,
    ))
}

async fn forward_responses(mut reader: FramedReader<tokio::process::ChildStdout>, pending: PendingMap) {
    loop {
        match reader.read_frame::<WorkerResponse>().await {
            Ok(Some(response)) => {
                let waiter = pending.lock().remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("dropping worker response for unknown requestId {}", response.request_id),
                }
            }
            Ok(None) => {
                debug!("worker stdout closed");
                return;
            }
            Err(e) => {
                warn!("failed to parse worker response: {e}");
            }
        }
    }
}
