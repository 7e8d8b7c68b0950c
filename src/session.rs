use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur during session file operations.
#[derive(Debug)]
pub enum SessionError {
    /// Could not determine home directory.
    NoHomeDir,
    /// I/O error reading/writing a session artifact.
    Io(std::io::Error),
    /// A session artifact contains invalid JSON.
    InvalidFormat(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomeDir => write!(f, "could not determine home directory"),
            Self::Io(e) => write!(f, "session file error: {e}"),
            Self::InvalidFormat(e) => write!(f, "invalid session file: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::NoHomeDir | Self::InvalidFormat(_) => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SessionError> for crate::error::AppError {
    fn from(e: SessionError) -> Self {
        use crate::error::ExitCode;
        Self::new(e.to_string(), ExitCode::GeneralError)
    }
}

/// All filesystem locations a `bdg` session touches, rooted at `~/.bdg/`.
///
/// Centralizing these here means the daemon, the worker, and the CLI agree
/// on layout without passing paths around by hand.
#[derive(Debug, Clone)]
pub struct BdgPaths {
    base: PathBuf,
}

impl BdgPaths {
    /// Resolve `~/.bdg`. Honors `$BDG_HOME` first, for tests and for
    /// operators who want the state directory elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoHomeDir` if neither `$BDG_HOME` nor the
    /// platform home directory can be determined.
    pub fn new() -> Result<Self, SessionError> {
        if let Ok(dir) = std::env::var("BDG_HOME") {
            return Ok(Self { base: PathBuf::from(dir) });
        }
        let home = dirs::home_dir().ok_or(SessionError::NoHomeDir)?;
        Ok(Self { base: home.join(".bdg") })
    }

    #[must_use]
    pub fn from_base(base: PathBuf) -> Self {
        Self { base }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `session.lock` — daemon PID, exclusive-create singleton guard.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.base.join("session.lock")
    }

    /// `session.pid` — worker PID, written when the worker becomes ready.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.base.join("session.pid")
    }

    /// `daemon.pid` — daemon PID, written at daemon start.
    #[must_use]
    pub fn daemon_pid_file(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }

    /// `session.meta.json` — structured `SessionMetadata`.
    #[must_use]
    pub fn meta_file(&self) -> PathBuf {
        self.base.join("session.meta.json")
    }

    /// `session.preview.json` — bounded periodic snapshot.
    #[must_use]
    pub fn preview_file(&self) -> PathBuf {
        self.base.join("session.preview.json")
    }

    /// `session.json` — full output, written once on graceful stop.
    #[must_use]
    pub fn output_file(&self) -> PathBuf {
        self.base.join("session.json")
    }

    /// `daemon.sock` — the daemon's Unix domain socket.
    #[must_use]
    pub fn socket_file(&self) -> PathBuf {
        self.base.join("daemon.sock")
    }

    #[must_use]
    pub fn daemon_log_file(&self) -> PathBuf {
        self.base.join("daemon.log")
    }

    #[must_use]
    pub fn worker_log_file(&self) -> PathBuf {
        self.base.join("worker.log")
    }

    /// Create `~/.bdg` (mode `0o700` on Unix) if it does not already exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Io` on I/O failure.
    pub fn ensure_base_dir(&self) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.base)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.base, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file,
/// fsync-free rename over the destination. Sets `0o600` on Unix.
///
/// # Errors
///
/// Returns `SessionError::Io` on I/O failure.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Serialize `value` to pretty JSON and write it atomically to `path`.
///
/// # Errors
///
/// Returns `SessionError::InvalidFormat` if serialization fails, or
/// `SessionError::Io` on I/O failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SessionError::InvalidFormat(e.to_string()))?;
    atomic_write(path, &json)
}

/// Read and deserialize a JSON file. Returns `Ok(None)` if it does not exist.
///
/// Callers that must tolerate a reader racing a writer's rename (per
/// spec.md §5) should retry once on `InvalidFormat` before treating the
/// artifact as corrupt.
///
/// # Errors
///
/// Returns `SessionError::InvalidFormat` if the file contains invalid JSON,
/// or `SessionError::Io` on other I/O errors.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, SessionError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value = serde_json::from_str(&contents)
                .map_err(|e| SessionError::InvalidFormat(e.to_string()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::Io(e)),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// # Errors
///
/// Returns `SessionError::Io` on I/O errors other than "not found".
pub fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::Io(e)),
    }
}

/// Write a PID as bare ASCII to `path` (the format used by `session.lock`,
/// `session.pid`, and `daemon.pid`).
///
/// # Errors
///
/// Returns `SessionError::Io` on I/O failure.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), SessionError> {
    atomic_write(path, &pid.to_string())
}

/// Read a bare-ASCII PID file. Returns `Ok(None)` if absent or unparsable
/// (a torn read during a concurrent writer's rename is treated as absent
/// by callers, which retry).
///
/// # Errors
///
/// Returns `SessionError::Io` on I/O errors other than "not found".
pub fn read_pid_file(path: &Path) -> Result<Option<u32>, SessionError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionError::Io(e)),
    }
}

/// Returns `true` if a process with the given PID currently exists.
///
/// Uses `kill(pid, 0)` (POSIX "does this process exist" idiom) rather than
/// sending any real signal.
#[cfg(unix)]
#[must_use]
pub fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// Structured session metadata, persisted to `session.meta.json` when the
/// worker becomes ready and updated on navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "daemonPid")]
    pub daemon_pid: u32,
    #[serde(rename = "workerPid")]
    pub worker_pid: u32,
    #[serde(rename = "chromePid")]
    pub chrome_pid: u32,
    /// Epoch milliseconds.
    #[serde(rename = "startTime")]
    pub start_time: i64,
    pub port: u16,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    /// Subset of `{network, console, dom}`.
    #[serde(rename = "activeTelemetry")]
    pub active_telemetry: Vec<String>,
}

/// One completed or failed network request (spec.md §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub url: String,
    pub method: String,
    /// Epoch milliseconds of observation (time of `requestWillBeSent`).
    pub timestamp: i64,
    /// 0 denotes `loadingFailed`; absent means a response was never
    /// observed before promotion (should not happen in practice, but the
    /// field stays optional to mirror the data model exactly).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(rename = "requestHeaders", skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(rename = "responseHeaders", skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(rename = "requestBody", skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// The literal body, a `[SKIPPED: <reason>]` marker, or absent.
    #[serde(rename = "responseBody", skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(rename = "navigationId", skip_serializing_if = "Option::is_none")]
    pub navigation_id: Option<u64>,
}

/// One console message or uncaught exception (spec.md §3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<serde_json::Value>>,
}

/// One-shot DOM capture at graceful stop (spec.md §3.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomData {
    pub url: String,
    pub title: String,
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BdgData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Vec<NetworkRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<Vec<ConsoleMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom: Option<DomData>,
}

/// The top-level artifact written to `session.json` (and, in bounded form,
/// to `session.preview.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BdgOutput {
    pub version: String,
    pub success: bool,
    /// ISO 8601, e.g. `"2026-02-11T12:00:00Z"`.
    pub timestamp: String,
    /// Milliseconds.
    pub duration: i64,
    pub target: TargetInfo,
    pub data: BdgData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `true` only in `session.preview.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_epoch_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Format the current time as a simplified ISO 8601 string (e.g., `"2026-02-11T12:00:00Z"`).
///
/// Uses the Howard Hinnant algorithm for civil date computation from Unix timestamp.
#[must_use]
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    format_unix_secs(secs)
}

#[allow(
    clippy::similar_names,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn format_unix_secs(secs: u64) -> String {
    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    // Howard Hinnant's algorithm for civil date from days since epoch
    let mut days = (secs / 86_400) as i64;
    days += 719_468; // shift epoch from 1970-01-01 to 0000-03-01
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u32; // [0, 146096]
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let y = i64::from(year_of_era) + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100); // [0, 365]
    let mp = (5 * day_of_year + 2) / 153; // month index [0, 11]
    let d = day_of_year - (153 * mp + 2) / 5 + 1; // day [1, 31]
    let m = if mp < 10 { mp + 3 } else { mp - 9 }; // month [1, 12]
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}
