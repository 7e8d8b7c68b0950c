use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::session::{pid_is_alive, read_pid_file, remove_if_exists, BdgPaths};

/// Session lifecycle states (spec.md §4.6). Tracked by the daemon for
/// `status` reporting; not all transitions are reachable from every state
/// (e.g. a crash can jump straight from `Collecting` to `Stopped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    DaemonReady,
    WorkerStarting,
    Collecting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::DaemonReady => "daemon_ready",
            Self::WorkerStarting => "worker_starting",
            Self::Collecting => "collecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Held for the daemon process's lifetime; removes `session.lock` on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = remove_if_exists(&self.path);
    }
}

#[derive(Debug)]
pub enum LockError {
    /// Another daemon holds the lock and its PID is alive.
    AlreadyRunning { pid: u32 },
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning { pid } => write!(f, "a daemon is already running (pid {pid})"),
            Self::Io(e) => write!(f, "lock file I/O error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Acquire the daemon singleton lock (spec.md §4.5 "Daemon singleton").
///
/// Mirrors a PID-file `try_acquire`: create the lock file exclusively; if it
/// already exists, read the PID it names and check liveness via
/// `kill(pid, None)`. A live owner means this candidate yields; a stale lock
/// (owner PID dead) is removed and acquisition is retried exactly once.
///
/// # Errors
///
/// Returns `LockError::AlreadyRunning` if a live daemon holds the lock, or
/// `LockError::Io` for any other filesystem failure.
pub fn acquire_lock(paths: &BdgPaths) -> Result<LockGuard, LockError> {
    let lock_path = paths.lock_file();
    match try_create_exclusive(&lock_path) {
        Ok(()) => return Ok(LockGuard { path: lock_path }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(LockError::Io(e)),
    }

    if let Ok(Some(pid)) = read_pid_file(&lock_path) {
        if pid_is_alive(pid) {
            return Err(LockError::AlreadyRunning { pid });
        }
        warn!("removing stale daemon lock for dead pid {pid}");
    }
    remove_if_exists(&lock_path).map_err(LockError::Io)?;

    try_create_exclusive(&lock_path).map_err(LockError::Io)?;
    Ok(LockGuard { path: lock_path })
}

fn try_create_exclusive(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())?;
    info!("acquired daemon lock at {}", path.display());
    Ok(())
}

/// Information about an already-running session, returned to the CLI as
/// `SESSION_ALREADY_RUNNING` (spec.md §4.6 "Start-session preflight").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictInfo {
    pub pid: u32,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "elapsedSeconds")]
    pub elapsed_seconds: i64,
}

/// Checks whether a session is already active, per the preflight rule: if
/// `session.pid` exists and names a live process, the session is active.
#[must_use]
pub fn check_existing_session(paths: &BdgPaths) -> Option<ConflictInfo> {
    let pid = read_pid_file(&paths.pid_file()).ok().flatten()?;
    if !pid_is_alive(pid) {
        return None;
    }
    let meta: crate::session::SessionMetadata =
        crate::session::read_json(&paths.meta_file()).ok().flatten()?;
    let elapsed_seconds = (crate::session::now_epoch_millis() - meta.start_time) / 1000;
    Some(ConflictInfo {
        pid,
        target_url: meta.target_url,
        start_time: meta.start_time,
        elapsed_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_paths() -> (tempfile::TempDir, BdgPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = BdgPaths::from_base(dir.path().to_path_buf());
        paths.ensure_base_dir().unwrap();
        (dir, paths)
    }

    #[test]
    #[serial]
    fn acquire_lock_succeeds_when_unlocked() {
        let (_dir, paths) = test_paths();
        let guard = acquire_lock(&paths).unwrap();
        assert!(paths.lock_file().exists());
        drop(guard);
        assert!(!paths.lock_file().exists());
    }

    #[test]
    #[serial]
    fn acquire_lock_fails_against_live_owner() {
        let (_dir, paths) = test_paths();
        let _guard = acquire_lock(&paths).unwrap();
        // Our own process is alive, so a second acquisition attempt (in the
        // same process, simulating a second daemon candidate) must fail.
        let err = acquire_lock(&paths).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    #[serial]
    fn acquire_lock_recovers_from_stale_owner() {
        let (_dir, paths) = test_paths();
        crate::session::write_pid_file(&paths.lock_file(), 999_999).unwrap();
        let guard = acquire_lock(&paths).unwrap();
        drop(guard);
    }

    #[test]
    fn no_existing_session_when_pid_file_absent() {
        let (_dir, paths) = test_paths();
        assert!(check_existing_session(&paths).is_none());
    }
}
