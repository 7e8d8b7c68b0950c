use std::fmt;

use serde::Serialize;

/// Stable process exit codes, one family per failure category from the
/// error taxonomy: user errors, external failures, system errors, and
/// timeouts each get their own code so callers can branch on exit status
/// without parsing stderr.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConnectionError = 2,
    TargetError = 3,
    TimeoutError = 4,
    ProtocolError = 5,
    InvalidArgs = 6,
    ResourceBusy = 7,
    ResourceNotFound = 8,
    ResourceKillFailed = 9,
    CdpTimeout = 10,
    WorkerStartFailed = 11,
    DaemonError = 12,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::TargetError => write!(f, "target error"),
            Self::TimeoutError => write!(f, "timeout error"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::InvalidArgs => write!(f, "invalid arguments"),
            Self::ResourceBusy => write!(f, "resource busy"),
            Self::ResourceNotFound => write!(f, "resource not found"),
            Self::ResourceKillFailed => write!(f, "resource kill failed"),
            Self::CdpTimeout => write!(f, "CDP timeout"),
            Self::WorkerStartFailed => write!(f, "worker start failed"),
            Self::DaemonError => write!(f, "daemon error"),
        }
    }
}

/// A machine-readable error code embedded in JSON error payloads, distinct
/// from the process [`ExitCode`]: several `ErrorCode` variants can share a
/// single exit code (e.g. both `SESSION_ALREADY_RUNNING` and
/// `SESSION_NOT_FOUND` exit under `ResourceBusy`/`ResourceNotFound`) while
/// still being distinguishable by JSON consumers checking `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgs,
    UnknownCommand,
    SessionAlreadyRunning,
    SessionNotFound,
    WorkerStartFailed,
    CdpTimeout,
    ConnectionError,
    ProtocolError,
    KillFailed,
    DaemonError,
    GeneralError,
}

impl ErrorCode {
    /// The `SCREAMING_SNAKE_CASE` wire form, for embedding in IPC envelopes
    /// that carry a bare `code: String` rather than this enum directly.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgs => "INVALID_ARGS",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::SessionAlreadyRunning => "SESSION_ALREADY_RUNNING",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::WorkerStartFailed => "WORKER_START_FAILED",
            Self::CdpTimeout => "CDP_TIMEOUT",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::KillFailed => "KILL_FAILED",
            Self::DaemonError => "DAEMON_ERROR",
            Self::GeneralError => "GENERAL_ERROR",
        }
    }
}

/// The application's top-level error type. Every command handler returns
/// `Result<T, AppError>`; `main` turns the `Err` case into a stable exit
/// code plus either a human failure line (default) or a JSON error object
/// (`--json`).
#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub code: ExitCode,
    /// Extra structured context folded into the JSON error payload, e.g.
    /// the conflicting session's pid/targetUrl/startTime for
    /// `SESSION_ALREADY_RUNNING`.
    pub custom_json: Option<serde_json::Value>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    success: bool,
    error: &'a str,
    code: u8,
    #[serde(rename = "errorCode")]
    error_code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none", flatten)]
    extra: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(message: impl Into<String>, code: ExitCode) -> Self {
        Self {
            message: message.into(),
            code,
            custom_json: None,
        }
    }

    #[must_use]
    pub fn with_json(mut self, extra: serde_json::Value) -> Self {
        self.custom_json = Some(extra);
        self
    }

    pub fn not_implemented(command: &str) -> Self {
        Self::new(format!("{command}: not yet implemented"), ExitCode::GeneralError)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::InvalidArgs)
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(format!("unknown command: {name}"), ExitCode::InvalidArgs)
    }

    /// The `errorCode` enum member surfaced in JSON output. Most variants
    /// map 1:1 onto an [`ExitCode`]; a handful share one.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self.code {
            ExitCode::Success | ExitCode::GeneralError => ErrorCode::GeneralError,
            ExitCode::ConnectionError => ErrorCode::ConnectionError,
            ExitCode::TargetError | ExitCode::ResourceNotFound => ErrorCode::SessionNotFound,
            ExitCode::TimeoutError | ExitCode::CdpTimeout => ErrorCode::CdpTimeout,
            ExitCode::ProtocolError => ErrorCode::ProtocolError,
            ExitCode::InvalidArgs => ErrorCode::InvalidArgs,
            ExitCode::ResourceBusy => ErrorCode::SessionAlreadyRunning,
            ExitCode::ResourceKillFailed => ErrorCode::KillFailed,
            ExitCode::WorkerStartFailed => ErrorCode::WorkerStartFailed,
            ExitCode::DaemonError => ErrorCode::DaemonError,
        }
    }

    pub fn to_json(&self) -> String {
        let output = ErrorOutput {
            success: false,
            error: &self.message,
            code: self.code as u8,
            error_code: self.error_code(),
            extra: self.custom_json.clone(),
        };
        serde_json::to_string(&output).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}","code":{}}}"#,
                self.message, self.code as u8
            )
        })
    }

    pub fn print_json_stderr(&self) {
        eprintln!("{}", self.to_json());
    }

    /// Human-readable failure line plus an optional suggestion, e.g. a
    /// `bdg cleanup --aggressive` follow-up hint.
    pub fn print_human_stderr(&self, suggestion: Option<&str>) {
        eprintln!("error: {}", self.message);
        if let Some(s) = suggestion {
            eprintln!("  suggestion: {s}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_implemented_produces_json_with_error_and_code() {
        let err = AppError::not_implemented("tabs");
        let json = err.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["error"], "tabs: not yet implemented");
        assert_eq!(parsed["code"], 1);
        assert_eq!(parsed["success"], false);
    }

    #[test]
    fn exit_code_display() {
        assert_eq!(ExitCode::Success.to_string(), "success");
        assert_eq!(ExitCode::GeneralError.to_string(), "general error");
        assert_eq!(ExitCode::ResourceBusy.to_string(), "resource busy");
        assert_eq!(ExitCode::CdpTimeout.to_string(), "CDP timeout");
    }

    #[test]
    fn app_error_display() {
        let err = AppError::new("connect: not yet implemented", ExitCode::GeneralError);
        assert_eq!(
            err.to_string(),
            "general error: connect: not yet implemented"
        );
    }

    #[test]
    fn custom_json_is_flattened_into_payload() {
        let err = AppError::new("already running", ExitCode::ResourceBusy).with_json(
            serde_json::json!({"existingSession": {"pid": 123, "targetUrl": "https://example.com"}}),
        );
        let json: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(json["existingSession"]["pid"], 123);
        assert_eq!(json["errorCode"], "SESSION_ALREADY_RUNNING");
    }

    #[test]
    fn error_code_mapping_is_stable() {
        assert_eq!(
            AppError::new("x", ExitCode::CdpTimeout).error_code(),
            ErrorCode::CdpTimeout
        );
        assert_eq!(
            AppError::new("x", ExitCode::ResourceNotFound).error_code(),
            ErrorCode::SessionNotFound
        );
    }
}
