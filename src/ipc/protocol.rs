use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → daemon request envelope (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub params: Value,
}

impl ClientRequest {
    #[must_use]
    pub fn new(command: &str, session_id: impl Into<String>, params: Value) -> Self {
        Self {
            kind: format!("{command}_request"),
            session_id: session_id.into(),
            params,
        }
    }

    /// The bare command name, with the trailing `_request` stripped.
    #[must_use]
    pub fn command(&self) -> &str {
        self.kind.strip_suffix("_request").unwrap_or(&self.kind)
    }
}

/// Daemon → client response envelope (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl ClientResponse {
    #[must_use]
    pub fn ok(command: &str, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: format!("{command}_response"),
            session_id: session_id.into(),
            status: ResponseStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(command: &str, session_id: impl Into<String>, error: IpcError) -> Self {
        Self {
            kind: format!("{command}_response"),
            session_id: session_id.into(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Structured IPC-level error, distinct from `crate::error::AppError` (which
/// governs CLI process exit). `code` mirrors `crate::error::ErrorCode`'s
/// SCREAMING_SNAKE_CASE naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl IpcError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            extra: None,
        }
    }

    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Daemon → worker request envelope (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub params: Value,
}

impl WorkerRequest {
    #[must_use]
    pub fn new(command: &str, request_id: impl Into<String>, params: Value) -> Self {
        Self {
            kind: format!("{command}_request"),
            request_id: request_id.into(),
            params,
        }
    }

    #[must_use]
    pub fn command(&self) -> &str {
        self.kind.strip_suffix("_request").unwrap_or(&self.kind)
    }
}

/// Worker → daemon response envelope (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl WorkerResponse {
    #[must_use]
    pub fn ok(command: &str, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: format!("{command}_response"),
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(command: &str, request_id: impl Into<String>, error: IpcError) -> Self {
        Self {
            kind: format!("{command}_response"),
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// The one-shot JSON line a freshly-spawned worker writes to stdout once its
/// CDP connection is up (spec.md §4.6 WorkerStarting→Collecting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReady {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "workerPid")]
    pub worker_pid: u32,
    #[serde(rename = "chromePid")]
    pub chrome_pid: Option<u32>,
    pub port: u16,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
}

impl WorkerReady {
    #[must_use]
    pub fn new(
        worker_pid: u32,
        chrome_pid: Option<u32>,
        port: u16,
        target_id: impl Into<String>,
        web_socket_debugger_url: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            kind: "worker_ready".to_owned(),
            worker_pid,
            chrome_pid,
            port,
            target_id: target_id.into(),
            web_socket_debugger_url: web_socket_debugger_url.into(),
            target_url: target_url.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_round_trip() {
        let req = ClientRequest::new("start_session", "sess-1", serde_json::json!({"url": "https://example.com"}));
        let line = serde_json::to_string(&req).unwrap();
        let parsed: ClientRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, "start_session_request");
        assert_eq!(parsed.command(), "start_session");
        assert_eq!(parsed.session_id, "sess-1");
    }

    #[test]
    fn client_response_ok_round_trip() {
        let resp = ClientResponse::ok("status", "sess-1", serde_json::json!({"daemonPid": 42}));
        let line = serde_json::to_string(&resp).unwrap();
        let parsed: ClientResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.status, ResponseStatus::Ok);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn client_response_error_round_trip() {
        let resp = ClientResponse::err(
            "start_session",
            "sess-1",
            IpcError::new("SESSION_ALREADY_RUNNING", "a session is already active")
                .with_extra(serde_json::json!({"pid": 123})),
        );
        let line = serde_json::to_string(&resp).unwrap();
        let parsed: ClientResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.status, ResponseStatus::Error);
        assert_eq!(parsed.error.unwrap().code, "SESSION_ALREADY_RUNNING");
    }

    #[test]
    fn worker_request_command_strips_suffix() {
        let req = WorkerRequest::new("cdp_call", "req-1", serde_json::json!({"method": "Page.navigate"}));
        assert_eq!(req.command(), "cdp_call");
    }

    #[test]
    fn worker_ready_round_trip() {
        let ready = WorkerReady::new(111, Some(222), 9222, "target-1", "ws://127.0.0.1:9222/devtools/page/target-1", "https://example.com");
        let line = serde_json::to_string(&ready).unwrap();
        let parsed: WorkerReady = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, "worker_ready");
        assert_eq!(parsed.worker_pid, 111);
        assert_eq!(parsed.chrome_pid, Some(222));
    }

    #[test]
    fn unrecognized_fields_are_tolerated() {
        let line = r#"{"type":"status_request","sessionId":"s1","extra":"ignored"}"#;
        let parsed: ClientRequest = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.command(), "status");
    }
}
