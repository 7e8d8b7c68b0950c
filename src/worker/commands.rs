//! Handlers for the worker-side commands the daemon forwards over stdio
//! (`peek`, `details`, `cdp_call` — spec.md §4.5's command catalog).

use serde_json::{Value, json};

use crate::connection::ManagedSession;
use crate::error::{AppError, ErrorCode};
use crate::ipc::IpcError;
use crate::session::{ConsoleMessage, NetworkRequest};
use crate::telemetry::{ConsoleCollector, NetworkCollector};

/// Dispatch one worker-side command. Mirrors the daemon's `dispatch` in
/// shape: match on the bare command name, return `Ok(data)` or a
/// structured `IpcError`.
pub async fn handle_request(
    command: &str,
    params: Value,
    network: Option<&NetworkCollector>,
    console: Option<&ConsoleCollector>,
    session: &ManagedSession,
) -> Result<Value, IpcError> {
    match command {
        "peek" => Ok(peek(&params, network, console)),
        "details" => details(&params, network, console),
        "cdp_call" => cdp_call(&params, session).await,
        other => Err(IpcError::new(
            ErrorCode::UnknownCommand.as_str(),
            format!("unknown worker command: {other}"),
        )),
    }
}

/// `peek{lastN?, network?, console?}` — a bounded slice of the live
/// in-memory telemetry (spec.md §4.5, §4.7: this is the path `bdg peek`
/// actually reads; `session.preview.json` is forensic-only).
fn peek(params: &Value, network: Option<&NetworkCollector>, console: Option<&ConsoleCollector>) -> Value {
    let last_n = params.get("lastN").and_then(Value::as_u64).map(|n| n as usize);
    let only_network = params.get("network").and_then(Value::as_bool).unwrap_or(false);
    let only_console = params.get("console").and_then(Value::as_bool).unwrap_or(false);

    let want_network = !only_console;
    let want_console = !only_network;

    let network_data = if want_network {
        network.map(|c| tail(c.snapshot(), last_n))
    } else {
        None
    };
    let console_data = if want_console {
        console.map(|c| tail(c.snapshot(), last_n))
    } else {
        None
    };

    json!({
        "network": network_data,
        "console": console_data,
    })
}

fn tail<T>(mut items: Vec<T>, last_n: Option<usize>) -> Vec<T> {
    if let Some(n) = last_n {
        if items.len() > n {
            let excess = items.len() - n;
            items.drain(0..excess);
        }
    }
    items
}

/// `details{itemType, id}` — the full record for one item, used by
/// `bdg details network|console <id>` once a peek has narrowed it down.
/// Network items are addressed by `requestId`; console items (which carry
/// no stable id of their own, per spec.md §3.4) are addressed by their
/// positional index in the current snapshot.
fn details(params: &Value, network: Option<&NetworkCollector>, console: Option<&ConsoleCollector>) -> Result<Value, IpcError> {
    let item_type = params
        .get("itemType")
        .and_then(Value::as_str)
        .ok_or_else(|| IpcError::new(ErrorCode::InvalidArgs.as_str(), "itemType is required"))?;
    let id = params
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| IpcError::new(ErrorCode::InvalidArgs.as_str(), "id is required"))?;

    match item_type {
        "network" => network_details(network, id),
        "console" => console_details(console, id),
        other => Err(IpcError::new(
            ErrorCode::InvalidArgs.as_str(),
            format!("unknown itemType: {other}"),
        )),
    }
}

fn network_details(network: Option<&NetworkCollector>, id: &str) -> Result<Value, IpcError> {
    let collector = network.ok_or_else(|| {
        IpcError::new(ErrorCode::SessionNotFound.as_str(), "network telemetry is not active for this session")
    })?;
    let record: Option<NetworkRequest> = collector.snapshot().into_iter().find(|r| r.request_id == id);
    record
        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
        .ok_or_else(|| IpcError::new(ErrorCode::SessionNotFound.as_str(), format!("no network record with id {id}")))
}

fn console_details(console: Option<&ConsoleCollector>, id: &str) -> Result<Value, IpcError> {
    let collector = console.ok_or_else(|| {
        IpcError::new(ErrorCode::SessionNotFound.as_str(), "console telemetry is not active for this session")
    })?;
    let index: usize = id
        .parse()
        .map_err(|_| IpcError::new(ErrorCode::InvalidArgs.as_str(), "console id must be a non-negative index"))?;
    let record: Option<ConsoleMessage> = collector.snapshot().into_iter().nth(index);
    record
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .ok_or_else(|| IpcError::new(ErrorCode::SessionNotFound.as_str(), format!("no console record at index {index}")))
}

/// `cdp_call{method, params?}` — raw CDP passthrough, the worker-side half
/// of `bdg cdp <Method>` (spec.md §4.5, §6.1).
async fn cdp_call(params: &Value, session: &ManagedSession) -> Result<Value, IpcError> {
    let method = params
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| IpcError::new(ErrorCode::InvalidArgs.as_str(), "method is required"))?;
    let call_params = params.get("params").cloned();

    session
        .send_command(method, call_params)
        .await
        .map_err(|e| {
            let app_err = AppError::from(e);
            IpcError::new(app_err.error_code().as_str(), app_err.message)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_defaults_to_both_kinds_present() {
        let out = peek(&json!({}), None, None);
        assert!(out.get("network").is_some());
        assert!(out.get("console").is_some());
    }

    #[test]
    fn peek_network_only_omits_console() {
        let out = peek(&json!({"network": true}), None, None);
        assert_eq!(out["console"], Value::Null);
    }

    #[test]
    fn tail_truncates_to_last_n() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(tail(items, Some(2)), vec![4, 5]);
    }

    #[test]
    fn tail_keeps_all_when_no_limit() {
        let items = vec![1, 2, 3];
        assert_eq!(tail(items, None), vec![1, 2, 3]);
    }

    #[test]
    fn details_requires_item_type() {
        let err = details(&json!({"id": "1"}), None, None).unwrap_err();
        assert_eq!(err.code, "INVALID_ARGS");
    }

    #[test]
    fn details_rejects_unknown_item_type() {
        let err = details(&json!({"itemType": "dom", "id": "1"}), None, None).unwrap_err();
        assert_eq!(err.code, "INVALID_ARGS");
    }

    #[test]
    fn network_details_without_collector_is_session_not_found() {
        let err = network_details(None, "req-1").unwrap_err();
        assert_eq!(err.code, "SESSION_NOT_FOUND");
    }
}
