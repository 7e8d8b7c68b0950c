use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::cdp::{CdpError, CdpEvent, HandlerId};
use crate::connection::ManagedSession;
use crate::session::ConsoleMessage;

/// Console message cap (spec.md §4.2, §5).
pub const MAX_MESSAGES: usize = 10_000;

/// Console group markers carry no useful text and are dropped by default.
const GROUP_MARKER_TYPES: &[&str] = &["startGroup", "startGroupCollapsed", "endGroup"];

/// Dev-server noise dropped by default unless `includeAll` is set.
const NOISE_PREFIXES: &[&str] = &["[HMR]", "[webpack-dev-server]", "[Fast Refresh]", "[vite]"];

#[derive(Debug, Clone, Default)]
pub struct ConsoleConfig {
    pub include_all: bool,
}

type Messages = Arc<Mutex<Vec<ConsoleMessage>>>;

/// Translates `Runtime.consoleAPICalled` / `Runtime.exceptionThrown` events
/// into the bounded console message list (spec.md §3.3/§4.2).
pub struct ConsoleCollector {
    session: Arc<ManagedSession>,
    messages: Messages,
    handler_ids: Vec<HandlerId>,
    cap_warned: Arc<AtomicBool>,
}

impl ConsoleCollector {
    /// # Errors
    ///
    /// Returns `CdpError` if event subscription fails.
    pub async fn start(
        session: Arc<ManagedSession>,
        config: ConsoleConfig,
    ) -> Result<Self, CdpError> {
        let messages: Messages = Arc::new(Mutex::new(Vec::new()));
        let cap_warned = Arc::new(AtomicBool::new(false));
        let mut handler_ids = Vec::with_capacity(2);

        handler_ids.push(
            session
                .on("Runtime.consoleAPICalled", {
                    let messages = Arc::clone(&messages);
                    let cap_warned = Arc::clone(&cap_warned);
                    let include_all = config.include_all;
                    move |event| on_console_api_called(&messages, &cap_warned, include_all, &event)
                })
                .await?,
        );

        handler_ids.push(
            session
                .on("Runtime.exceptionThrown", {
                    let messages = Arc::clone(&messages);
                    let cap_warned = Arc::clone(&cap_warned);
                    move |event| on_exception_thrown(&messages, &cap_warned, &event)
                })
                .await?,
        );

        Ok(Self {
            session,
            messages,
            handler_ids,
            cap_warned,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.messages.lock().clone()
    }

    /// Disconnects both event handlers and clears the message list.
    pub async fn cleanup(mut self) {
        const METHODS: [&str; 2] = ["Runtime.consoleAPICalled", "Runtime.exceptionThrown"];
        for (method, id) in METHODS.iter().zip(self.handler_ids.drain(..)) {
            self.session.off(method, id).await;
        }
        self.messages.lock().clear();
    }
}

fn push_message(messages: &Messages, cap_warned: &AtomicBool, message: ConsoleMessage) {
    let mut messages = messages.lock();
    if messages.len() >= MAX_MESSAGES {
        if !cap_warned.swap(true, Ordering::Relaxed) {
            warn!("console message cap ({MAX_MESSAGES}) reached, further messages dropped");
        }
        return;
    }
    messages.push(message);
}

fn is_noise(kind: &str, text: &str, include_all: bool) -> bool {
    if include_all {
        return false;
    }
    if GROUP_MARKER_TYPES.contains(&kind) {
        return true;
    }
    NOISE_PREFIXES.iter().any(|p| text.starts_with(p))
}

fn render_args(params: &serde_json::Value) -> (String, Option<Vec<serde_json::Value>>) {
    let args: Vec<serde_json::Value> = params["args"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let text = args
        .iter()
        .map(render_remote_object)
        .collect::<Vec<_>>()
        .join(" ");
    (text, if args.is_empty() { None } else { Some(args) })
}

fn render_remote_object(obj: &serde_json::Value) -> String {
    if let Some(s) = obj["value"].as_str() {
        return s.to_owned();
    }
    if let Some(v) = obj.get("value") {
        return v.to_string();
    }
    if let Some(desc) = obj["description"].as_str() {
        return desc.to_owned();
    }
    obj["type"].as_str().unwrap_or("undefined").to_owned()
}

fn on_console_api_called(
    messages: &Messages,
    cap_warned: &AtomicBool,
    include_all: bool,
    event: &CdpEvent,
) {
    let kind = event.params["type"].as_str().unwrap_or("log").to_owned();
    let (text, args) = render_args(&event.params);
    if is_noise(&kind, &text, include_all) {
        return;
    }
    let timestamp = event.params["timestamp"]
        .as_i64()
        .unwrap_or_else(crate::session::now_epoch_millis);

    push_message(
        messages,
        cap_warned,
        ConsoleMessage {
            kind,
            text,
            timestamp,
            args,
        },
    );
}

fn on_exception_thrown(messages: &Messages, cap_warned: &AtomicBool, event: &CdpEvent) {
    let details = &event.params["exceptionDetails"];
    let text = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("Uncaught exception")
        .to_owned();
    let timestamp = event.params["timestamp"]
        .as_i64()
        .unwrap_or_else(crate::session::now_epoch_millis);

    push_message(
        messages,
        cap_warned,
        ConsoleMessage {
            kind: "error".to_owned(),
            text,
            timestamp,
            args: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_markers_are_noise_by_default() {
        assert!(is_noise("startGroup", "Group label", false));
        assert!(!is_noise("startGroup", "Group label", true));
    }

    #[test]
    fn hmr_messages_are_noise_by_default() {
        assert!(is_noise("log", "[HMR] connected", false));
        assert!(!is_noise("log", "[HMR] connected", true));
    }

    #[test]
    fn ordinary_log_is_not_noise() {
        assert!(!is_noise("log", "hello world", false));
    }

    #[test]
    fn render_string_value() {
        let obj = serde_json::json!({"type": "string", "value": "hello"});
        assert_eq!(render_remote_object(&obj), "hello");
    }

    #[test]
    fn render_number_value() {
        let obj = serde_json::json!({"type": "number", "value": 42});
        assert_eq!(render_remote_object(&obj), "42");
    }

    #[test]
    fn render_object_falls_back_to_description() {
        let obj = serde_json::json!({"type": "object", "description": "Object"});
        assert_eq!(render_remote_object(&obj), "Object");
    }

    #[test]
    fn cap_enforced_at_max_messages() {
        let messages: Messages = Arc::new(Mutex::new(Vec::new()));
        let cap_warned = AtomicBool::new(false);
        for i in 0..MAX_MESSAGES {
            push_message(
                &messages,
                &cap_warned,
                ConsoleMessage {
                    kind: "log".into(),
                    text: format!("msg {i}"),
                    timestamp: 0,
                    args: None,
                },
            );
        }
        push_message(
            &messages,
            &cap_warned,
            ConsoleMessage {
                kind: "log".into(),
                text: "overflow".into(),
                timestamp: 0,
                args: None,
            },
        );
        assert_eq!(messages.lock().len(), MAX_MESSAGES);
    }
}
