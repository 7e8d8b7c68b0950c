use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::error::CdpError;
use super::transport::{
    KeepaliveConfig, ReconnectConfig, TransportCommand, TransportHandle, spawn_transport,
};
use super::types::CdpEvent;

/// Configuration for a CDP client connection.
#[derive(Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket connection (default: 10s).
    pub connect_timeout: Duration,
    /// Timeout for individual CDP commands (default: 30s).
    pub command_timeout: Duration,
    /// Capacity of the internal command channel (default: 256).
    pub channel_capacity: usize,
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
    /// Keepalive ping/pong settings.
    pub keepalive: KeepaliveConfig,
    /// Invoked after a successful reconnect, so collectors can re-enable
    /// their CDP domains (spec.md §4.1's `onReconnect` hook).
    pub on_reconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for CdpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("reconnect", &self.reconnect)
            .field("keepalive", &self.keepalive)
            .field("on_reconnect", &self.on_reconnect.is_some())
            .finish()
    }
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            on_reconnect: None,
        }
    }
}

/// Handle returned by [`CdpClient::on`] / [`CdpSession::on`], passed back to
/// `off` to stop delivery.
pub type HandlerId = u64;

/// Tracks the background forwarding tasks spun up by `on`, so `off` can
/// cancel exactly one of them.
#[derive(Debug, Default, Clone)]
struct HandlerTable {
    tasks: Arc<Mutex<HashMap<HandlerId, JoinHandle<()>>>>,
}

impl HandlerTable {
    fn insert(&self, id: HandlerId, task: JoinHandle<()>) {
        self.tasks.lock().insert(id, task);
    }

    fn remove(&self, id: HandlerId) -> bool {
        if let Some(task) = self.tasks.lock().remove(&id) {
            task.abort();
            true
        } else {
            false
        }
    }
}

/// A CDP client connected to Chrome over WebSocket.
///
/// This is the main entry point for sending CDP commands and subscribing
/// to events. It communicates with a background transport task that owns
/// the WebSocket connection.
#[derive(Debug)]
pub struct CdpClient {
    handle: TransportHandle,
    config: CdpConfig,
    url: String,
    handlers: HandlerTable,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` if the WebSocket handshake fails,
    /// or `CdpError::ConnectionTimeout` if the connection attempt exceeds
    /// the configured timeout.
    pub async fn connect(url: &str, config: CdpConfig) -> Result<Self, CdpError> {
        let handle = spawn_transport(
            url,
            config.channel_capacity,
            config.reconnect.clone(),
            config.connect_timeout,
            config.keepalive.clone(),
            config.on_reconnect.clone(),
        )
        .await?;

        Ok(Self {
            handle,
            config,
            url: url.to_owned(),
            handlers: HandlerTable::default(),
        })
    }

    /// Register a handler for events matching `method` (browser-level, no
    /// session). Returns a [`HandlerId`] to later pass to [`CdpClient::off`].
    ///
    /// Handlers run on their own background task, so a panicking or slow
    /// handler cannot block event delivery to other handlers or to the pump.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn on<F>(&self, method: &str, handler: F) -> Result<HandlerId, CdpError>
    where
        F: FnMut(CdpEvent) + Send + 'static,
    {
        on_impl(&self.handle, &self.handlers, self.config.channel_capacity, method, None, handler)
            .await
    }

    /// Stop delivering events to a handler previously registered via `on`.
    pub async fn off(&self, method: &str, id: HandlerId) {
        off_impl(&self.handle, &self.handlers, method, None, id).await;
    }

    /// Send a CDP command (browser-level, no session).
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CommandTimeout` if Chrome does not respond within
    /// the configured timeout, `CdpError::Protocol` if Chrome returns an
    /// error, or `CdpError::Internal` if the transport task has exited.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        send_command_impl(&self.handle, self.config.command_timeout, method, params, None).await
    }

    /// Subscribe to CDP events matching a method name.
    ///
    /// Returns a receiver that yields `CdpEvent` values. Events stop
    /// being delivered when the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(
        &self,
        method: &str,
    ) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_impl(&self.handle, self.config.channel_capacity, method, None).await
    }

    /// Create a CDP session attached to a specific target.
    ///
    /// Sends `Target.attachToTarget` and returns a `CdpSession` bound
    /// to the returned session ID.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` if the target cannot be attached,
    /// or any transport error.
    pub async fn create_session(&self, target_id: &str) -> Result<CdpSession, CdpError> {
        let params = serde_json::json!({
            "targetId": target_id,
            "flatten": true,
        });
        let result = self
            .send_command("Target.attachToTarget", Some(params))
            .await?;
        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| {
                CdpError::InvalidResponse(
                    "Target.attachToTarget response missing sessionId".into(),
                )
            })?
            .to_owned();

        Ok(CdpSession {
            session_id,
            handle: self.handle.clone(),
            config: self.config.clone(),
            handlers: HandlerTable::default(),
        })
    }

    /// Gracefully close the WebSocket connection.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has already exited.
    pub async fn close(self) -> Result<(), CdpError> {
        for (_, task) in self.handlers.tasks.lock().drain() {
            task.abort();
        }
        self.handle.send(TransportCommand::Shutdown).await
    }

    /// Check if the client is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Get the WebSocket URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A CDP session bound to a specific target (tab).
///
/// Sessions share the parent client's WebSocket connection but route
/// commands and events through a `sessionId`.
#[derive(Debug, Clone)]
pub struct CdpSession {
    session_id: String,
    handle: TransportHandle,
    config: CdpConfig,
    handlers: HandlerTable,
}

impl CdpSession {
    /// Send a command within this session's context.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`CdpClient::send_command`].
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        send_command_impl(
            &self.handle,
            self.config.command_timeout,
            method,
            params,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Subscribe to events within this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(
        &self,
        method: &str,
    ) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_impl(
            &self.handle,
            self.config.channel_capacity,
            method,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Register a handler for events matching `method` within this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn on<F>(&self, method: &str, handler: F) -> Result<HandlerId, CdpError>
    where
        F: FnMut(CdpEvent) + Send + 'static,
    {
        on_impl(
            &self.handle,
            &self.handlers,
            self.config.channel_capacity,
            method,
            Some(self.session_id.clone()),
            handler,
        )
        .await
    }

    /// Stop delivering events to a handler previously registered via `on`.
    pub async fn off(&self, method: &str, id: HandlerId) {
        off_impl(&self.handle, &self.handlers, method, Some(self.session_id.clone()), id).await;
    }

    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Send a CDP command via the transport handle and await the response.
async fn send_command_impl(
    handle: &TransportHandle,
    command_timeout: Duration,
    method: &str,
    params: Option<serde_json::Value>,
    session_id: Option<String>,
) -> Result<serde_json::Value, CdpError> {
    let id = handle.next_message_id();
    let command = super::types::CdpCommand {
        id,
        method: method.to_owned(),
        params,
        session_id,
    };

    let (response_tx, response_rx) = oneshot::channel();
    let deadline = Instant::now() + command_timeout;

    handle
        .send(TransportCommand::SendCommand {
            command,
            response_tx,
            deadline,
        })
        .await?;

    response_rx
        .await
        .map_err(|_| CdpError::Internal("transport task exited before responding".into()))?
}

/// Register an event subscription via the transport handle.
async fn subscribe_impl(
    handle: &TransportHandle,
    channel_capacity: usize,
    method: &str,
    session_id: Option<String>,
) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
    let (event_tx, event_rx) = mpsc::channel(channel_capacity);
    let handler_id = handle.next_handler_id();
    handle
        .send(TransportCommand::Subscribe {
            method: method.to_owned(),
            session_id,
            handler_id,
            event_tx,
        })
        .await?;
    Ok(event_rx)
}

/// Register a handler closure for events matching `method`/`session_id`,
/// forwarding each event from a dedicated background task so one slow or
/// panicking handler cannot stall others.
async fn on_impl<F>(
    handle: &TransportHandle,
    handlers: &HandlerTable,
    channel_capacity: usize,
    method: &str,
    session_id: Option<String>,
    mut handler: F,
) -> Result<HandlerId, CdpError>
where
    F: FnMut(CdpEvent) + Send + 'static,
{
    let (event_tx, mut event_rx) = mpsc::channel(channel_capacity);
    let handler_id = handle.next_handler_id();
    handle
        .send(TransportCommand::Subscribe {
            method: method.to_owned(),
            session_id,
            handler_id,
            event_tx,
        })
        .await?;

    let task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
        }
    });
    handlers.insert(handler_id, task);
    Ok(handler_id)
}

/// Remove a handler registered via `on_impl`: cancels its forwarding task
/// and tells the transport to drop the underlying subscriber entry.
async fn off_impl(
    handle: &TransportHandle,
    handlers: &HandlerTable,
    method: &str,
    session_id: Option<String>,
    id: HandlerId,
) {
    handlers.remove(id);
    let _ = handle
        .send(TransportCommand::Unsubscribe {
            method: method.to_owned(),
            session_id,
            handler_id: id,
        })
        .await;
}
