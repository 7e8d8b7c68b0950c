use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cdp::{CdpError, CdpEvent, HandlerId};
use crate::connection::ManagedSession;
use crate::session::{NetworkRequest, now_epoch_millis};

use super::filter::UrlFilter;

/// Pending-request cap (spec.md §4.2, §5).
pub const MAX_PENDING: usize = 10_000;
/// Output-list cap (spec.md §4.2, §5).
pub const MAX_OUTPUT: usize = 10_000;
/// A pending entry older than this is evicted without ever appearing in
/// output (spec.md §4.2).
pub const PENDING_TTL: Duration = Duration::from_secs(60);
/// How often the eviction sweep runs (spec.md §4.2).
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(30);
/// Default `maxBodySize` (spec.md §4.2, §5).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 5 * 1024 * 1024;

const SKIP_MIME_PREFIXES: &[&str] = &["image/", "font/", "video/", "audio/"];
const SKIP_MIME_EXACT: &[&str] = &["text/css"];
const SKIP_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".woff", ".woff2", ".ttf", ".eot",
    ".mp4", ".webm", ".mp3", ".css",
];

/// User-tunable network telemetry behavior.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub fetch_all_bodies: bool,
    pub max_body_size: u64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub include_all: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fetch_all_bodies: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            include_all: false,
        }
    }
}

struct PendingEntry {
    request: NetworkRequest,
    first_seen: Instant,
}

type Pending = Arc<Mutex<HashMap<String, PendingEntry>>>;
type Output = Arc<Mutex<Vec<NetworkRequest>>>;

/// Translates `Network.*` CDP events into the bounded, filtered
/// `NetworkRequest` output list described in spec.md §3.3/§3.7/§4.2.
pub struct NetworkCollector {
    session: Arc<ManagedSession>,
    pending: Pending,
    output: Output,
    handler_ids: Vec<HandlerId>,
    eviction_task: Option<JoinHandle<()>>,
}

impl NetworkCollector {
    /// Enable `Network` (with buffer tuning) and start collecting.
    ///
    /// The caller's `session` must already have had any domain-independent
    /// setup done; this call issues `Network.enable` itself (rather than
    /// going through `ManagedSession::ensure_domain`) because it needs to
    /// pass buffer-size parameters.
    ///
    /// # Errors
    ///
    /// Returns `CdpError` if event subscription fails. A failure to enable
    /// buffer tuning is not fatal — the bare `Network.enable` fallback is
    /// used instead (spec.md §4.2).
    pub async fn start(
        session: Arc<ManagedSession>,
        config: NetworkConfig,
    ) -> Result<Self, CdpError> {
        let tuned = serde_json::json!({
            "maxTotalBufferSize": 50 * 1024 * 1024,
            "maxResourceBufferSize": 10 * 1024 * 1024,
            "maxPostDataSize": 1024 * 1024,
        });
        if session
            .send_command("Network.enable", Some(tuned))
            .await
            .is_err()
        {
            session.send_command("Network.enable", None).await?;
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let output: Output = Arc::new(Mutex::new(Vec::new()));
        let filter = Arc::new(
            UrlFilter::new(&config.include_patterns, &config.exclude_patterns, config.include_all)
                .unwrap_or_else(|e| {
                    warn!("invalid network filter pattern, falling back to no filtering: {e}");
                    UrlFilter::new(&[], &[], true).expect("empty pattern set always compiles")
                }),
        );
        let config = Arc::new(config);

        let mut handler_ids = Vec::with_capacity(4);

        handler_ids.push(
            session
                .on("Network.requestWillBeSent", {
                    let pending = Arc::clone(&pending);
                    move |event| on_request_will_be_sent(&pending, &event)
                })
                .await?,
        );

        handler_ids.push(
            session
                .on("Network.responseReceived", {
                    let pending = Arc::clone(&pending);
                    move |event| on_response_received(&pending, &event)
                })
                .await?,
        );

        handler_ids.push(
            session
                .on("Network.loadingFinished", {
                    let pending = Arc::clone(&pending);
                    let output = Arc::clone(&output);
                    let filter = Arc::clone(&filter);
                    let config = Arc::clone(&config);
                    let session = Arc::clone(&session);
                    move |event| {
                        on_loading_finished(&pending, &output, &filter, &config, &session, &event);
                    }
                })
                .await?,
        );

        handler_ids.push(
            session
                .on("Network.loadingFailed", {
                    let pending = Arc::clone(&pending);
                    let output = Arc::clone(&output);
                    let filter = Arc::clone(&filter);
                    move |event| on_loading_failed(&pending, &output, &filter, &event)
                })
                .await?,
        );

        let eviction_task = tokio::spawn(run_eviction_sweep(Arc::clone(&pending)));

        Ok(Self {
            session,
            pending,
            output,
            handler_ids,
            eviction_task: Some(eviction_task),
        })
    }

    /// Snapshot of the output list collected so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NetworkRequest> {
        self.output.lock().clone()
    }

    /// Disconnects all event handlers, stops the eviction timer, and clears
    /// both in-memory maps (spec.md §4.2 "Cleanup function").
    pub async fn cleanup(mut self) {
        const METHODS: [&str; 4] = [
            "Network.requestWillBeSent",
            "Network.responseReceived",
            "Network.loadingFinished",
            "Network.loadingFailed",
        ];
        for (method, id) in METHODS.iter().zip(self.handler_ids.drain(..)) {
            self.session.off(method, id).await;
        }
        if let Some(task) = self.eviction_task.take() {
            task.abort();
        }
        self.pending.lock().clear();
        self.output.lock().clear();
    }
}

fn on_request_will_be_sent(pending: &Pending, event: &CdpEvent) {
    let Some(request_id) = event.params["requestId"].as_str() else {
        return;
    };
    let mut pending = pending.lock();
    if pending.len() >= MAX_PENDING {
        debug!("pending network map full, dropping requestWillBeSent for {request_id}");
        return;
    }

    let url = event.params["request"]["url"].as_str().unwrap_or_default().to_owned();
    let method = event.params["request"]["method"].as_str().unwrap_or("GET").to_owned();
    let request_headers = event.params["request"]["headers"]
        .as_object()
        .map(|h| h.iter().map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_owned())).collect());
    let request_body = event.params["request"]["postData"].as_str().map(str::to_owned);

    pending.insert(
        request_id.to_owned(),
        PendingEntry {
            request: NetworkRequest {
                request_id: request_id.to_owned(),
                url,
                method,
                timestamp: now_epoch_millis(),
                status: None,
                mime_type: None,
                request_headers,
                response_headers: None,
                request_body,
                response_body: None,
                navigation_id: None,
            },
            first_seen: Instant::now(),
        },
    );
}

fn on_response_received(pending: &Pending, event: &CdpEvent) {
    let Some(request_id) = event.params["requestId"].as_str() else {
        return;
    };
    let mut pending = pending.lock();
    let Some(entry) = pending.get_mut(request_id) else {
        // Race: responseReceived before requestWillBeSent, or the entry
        // was already filtered/evicted. Discard per spec.md §8.
        return;
    };

    entry.request.status = event.params["response"]["status"].as_i64();
    entry.request.mime_type =
        event.params["response"]["mimeType"].as_str().map(str::to_owned);
    entry.request.response_headers = event.params["response"]["headers"].as_object().map(|h| {
        h.iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_owned()))
            .collect()
    });
}

fn on_loading_finished(
    pending: &Pending,
    output: &Output,
    filter: &UrlFilter,
    config: &NetworkConfig,
    session: &Arc<ManagedSession>,
    event: &CdpEvent,
) {
    let Some(request_id) = event.params["requestId"].as_str() else {
        return;
    };
    let Some(entry) = pending.lock().remove(request_id) else {
        return;
    };
    if !filter.allows(&entry.request.url) {
        return;
    }

    let encoded_len = event.params["encodedDataLength"].as_i64().unwrap_or(0).max(0) as u64;
    let mut request = entry.request;
    apply_body_policy(&mut request, encoded_len, config);

    let should_fetch = request.response_body.is_none();
    let Some(request_id) = push_to_output(output, request) else {
        return;
    };

    if should_fetch {
        spawn_body_fetch(Arc::clone(session), Arc::clone(output), request_id);
    }
}

fn on_loading_failed(pending: &Pending, output: &Output, filter: &UrlFilter, event: &CdpEvent) {
    let Some(request_id) = event.params["requestId"].as_str() else {
        return;
    };
    let Some(entry) = pending.lock().remove(request_id) else {
        return;
    };
    if !filter.allows(&entry.request.url) {
        return;
    }

    let mut request = entry.request;
    request.status = Some(0);
    push_to_output(output, request);
}

/// Push a completed request onto the output list, honoring the output cap.
/// Returns the request's id if it was actually inserted.
fn push_to_output(output: &Output, request: NetworkRequest) -> Option<String> {
    let mut output = output.lock();
    if output.len() >= MAX_OUTPUT {
        return None;
    }
    let id = request.request_id.clone();
    output.push(request);
    Some(id)
}

/// Decide whether to skip the response body (recording a `[SKIPPED: ...]`
/// marker) or leave it absent for an async fetch (spec.md §4.2).
fn apply_body_policy(request: &mut NetworkRequest, encoded_len: u64, config: &NetworkConfig) {
    if config.fetch_all_bodies {
        return;
    }

    if let Some(mime) = &request.mime_type {
        let mime_lower = mime.to_ascii_lowercase();
        if SKIP_MIME_PREFIXES.iter().any(|p| mime_lower.starts_with(p))
            || SKIP_MIME_EXACT.contains(&mime_lower.as_str())
        {
            request.response_body = Some("[SKIPPED: Non-text response type]".to_owned());
            return;
        }
    }

    let url_lower = request.url.to_ascii_lowercase();
    if SKIP_EXTENSIONS.iter().any(|ext| url_lower.ends_with(ext)) {
        request.response_body = Some("[SKIPPED: Non-text response type]".to_owned());
        return;
    }

    if encoded_len > config.max_body_size {
        request.response_body = Some(format!(
            "[SKIPPED: Response too large ({encoded_len} > {})]",
            config.max_body_size
        ));
    }
}

fn spawn_body_fetch(session: Arc<ManagedSession>, output: Output, request_id: String) {
    tokio::spawn(async move {
        let params = serde_json::json!({ "requestId": request_id });
        let Ok(result) = session.send_command("Network.getResponseBody", Some(params)).await else {
            return;
        };
        let Some(body) = result["body"].as_str() else {
            return;
        };
        let base64_encoded = result["base64Encoded"].as_bool().unwrap_or(false);
        let body = if base64_encoded {
            use base64::Engine as _;
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(body) else {
                return;
            };
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            body.to_owned()
        };

        let mut output = output.lock();
        if let Some(entry) = output.iter_mut().find(|r| r.request_id == request_id) {
            entry.response_body = Some(body);
        }
    });
}

async fn run_eviction_sweep(pending: Pending) {
    let mut interval = tokio::time::interval(EVICTION_INTERVAL);
    loop {
        interval.tick().await;
        let now = Instant::now();
        pending
            .lock()
            .retain(|_, entry| now.duration_since(entry.first_seen) < PENDING_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(mime: Option<&str>, url: &str) -> NetworkRequest {
        NetworkRequest {
            request_id: "R1".into(),
            url: url.into(),
            method: "GET".into(),
            timestamp: 0,
            status: Some(200),
            mime_type: mime.map(str::to_owned),
            request_headers: None,
            response_headers: None,
            request_body: None,
            response_body: None,
            navigation_id: None,
        }
    }

    #[test]
    fn skips_image_mime() {
        let config = NetworkConfig::default();
        let mut req = sample_request(Some("image/png"), "https://example.com/a.png");
        apply_body_policy(&mut req, 10, &config);
        assert_eq!(
            req.response_body.as_deref(),
            Some("[SKIPPED: Non-text response type]")
        );
    }

    #[test]
    fn skips_by_extension_without_mime() {
        let config = NetworkConfig::default();
        let mut req = sample_request(None, "https://example.com/app.css");
        apply_body_policy(&mut req, 10, &config);
        assert_eq!(
            req.response_body.as_deref(),
            Some("[SKIPPED: Non-text response type]")
        );
    }

    #[test]
    fn skips_over_size_limit() {
        let config = NetworkConfig { max_body_size: 1024, ..NetworkConfig::default() };
        let mut req = sample_request(Some("application/json"), "https://example.com/api");
        apply_body_policy(&mut req, 1_048_576, &config);
        let body = req.response_body.unwrap();
        assert!(body.starts_with("[SKIPPED: Response too large"), "{body}");
    }

    #[test]
    fn negative_or_absent_length_treated_as_zero() {
        let config = NetworkConfig::default();
        let mut req = sample_request(Some("application/json"), "https://example.com/api");
        apply_body_policy(&mut req, 0, &config);
        assert!(req.response_body.is_none(), "should not skip on size alone");
    }

    #[test]
    fn fetch_all_bodies_overrides_skip_rules() {
        let config = NetworkConfig { fetch_all_bodies: true, ..NetworkConfig::default() };
        let mut req = sample_request(Some("image/png"), "https://example.com/a.png");
        apply_body_policy(&mut req, 10, &config);
        assert!(req.response_body.is_none());
    }

    #[test]
    fn text_response_under_limit_is_left_for_async_fetch() {
        let config = NetworkConfig::default();
        let mut req = sample_request(Some("application/json"), "https://example.com/api");
        apply_body_policy(&mut req, 100, &config);
        assert!(req.response_body.is_none());
    }

    #[test]
    fn push_to_output_respects_cap() {
        let output: Output = Arc::new(Mutex::new(Vec::new()));
        for i in 0..MAX_OUTPUT {
            let mut req = sample_request(None, "https://example.com/x");
            req.request_id = format!("R{i}");
            assert!(push_to_output(&output, req).is_some());
        }
        let mut overflow = sample_request(None, "https://example.com/x");
        overflow.request_id = "overflow".into();
        assert!(push_to_output(&output, overflow).is_none());
        assert_eq!(output.lock().len(), MAX_OUTPUT);
    }

    #[tokio::test]
    async fn stale_pending_entry_is_evicted() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        pending.lock().insert(
            "stale".into(),
            PendingEntry {
                request: sample_request(None, "https://example.com/x"),
                first_seen: Instant::now() - Duration::from_secs(61),
            },
        );
        let now = Instant::now();
        pending
            .lock()
            .retain(|_, entry| now.duration_since(entry.first_seen) < PENDING_TTL);
        assert!(pending.lock().is_empty());
    }
}
