use tokio::time::Duration;
use tracing::warn;

use crate::connection::ManagedSession;
use crate::session::DomData;

/// Per-call timeout for each command in the snapshot sequence (spec.md §3.5).
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures a one-shot DOM snapshot at graceful stop: `DOM.getDocument`,
/// `DOM.getOuterHTML`, `Page.getFrameTree`, and a `Runtime.evaluate` for the
/// document title. Best-effort: any failure yields `None` rather than
/// propagating, since a missing DOM snapshot must never block session
/// teardown (spec.md §3.5, §8).
pub async fn capture_dom_snapshot(session: &ManagedSession) -> Option<DomData> {
    let root_node_id = match step(
        session.send_command("DOM.getDocument", Some(serde_json::json!({ "depth": -1 }))),
    )
    .await
    {
        Some(doc) => doc["root"]["nodeId"].as_i64()?,
        None => return None,
    };

    let outer_html = match step(session.send_command(
        "DOM.getOuterHTML",
        Some(serde_json::json!({ "nodeId": root_node_id })),
    ))
    .await
    {
        Some(result) => result["outerHTML"].as_str().unwrap_or_default().to_owned(),
        None => return None,
    };

    let url = step(session.send_command("Page.getFrameTree", None))
        .await
        .and_then(|tree| tree["frameTree"]["frame"]["url"].as_str().map(str::to_owned))
        .unwrap_or_default();

    let title = step(session.send_command(
        "Runtime.evaluate",
        Some(serde_json::json!({ "expression": "document.title", "returnByValue": true })),
    ))
    .await
    .and_then(|result| result["result"]["value"].as_str().map(str::to_owned))
    .filter(|t| !t.is_empty())
    .unwrap_or_else(|| "Untitled".to_owned());

    Some(DomData {
        url,
        title,
        outer_html,
    })
}

async fn step<F>(fut: F) -> Option<serde_json::Value>
where
    F: std::future::Future<Output = Result<serde_json::Value, crate::cdp::CdpError>>,
{
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("DOM snapshot step failed: {e}");
            None
        }
        Err(_) => {
            warn!("DOM snapshot step timed out after {STEP_TIMEOUT:?}");
            None
        }
    }
}
