//! `/connect` — queues the session, waits for a granted browser instance,
//! then upgrades and relays.

use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ChromeOptions;
use crate::relay;

use super::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    profile: Option<String>,
}

/// Cancels `token` when dropped. Held across the queueing phase so that if
/// axum drops this handler's future — which is what happens when the client
/// disconnects while we're still waiting for a browser — something is left
/// behind to notice and clean up the now-orphaned queue element.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = Uuid::new_v4();
    let profile = query.profile.unwrap_or_default();
    let options = ChromeOptions::new(profile.clone());

    let profile_dir = if state.enable_custom_profiles && !profile.is_empty() {
        state.profiles.get(&profile).map(str::to_string)
    } else {
        None
    };

    let span = tracing::info_span!("connect", session_id = %session_id, browser_profile = %profile);
    let _enter = span.enter();
    tracing::info!("queuing new chrome proxy session");

    let session_token = state.shutdown.child_token();
    let cancel_guard = CancelOnDrop(session_token.clone());

    let (handle, grant_rx) = match state.queue.enqueue(session_id, options, profile_dir).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "rejected new session");
            return (StatusCode::SERVICE_UNAVAILABLE, "queue unavailable").into_response();
        }
    };

    // Detached from this handler's future on purpose: if the client
    // disconnects while queued, axum drops the future polling `grant_rx`
    // below without running any more of its code, so nothing inside it can
    // dequeue the element. This task instead waits on `session_token`
    // directly — satisfied either by the `cancelled()` branch below running
    // normally, or by `cancel_guard`'s `Drop` firing when this handler's
    // future is dropped out from under it.
    let dequeue_watch = {
        let queue = state.queue.clone();
        let watch_token = session_token.clone();
        tokio::spawn(async move {
            watch_token.cancelled().await;
            queue.dequeue(handle).await;
        })
    };

    let instance = tokio::select! {
        biased;
        _ = session_token.cancelled() => {
            // Reached only while this future is still being polled, so we can
            // just dequeue directly; `dequeue_watch` exists for the case
            // where the future is dropped instead of reaching this branch.
            dequeue_watch.abort();
            state.queue.dequeue(handle).await;
            return (StatusCode::SERVICE_UNAVAILABLE, "request cancelled before a browser was granted")
                .into_response();
        }
        result = grant_rx => {
            dequeue_watch.abort();
            match result {
                Ok(instance) => instance,
                Err(_) => {
                    state.queue.dequeue(handle).await;
                    return (StatusCode::SERVICE_UNAVAILABLE, "queue closed").into_response();
                }
            }
        }
    };

    // A browser has been granted — queue-phase disconnect handling no longer
    // applies, and `session_token` now instead scopes the relay below, so
    // don't let this guard cancel it out from under the upgrade.
    std::mem::forget(cancel_guard);

    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| async move {
        let start = Instant::now();
        let debug_url = instance.debug_url.clone();
        let result = relay::run(socket, &debug_url, session_token).await;
        metrics.record_proxy_time_secs(start.elapsed().as_secs_f64());
        instance.set_idle_or_stop().await;
        tracing::info!(result = ?result, "proxy session finished");
    })
}
