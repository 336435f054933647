//! Viewer-facing web server: axum HTTP + WebSocket.
//!
//! - `WS /ws`: live frames and descriptions as JSON text envelopes
//! - `GET /api/status`: relay status
//! - `GET /health`: liveness probe

pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::buffer::FrameBuffer;
use crate::capture::CaptureCounters;
use crate::upstream::{LinkCounters, LinkState};
use crate::viewer::ViewerRegistry;

/// Upstream link handles exposed on the status endpoint
#[derive(Clone)]
pub struct LinkStatus {
    pub state: watch::Receiver<LinkState>,
    pub counters: Arc<LinkCounters>,
}

/// Everything the web server reads or registers into.
#[derive(Clone)]
pub struct WebContext {
    pub registry: Arc<ViewerRegistry>,
    pub buffer: Arc<FrameBuffer>,
    /// Absent when capture runs elsewhere (tests)
    pub capture: Option<Arc<CaptureCounters>>,
    /// Absent when the upstream link is disabled
    pub link: Option<LinkStatus>,
    /// Per-viewer outbound queue depth
    pub viewer_queue: usize,
}

struct WebState {
    ctx: WebContext,
    cancel: CancellationToken,
    start_time: Instant,
}

/// Build the router. Exposed for embedding.
pub fn app(ctx: WebContext, cancel: CancellationToken) -> Router {
    let state = Arc::new(WebState {
        ctx,
        cancel,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires.
pub async fn serve(listener: TcpListener, ctx: WebContext, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Web server listening on http://{}", addr);

    let app = app(ctx, cancel.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let registry = Arc::clone(&state.ctx.registry);
    let queue = state.ctx.viewer_queue;
    let cancel = state.cancel.clone();
    ws.on_upgrade(move |socket| ws::handle_viewer(socket, registry, queue, cancel))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let ctx = &state.ctx;
    let viewers = ctx.registry.stats().await;
    let buffer = ctx.buffer.stats();
    let last_frame_ms = ctx.buffer.peek_newer(0).map(|(_, frame)| frame.timestamp_ms());

    let mut resp = serde_json::json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "viewers": viewers.viewers,
        "viewers_dropped": viewers.dropped,
        "frames": {
            "published": buffer.published,
            "overwritten": buffer.overwritten,
            "broadcast": buffer.taken,
        },
        "last_frame_ms": last_frame_ms,
        "link_state": "disabled",
    });

    if let Some(capture) = &ctx.capture {
        let c = capture.snapshot();
        resp["capture"] = serde_json::json!({
            "frames": c.frames_captured,
            "failures": c.failures,
            "acquisitions": c.acquisitions,
        });
    }
    if let Some(link) = &ctx.link {
        let link_state = *link.state.borrow();
        resp["link_state"] = serde_json::json!(link_state);
        resp["upstream"] = serde_json::json!(link.counters.snapshot());
    }
    Json(resp)
}
