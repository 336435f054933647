//! End-to-end tests over real sockets
//!
//! - Capture buffer → broadcaster → web server → WebSocket viewer
//! - Buffer → upstream link → fake inference server → router → viewer
//!
//! Run: `cargo test -p sightline --test e2e`

#![cfg(feature = "web")]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use sightline::web::{self, LinkStatus, WebContext};
use sightline::{
    Frame, FrameBuffer, LocalBroadcaster, ResultRouter, UpstreamConfig, UpstreamLink,
    ViewerRegistry, WsConnector,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Shared helpers ───────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn jpeg(bytes: &'static [u8]) -> Frame {
    Frame::jpeg(Bytes::from_static(bytes), 2, 2)
}

struct Edge {
    addr: SocketAddr,
    registry: Arc<ViewerRegistry>,
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
}

impl Drop for Edge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start broadcaster, optional upstream link and web server on an ephemeral port.
async fn start_edge(upstream_url: Option<String>) -> Edge {
    init_tracing();
    let buffer = Arc::new(FrameBuffer::new());
    let registry = Arc::new(ViewerRegistry::new());
    let cancel = CancellationToken::new();

    let broadcaster = LocalBroadcaster::new(
        Arc::clone(&buffer),
        Arc::clone(&registry),
        Duration::from_millis(20),
    );
    tokio::spawn(broadcaster.run(cancel.clone()));

    let link = upstream_url.map(|url| {
        let config = UpstreamConfig {
            url,
            reconnect_delay: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
        };
        let link = UpstreamLink::new(
            config,
            Arc::new(WsConnector),
            Arc::clone(&buffer),
            ResultRouter::new(Arc::clone(&registry)),
        );
        let status = LinkStatus {
            state: link.state(),
            counters: link.counters(),
        };
        tokio::spawn(link.run(cancel.clone()));
        status
    });

    let ctx = WebContext {
        registry: Arc::clone(&registry),
        buffer: Arc::clone(&buffer),
        capture: None,
        link,
        viewer_queue: 8,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(web::serve(listener, ctx, cancel.clone()));

    Edge {
        addr,
        registry,
        buffer,
        cancel,
    }
}

/// Connect a viewer and wait until the registry has seen it.
async fn connect_viewer(edge: &Edge, expected_viewers: usize) -> Client {
    let url = format!("ws://{}/ws", edge.addr);
    let (stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("WebSocket connect failed");
    wait_until(|| async move { edge.registry.len().await == expected_viewers }).await;
    stream
}

async fn wait_until<F, Fut>(cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}

/// Next JSON text envelope of the given type, skipping others.
async fn next_envelope(ws: &mut Client, kind: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == kind {
                    return value;
                }
            }
            Ok(Some(Ok(_))) => {}
            other => panic!("no {} envelope: {:?}", kind, other.map(|m| m.map(|r| r.is_ok()))),
        }
    }
}

#[derive(Default)]
struct FakeUpstream {
    received: Mutex<Vec<Vec<u8>>>,
    connections: AtomicUsize,
}

/// Inference server stand-in. Replies `saw N bytes` to every binary frame;
/// if `drop_first` is set, the first connection is closed instead of answered.
async fn start_fake_upstream(drop_first: bool) -> (String, Arc<FakeUpstream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let fake = Arc::new(FakeUpstream::default());

    let state = Arc::clone(&fake);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let index = state.connections.fetch_add(1, Ordering::SeqCst);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Binary(data) = msg else { continue };
                    state.received.lock().unwrap().push(data.to_vec());
                    if drop_first && index == 0 {
                        let _ = ws.close(None).await;
                        return;
                    }
                    let reply = serde_json::json!({
                        "type": "description",
                        "content": format!("saw {} bytes", data.len()),
                    });
                    if ws.send(Message::text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (url, fake)
}

// ═══════════════════════════════════════════════════════════════════════
// Viewer path
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn viewer_receives_latest_frame_as_base64() {
    let edge = start_edge(None).await;
    let mut viewer = connect_viewer(&edge, 1).await;

    edge.buffer.publish(jpeg(&[0xff, 0xd8, 0x01, 0xff, 0xd9]));

    let envelope = next_envelope(&mut viewer, "frame").await;
    let data = general_purpose::STANDARD
        .decode(envelope["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(data, vec![0xff, 0xd8, 0x01, 0xff, 0xd9]);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_viewer_gets_the_frame() {
    let edge = start_edge(None).await;
    let mut a = connect_viewer(&edge, 1).await;
    let mut b = connect_viewer(&edge, 2).await;

    edge.buffer.publish(jpeg(b"shared"));

    for viewer in [&mut a, &mut b] {
        let envelope = next_envelope(viewer, "frame").await;
        assert_eq!(envelope["data"], general_purpose::STANDARD.encode(b"shared"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_viewer_is_unregistered() {
    let edge = start_edge(None).await;
    let mut viewer = connect_viewer(&edge, 1).await;

    viewer.close(None).await.unwrap();
    let registry = &edge.registry;
    wait_until(|| async move { registry.is_empty().await }).await;

    // Broadcasting afterwards reaches nobody and does not fail.
    edge.buffer.publish(jpeg(b"late"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(edge.registry.len().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn viewer_ping_is_answered() {
    let edge = start_edge(None).await;
    let mut viewer = connect_viewer(&edge, 1).await;

    viewer
        .send(Message::Ping(Bytes::from_static(b"alive")))
        .await
        .unwrap();

    let pong = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Pong(data))) = viewer.next().await {
                return data;
            }
        }
    })
    .await
    .expect("no pong");
    assert_eq!(&pong[..], b"alive");
}

// ═══════════════════════════════════════════════════════════════════════
// Upstream path
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn upstream_description_is_rebroadcast_to_viewers() {
    let (url, fake) = start_fake_upstream(false).await;
    let edge = start_edge(Some(url)).await;
    let mut viewer = connect_viewer(&edge, 1).await;

    edge.buffer.publish(jpeg(b"four"));

    let envelope = next_envelope(&mut viewer, "description").await;
    assert_eq!(
        envelope,
        serde_json::json!({"type": "description", "content": "saw 4 bytes"})
    );
    assert_eq!(*fake.received.lock().unwrap(), vec![b"four".to_vec()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_reconnects_without_replaying_failed_frame() {
    let (url, fake) = start_fake_upstream(true).await;
    let edge = start_edge(Some(url)).await;
    let mut viewer = connect_viewer(&edge, 1).await;

    edge.buffer.publish(jpeg(b"first"));
    let fake_ref = &fake;
    wait_until(|| async move { fake_ref.connections.load(Ordering::SeqCst) >= 2 }).await;

    // Give the new session time to (wrongly) resend.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.received.lock().unwrap().len(), 1);

    edge.buffer.publish(jpeg(b"second"));
    let envelope = next_envelope(&mut viewer, "description").await;
    assert_eq!(envelope["content"], "saw 6 bytes");
    assert_eq!(
        *fake.received.lock().unwrap(),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP surface
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn health_and_status_endpoints() {
    let edge = start_edge(None).await;
    let _viewer = connect_viewer(&edge, 1).await;
    edge.buffer.publish(jpeg(b"x"));
    let buffer = &edge.buffer;
    wait_until(|| async move { buffer.stats().taken == 1 }).await;

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{}/health", edge.addr))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "ok");

    let status: serde_json::Value = client
        .get(format!("http://{}/api/status", edge.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["viewers"], 1);
    assert_eq!(status["frames"]["published"], 1);
    assert_eq!(status["frames"]["broadcast"], 1);
    assert_eq!(status["link_state"], "disabled");
    assert!(status.get("upstream").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_link_state() {
    let (url, _fake) = start_fake_upstream(false).await;
    let edge = start_edge(Some(url)).await;
    let client = reqwest::Client::new();
    let status_url = format!("http://{}/api/status", edge.addr);

    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        last = client.get(&status_url).send().await.unwrap().json().await.unwrap();
        if last["link_state"] == "connected" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last["link_state"], "connected");
    assert_eq!(last["upstream"]["connects"], 1);
}
