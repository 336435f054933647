//! Sightline Edge: camera relay daemon
//!
//! Captures camera frames, serves them to local WebSocket viewers, and relays
//! them to a remote inference service whose descriptions are pushed back to
//! the same viewers.
//!
//! ## Usage
//!
//! ```bash
//! # Real camera, upstream at the default ws://127.0.0.1:8000/ws
//! sightline-edge
//!
//! # Synthetic camera, no upstream
//! sightline-edge --test-source --no-upstream
//!
//! # Custom upstream and viewer port
//! SIGHTLINE_UPSTREAM_URL=ws://10.0.0.5:8000/ws SIGHTLINE_WEB_PORT=9000 sightline-edge
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sightline::capture::{CameraOpener, CaptureCounters, FfmpegOpener, TestPatternOpener};
use sightline::web::{LinkStatus, WebContext};
use sightline::{
    EdgeConfig, FrameBuffer, FrameSource, LinkState, LocalBroadcaster, ResultRouter,
    UpstreamLink, ViewerRegistry, WsConnector,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EdgeConfig::from_env().context("Invalid configuration")?;
    // Flushes the file log on drop
    let _log_guard = init_logging(config.log_dir.as_deref())?;

    info!("Sightline Edge starting");
    info!(
        "  Capture: every {:?}, max {}px, quality {}, devices {:?}",
        config.capture.period,
        config.capture.max_dimension,
        config.capture.jpeg_quality,
        config.capture.devices
    );
    info!("  Test source: {}", config.test_source);
    if config.upstream_enabled {
        info!("  Upstream: {}", config.upstream.url);
    } else {
        info!("  Upstream: disabled");
    }
    info!("  Web port: {}", config.web_port);

    // A bind failure is fatal, so bind before starting anything else
    let bind = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let listener = TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;

    let buffer = Arc::new(FrameBuffer::new());
    let registry = Arc::new(ViewerRegistry::new());

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Camera capture on its own OS thread
    let opener: Box<dyn CameraOpener> = if config.test_source {
        Box::new(TestPatternOpener::default())
    } else {
        Box::new(FfmpegOpener::default())
    };
    let source = FrameSource::new(opener, config.capture.clone());
    let capture_counters = source.counters();
    let capture_thread = source.spawn(Arc::clone(&buffer), cancel.clone())?;

    // Local broadcaster
    let broadcaster = LocalBroadcaster::new(
        Arc::clone(&buffer),
        Arc::clone(&registry),
        config.broadcast_period,
    );
    tracker.spawn(broadcaster.run(cancel.clone()));

    // Upstream link
    let link = if config.upstream_enabled {
        let link = UpstreamLink::new(
            config.upstream.clone(),
            Arc::new(WsConnector),
            Arc::clone(&buffer),
            ResultRouter::new(Arc::clone(&registry)),
        );
        let status = LinkStatus {
            state: link.state(),
            counters: link.counters(),
        };
        tracker.spawn(link.run(cancel.clone()));
        Some(status)
    } else {
        None
    };

    // Viewer web server
    let ctx = WebContext {
        registry: Arc::clone(&registry),
        buffer: Arc::clone(&buffer),
        capture: Some(Arc::clone(&capture_counters)),
        link: link.clone(),
        viewer_queue: config.viewer_queue,
    };
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = sightline::web::serve(listener, ctx, web_cancel).await {
            error!("Web server error: {:#}", e);
        }
    });

    tracker.close();

    let stats = StatsSources {
        buffer,
        registry,
        capture: capture_counters,
        link,
    };
    run_until_shutdown(stats, cancel.clone()).await;

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    let joined = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || capture_thread.join()),
    )
    .await;
    if joined.is_err() {
        warn!("Capture thread did not stop within 5s");
    }

    info!("Sightline Edge stopped");
    Ok(())
}

/// Console output plus, when a directory is configured, a daily rolling log
/// file keeping the last 5 files.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("sightline=info".parse()?)
        .add_directive("sightline_edge=info".parse()?);

    let (file_layer, guard, file_error) = match log_dir.map(file_appender) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard), None)
        }
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    match (log_dir, file_error) {
        (Some(dir), Some(e)) => warn!("File logging disabled ({}): {:#}", dir.display(), e),
        (Some(dir), None) => info!("Logging to {}", dir.display()),
        (None, _) => {}
    }
    Ok(guard)
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir).context(format!("Failed to create {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("sightline-edge")
        .filename_suffix("log")
        .max_log_files(5)
        .build(dir)
        .context("Failed to open log file")
}

struct StatsSources {
    buffer: Arc<FrameBuffer>,
    registry: Arc<ViewerRegistry>,
    capture: Arc<CaptureCounters>,
    link: Option<LinkStatus>,
}

/// Log stats every 30s; cancel everything on Ctrl+C or SIGTERM.
async fn run_until_shutdown(stats: StatsSources, cancel: CancellationToken) {
    let mut stats_interval = interval(Duration::from_secs(30));
    // First tick completes immediately
    stats_interval.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => log_stats(&stats).await,
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM. The SIGTERM handler is installed before
/// this returns, so a signal sent right after the call is not missed.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .map_err(|e| error!("Failed to listen for SIGTERM: {}", e))
            .ok()
    };

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }
    }
}

async fn log_stats(stats: &StatsSources) {
    let capture = stats.capture.snapshot();
    let buffer = stats.buffer.stats();
    let viewers = stats.registry.len().await;

    let upstream = match &stats.link {
        Some(link) => {
            let state: LinkState = *link.state.borrow();
            let s = link.counters.snapshot();
            format!(
                "upstream {} ({} sent, {} descriptions, {} malformed, {} reconnects)",
                state, s.frames_sent, s.descriptions, s.malformed, s.failures
            )
        }
        None => "upstream disabled".to_string(),
    };

    info!(
        "Stats: {} captured, {} capture failures, {} overwritten unread, {} viewers, {}",
        capture.frames_captured, capture.failures, buffer.overwritten, viewers, upstream
    );
}
