mod bridge;
mod collaborators;
mod config;
mod fsm;
mod gallery;
mod rate_limit;
mod session;
mod signaling;
mod web;
mod webrtc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::collaborators::{Collaborators, FsBlobStore, FsRecordStore, HttpFaceDetector, HttpSurfaceAnalyzer, WsUpstreamClient};
use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;
use crate::web::{AppState, ProcessFrameCache};

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/lumen.toml");
    let mut i = 1;
    while i < args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            config_path = PathBuf::from(&args[i + 1]);
            i += 1;
        }
        i += 1;
    }
    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_args();
    let config = config::load(&config_path).context("failed to load configuration")?;

    let issues = match config.validate() {
        Ok(()) => Vec::new(),
        Err(issues) => issues,
    };
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{issue}");
        } else {
            tracing::warn!("{issue}");
        }
    }
    if has_errors {
        tracing::error!("configuration has {} issue(s); fix the ERROR(s) above and restart", issues.len());
        std::process::exit(2);
    }

    let bind_addr: SocketAddr =
        format!("{}:{}", config.server.bind, config.server.port).parse().context("invalid bind address")?;

    let detector: Arc<dyn lumen_media::FaceDetector> = Arc::new(HttpFaceDetector::new(
        config.upstream.detector_endpoint.clone(),
        Duration::from_millis(config.media.detector_timeout_ms),
    ));

    let collaborators = Collaborators {
        upstream: Arc::new(WsUpstreamClient::new(config.upstream.live_endpoint.clone(), config.upstream.live_api_key.clone())),
        analyzer: Arc::new(HttpSurfaceAnalyzer::new(config.upstream.analyzer_endpoint.clone())),
        blob_store: Arc::new(FsBlobStore::new("./data/blobs", config.gallery.blob_bucket.clone())),
        record_store: Arc::new(FsRecordStore::new("./data/records", config.gallery.record_namespace.clone())),
    };

    let shield = lumen_media::PrivacyShield::new(
        Box::new(web::SharedDetector(detector.clone())),
        config.media.blur_radius_min,
        config.media.crowd_threshold,
    );

    let sessions = SessionManager::new(config.clone(), Collaborators {
        upstream: collaborators.upstream.clone(),
        analyzer: collaborators.analyzer.clone(),
        blob_store: collaborators.blob_store.clone(),
        record_store: collaborators.record_store.clone(),
    }, detector);

    let state = Arc::new(AppState {
        http_limiter: RateLimiter::new(config.rate_limit.requests_per_minute),
        idempotency: ProcessFrameCache::new(Duration::from_secs(300)),
        started_at: Instant::now(),
        config,
        sessions,
        collaborators,
        shield,
    });

    let idle_secs = state.config.session.idle_secs;
    if idle_secs > 0 {
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let reaped = reaper_state.sessions.reap_idle().await;
                for session_id in reaped {
                    tracing::info!(%session_id, "reaped idle session");
                }
            }
        });
    } else {
        tracing::info!("session idle timeout disabled (session.idle_secs = 0)");
    }

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request.headers().get("x-request-id").and_then(|v| v.to_str().ok()).unwrap_or("-");
                    tracing::info_span!("request", method = %request.method(), path = %request.uri().path(), request_id = %request_id)
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(|response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, status = %response.status().as_u16(), duration_ms = %latency.as_millis(), "completed");
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("lumen-gateway listening on http://{bind_addr}");

    let listener = TcpListener::bind(bind_addr).await.with_context(|| format!("failed to bind to {bind_addr}"))?;

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;

    tracing::info!("draining in-flight sessions before exit...");
    state.sessions.shutdown(SHUTDOWN_DRAIN).await;
    tracing::info!("lumen-gateway shut down cleanly");

    Ok(())
}

/// Bounded wait for in-flight upstream turns to reach `finished`/`timeout`
/// once shutdown has begun, before sessions are force-destroyed.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Resolves once SIGINT or SIGTERM arrives; `axum::serve`'s graceful shutdown
/// stops accepting new connections (so no new `/webrtc` offers land) as soon
/// as this future completes, after which `main` drains live sessions.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
