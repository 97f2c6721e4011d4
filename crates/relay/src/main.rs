mod api;
mod broadcast;
mod config;
mod cors;
mod error;
mod hub;
mod memory;
mod metrics;
mod persistence;
mod rate_limit;
mod session;
mod validation;
mod ws;

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use canvasync_common::types::DEFAULT_CANVAS_ID;
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};

use crate::config::{LogFormat, RelayConfig};
use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::hub::{spawn_hub, spawn_sweeper, HubHandle, HubSettings};
use crate::memory::{monitor::spawn_monitor, GovernorHandle};
use crate::metrics::RelayMetrics;
use crate::persistence::{spawn_backup_task, CanvasFiles, CanvasStore};
use crate::session::SessionSettings;
use crate::validation::{ws_frame_limit, Limits};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let rates = config.rate_table().context("failed to load rate limit table")?;
    let metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let limits = Limits::from(&config);
    let governor = GovernorHandle::new(config.memory_ceiling_bytes);
    let files = CanvasFiles::new(&config.data_dir)
        .with_context(|| format!("failed to prepare data dir `{}`", config.data_dir.display()))?;
    let store = CanvasStore::with_governor(files, limits, config.flush_debounce, governor.clone());
    let main_canvas = store
        .load(DEFAULT_CANVAS_ID)
        .await
        .context("failed to load the main canvas")?;
    info!(
        canvas_id = DEFAULT_CANVAS_ID,
        strokes = main_canvas.strokes.len(),
        last_sequence = main_canvas.last_sequence,
        "main canvas loaded"
    );

    let (hub, hub_task) = spawn_hub(
        HubSettings {
            session: SessionSettings::from(&config),
            rates,
            canvas_id: DEFAULT_CANVAS_ID.to_string(),
            resume_sequence: main_canvas.last_sequence,
        },
        store.clone(),
        governor.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = [
        spawn_monitor(governor.clone(), hub.clone(), config.memory_sample_interval, shutdown_rx.clone()),
        spawn_sweeper(hub.clone(), config.cleanup_interval, shutdown_rx.clone()),
        spawn_backup_task(store.clone(), config.backup_interval, config.backup_retention, shutdown_rx),
    ];

    let api_router = api::router(api::ApiState {
        hub: hub.clone(),
        store: store.clone(),
        governor: governor.clone(),
        metrics,
        started_at: Instant::now(),
    })
    .layer(cors::cors_layer(config.cors_origins.as_deref()));
    let app = build_router(hub.clone(), ws_frame_limit(&limits), api_router);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, data_dir = %config.data_dir.display(), "starting relay server");

    let shutdown_timeout = config.shutdown_timeout;
    let drain_hub = hub.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_timeout).await;
                error!(timeout_secs = shutdown_timeout.as_secs(), "shutdown timed out, exiting");
                std::process::exit(1);
            });
            if !drain_hub.shutdown().await {
                warn!("hub already stopped");
            }
        })
        .await
        .context("relay server exited unexpectedly")?;

    if let Err(join_error) = hub_task.await {
        error!(?join_error, "hub task failed");
    }
    let _ = shutdown_tx.send(true);
    for task in background {
        let _ = task.await;
    }

    let remaining = store.flush_all(shutdown_timeout).await;
    if !remaining.is_empty() {
        error!(canvases = ?remaining, "canvases left unflushed at shutdown");
    }
    let released = governor.release_all();
    info!(released, "relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_router(hub: HubHandle, frame_limit: usize, api_router: Router) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(hub, frame_limit))
            .merge(api_router),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
