//! HTTP surface: live stream publishers, stream control, hub operations.
//!
//! The server runs on its own tokio runtime thread so the rest of the crate can
//! stay synchronous. `ApiServer::spawn` binds first, so callers learn the
//! bound address (port 0 works) before any request is served.

use anyhow::{anyhow, Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

use crate::config::GatewayConfig;
use crate::hub::{HubSession, JobRegistry};
use crate::session::StreamSession;

mod error;
mod hub;
mod stream;

pub use error::ApiError;

const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<StreamSession>,
    pub hub: Arc<HubSession>,
    pub jobs: Arc<JobRegistry>,
    pub active_websockets: Arc<AtomicUsize>,
    /// Set once the server starts draining; long-lived streams end on it.
    pub closing: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            hub: Arc::new(HubSession::new(config.hub.clone())),
            session: Arc::new(StreamSession::new(config)),
            jobs: Arc::new(JobRegistry::new()),
            active_websockets: Arc::new(AtomicUsize::new(0)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/stream/video", get(stream::video))
        .route("/api/stream/detections", get(stream::detections_socket))
        .route("/api/stream/start", post(stream::start))
        .route("/api/stream/stop", post(stream::stop))
        .route("/api/stream/status", get(stream::status))
        .route("/api/stream/detections/current", get(stream::current_detections))
        .route("/api/hub/connect", post(hub::connect))
        .route("/api/hub/status", get(hub::status))
        .route("/api/hub/start-server", post(hub::start_server))
        .route(
            "/api/training/upload",
            post(hub::upload_training).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/deployment/start", post(hub::start_deployment))
        .route("/api/deployment/status/{id}", get(hub::deployment_status))
        .route("/api/system/info", get(hub::system_info))
        .route("/api/system/cleanup", post(hub::cleanup))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Edge ML Operations API is running" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": crate::timestamp_now() }))
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: AppState,
}

/// A running server. Dropping the handle requests shutdown without waiting for it.
#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<Result<()>>>,
}

impl ApiHandle {
    /// Drain in-flight requests and wait for the server thread.
    pub fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join_thread()
    }

    /// Block until the server exits on its own (Ctrl-C).
    pub fn wait(mut self) -> Result<()> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("api server thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: AppState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("api-worker")
            .build()
            .context("build api runtime")?;

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind(&self.cfg.addr))
            .with_context(|| format!("bind api listener on {}", self.cfg.addr))?;
        let addr = listener.local_addr().context("api listener address")?;
        log::info!("api listening on http://{}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let closing = self.state.closing.clone();
        let app = router(self.state);
        let join = std::thread::Builder::new()
            .name("api-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown_signal(shutdown_rx, closing))
                        .await
                        .context("api server failed")
                })
            })
            .context("spawn api server thread")?;

        Ok(ApiHandle {
            addr,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

async fn shutdown_signal(stop: oneshot::Receiver<()>, closing: Arc<AtomicBool>) {
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("api: cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = stop => log::info!("api: shutdown requested"),
        _ = interrupted => log::info!("api: interrupted, shutting down"),
    }
    closing.store(true, Ordering::SeqCst);
}
