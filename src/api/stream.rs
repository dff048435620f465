//! Live stream endpoints: MJPEG video, WebSocket detection events, and
//! session control.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{ApiError, AppState};
use crate::events::OutboundEvent;
use crate::render::{encode_jpeg, FrameCompositor};
use crate::session::{StartOutcome, StatusReport};

pub const MJPEG_BOUNDARY: &str = "frame";

/// One multipart part carrying a JPEG image.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--");
    part.extend_from_slice(MJPEG_BOUNDARY.as_bytes());
    part.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

pub async fn video(State(state): State<AppState>) -> Result<Response, ApiError> {
    if !state.session.is_running() {
        let session = state.session.clone();
        tokio::task::spawn_blocking(move || session.start())
            .await?
            .map_err(|e| {
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Failed to start streaming services: {:#}", e),
                )
            })?;
    }

    let settings = &state.session.config().stream;
    let (interval, width, quality) = (
        settings.frame_interval,
        settings.display_width,
        settings.jpeg_quality,
    );
    let compositor = state.session.compositor();
    log::info!("video viewer connected");

    let frames = futures::stream::unfold(
        (compositor, state, true),
        move |(compositor, state, first): (FrameCompositor, AppState, bool)| async move {
            if !first {
                tokio::time::sleep(interval).await;
            }
            if state.is_closing() {
                return None;
            }
            let (compositor, jpeg) = tokio::task::spawn_blocking(move || {
                let mut compositor = compositor;
                let image = compositor.render(width);
                (compositor, encode_jpeg(&image, quality))
            })
            .await
            .ok()?;

            let part = match jpeg {
                Ok(bytes) => Some(mjpeg_part(&bytes)),
                Err(e) => {
                    log::error!("skipping video frame: {:#}", e);
                    None
                }
            };
            Some((part, (compositor, state, false)))
        },
    )
    .filter_map(|part| async move { part.map(Ok::<_, Infallible>) });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from_stream(frames))
        .map_err(|e| ApiError::internal(format!("build video response: {}", e)))
}

pub async fn detections_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| publish_events(socket, state))
}

/// Counts a WebSocket viewer for as long as it is alive.
struct ViewerGuard(Arc<AtomicUsize>);

impl ViewerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn publish_events(mut socket: WebSocket, state: AppState) {
    let _viewer = ViewerGuard::new(state.active_websockets.clone());
    let mut events = state.session.events().subscribe();
    let settings = &state.session.config().stream;
    let period = settings.ws_poll_interval * settings.ws_status_every;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("websocket viewer connected");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("websocket viewer fell behind; skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                if state.is_closing() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                let status = OutboundEvent::Status {
                    mqtt_connected: state.session.status().mqtt_connected(),
                    active_detections: state.session.detections().len(),
                    is_running: state.session.is_running(),
                    timestamp: crate::timestamp_now(),
                };
                if send_event(&mut socket, &status).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    log::info!("websocket viewer disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &OutboundEvent) -> Result<(), axum::Error> {
    let text = match event.to_json() {
        Ok(text) => text,
        Err(e) => {
            log::error!("cannot serialize event: {}", e);
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

#[derive(Serialize)]
pub struct ControlResponse {
    status: &'static str,
    message: &'static str,
    #[serde(flatten)]
    report: StatusReport,
}

pub async fn start(State(state): State<AppState>) -> Result<Json<ControlResponse>, ApiError> {
    let session = state.session.clone();
    let outcome = tokio::task::spawn_blocking(move || session.start())
        .await?
        .map_err(|e| ApiError::internal(format!("Failed to start stream services: {:#}", e)))?;

    let (status, message) = match outcome {
        StartOutcome::Started => ("started", "RTSP and MQTT services started successfully"),
        StartOutcome::AlreadyRunning => ("already_running", "Stream services are already running"),
    };
    Ok(Json(ControlResponse {
        status,
        message,
        report: state.session.report(),
    }))
}

pub async fn stop(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let session = state.session.clone();
    tokio::task::spawn_blocking(move || session.stop()).await?;
    Ok(Json(json!({
        "status": "stopped",
        "message": "RTSP and MQTT services stopped successfully",
    })))
}

#[derive(Serialize)]
pub struct StatusResponse {
    status: &'static str,
    #[serde(flatten)]
    report: StatusReport,
    active_websockets: usize,
    hub_user: String,
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.session.report();
    Json(StatusResponse {
        status: if report.is_running { "available" } else { "stopped" },
        report,
        active_websockets: state.active_websockets.load(Ordering::SeqCst),
        hub_user: state.hub.settings().user.clone(),
    })
}

pub async fn current_detections(State(state): State<AppState>) -> Json<Value> {
    let detections = state.session.detections().detections();
    Json(json!({
        "count": detections.len(),
        "detections": detections,
        "timestamp": crate::timestamp_now(),
    }))
}
