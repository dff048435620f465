//! Edge gateway
//!
//! Fans a live camera stream and its remote detection results out to browser
//! viewers, and drives training uploads and model deployments on a notebook hub.
//!
//! # Data flow
//!
//! ```text
//! RTSP camera -> RtspReader -> FrameBuffer -\
//!                                             FrameCompositor -> MJPEG viewers
//! MQTT broker -> MqttSubscriber -> DetectionStore -/
//!                              \-> EventBus -> WebSocket viewers
//! ```
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and the bounded, drop-oldest frame buffer
//! - `detect`: detection payload types and the latest-batch store
//! - `events`: the viewer event bus
//! - `ingest`: RTSP sources and the reconnecting reader
//! - `transport`: MQTT endpoint parsing, TLS and the detection subscriber
//! - `render`: overlay compositing and JPEG encoding
//! - `session`: start/stop lifecycle of the streaming services
//! - `hub`: notebook hub client, training uploads and deployment jobs
//! - `api`: the HTTP and WebSocket surface
//! - `config`: file and environment configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod events;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod render;
pub mod session;
pub mod transport;

pub use api::{ApiConfig, ApiHandle, ApiServer, AppState};
pub use config::GatewayConfig;
pub use detect::{BoundingBox, Detection, DetectionBatch, DetectionStore};
pub use events::{EventBus, OutboundEvent};
pub use frame::{Frame, FrameBuffer};
pub use hub::{HubClient, HubError, HubSession, JobRegistry};
pub use ingest::{RtspConfig, RtspReader, RtspSource};
pub use render::FrameCompositor;
pub use session::{StartOutcome, StatusReport, StreamSession};
pub use transport::{MqttSettings, MqttSubscriber};

/// Current UTC time as RFC 3339, the timestamp format of every outbound message.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
