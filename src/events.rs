//! Outbound events for WebSocket viewers.
//!
//! The MQTT subscriber and RTSP reader publish into an `EventBus`; every
//! connected WebSocket publisher holds its own receiver. The bus is a bounded
//! broadcast channel:
//! - `publish` never blocks the ingestion thread
//! - a receiver that falls more than `capacity` events behind skips the oldest
//! - with no receivers attached, events are dropped (no history for offline viewers)

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::detect::{Detection, DetectionBatch, FrameDimensions};

/// Default global cap on queued outbound events.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 100;

/// Connectivity flag named in a status change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    MqttConnected,
    RtspConnected,
}

/// Message pushed to WebSocket viewers, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Detections {
        data: Vec<Detection>,
        timestamp: Value,
        frame_dimensions: FrameDimensions,
    },
    StatusChange {
        status_type: StatusField,
        status_value: bool,
        timestamp: String,
    },
    Status {
        mqtt_connected: bool,
        active_detections: usize,
        is_running: bool,
        timestamp: String,
    },
}

impl OutboundEvent {
    pub fn detections(batch: &DetectionBatch) -> Self {
        Self::Detections {
            data: batch.detections.clone(),
            timestamp: batch.timestamp.clone(),
            frame_dimensions: batch.frame_dimensions,
        }
    }

    pub fn status_change(field: StatusField, value: bool) -> Self {
        Self::StatusChange {
            status_type: field,
            status_value: value,
            timestamp: crate::timestamp_now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Bounded fan-out queue from ingestion to WebSocket publishers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<OutboundEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Publish to all attached receivers. Returns how many were reached.
    pub fn publish(&self, event: OutboundEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Publish a detection batch, skipping empty batches and the no-viewer case.
    pub fn publish_detections(&self, batch: &DetectionBatch) -> bool {
        if batch.is_empty() || self.subscriber_count() == 0 {
            return false;
        }
        self.publish(OutboundEvent::detections(batch)) > 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_QUEUE_CAPACITY)
    }
}
