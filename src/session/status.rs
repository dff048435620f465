use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::events::{EventBus, OutboundEvent, StatusField};

/// Shared connectivity flags for one stream session.
///
/// The background tasks flip their own flag; every transition is announced
/// on the event bus as a `status_change` event.
#[derive(Debug)]
pub struct StreamStatus {
    running: AtomicBool,
    mqtt_connected: AtomicBool,
    rtsp_connected: AtomicBool,
    events: EventBus,
}

impl StreamStatus {
    pub fn new(events: EventBus) -> Self {
        Self {
            running: AtomicBool::new(false),
            mqtt_connected: AtomicBool::new(false),
            rtsp_connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::SeqCst)
    }

    pub fn rtsp_connected(&self) -> bool {
        self.rtsp_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Record the MQTT flag; returns true if it changed.
    pub fn set_mqtt_connected(&self, connected: bool) -> bool {
        self.update(StatusField::MqttConnected, connected)
    }

    /// Record the RTSP flag; returns true if it changed.
    pub fn set_rtsp_connected(&self, connected: bool) -> bool {
        self.update(StatusField::RtspConnected, connected)
    }

    fn update(&self, field: StatusField, value: bool) -> bool {
        let flag = match field {
            StatusField::MqttConnected => &self.mqtt_connected,
            StatusField::RtspConnected => &self.rtsp_connected,
        };
        let previous = flag.swap(value, Ordering::SeqCst);
        if previous != value {
            self.events.publish(OutboundEvent::status_change(field, value));
        }
        previous != value
    }

    /// Force both connectivity flags down without announcing it (session stop).
    pub(crate) fn reset_connectivity(&self) {
        self.mqtt_connected.store(false, Ordering::SeqCst);
        self.rtsp_connected.store(false, Ordering::SeqCst);
    }
}

/// Read-only composite of the session state, as served by the status endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub is_running: bool,
    pub mqtt_connected: bool,
    pub rtsp_connected: bool,
    pub active_detections: usize,
    pub frame_queue_size: usize,
    pub rtsp_url: String,
    pub mqtt_broker: String,
    pub mqtt_topic: String,
}
