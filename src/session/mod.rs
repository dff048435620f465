//! Stream session lifecycle.
//!
//! A `StreamSession` owns the shared state of the live pipeline (frame buffer,
//! detection store, status flags, event bus) and at most one running
//! reader/subscriber pair. HTTP handlers hold it behind an `Arc`.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::GatewayConfig;
use crate::detect::DetectionStore;
use crate::events::EventBus;
use crate::frame::FrameBuffer;
use crate::ingest::{RtspConnector, RtspReader};
use crate::render::FrameCompositor;
use crate::transport::{MqttHandle, MqttSubscriber};

mod status;

pub use status::{StatusReport, StreamStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct RunningServices {
    reader: JoinHandle<()>,
    mqtt: MqttHandle,
}

pub struct StreamSession {
    config: GatewayConfig,
    frames: Arc<FrameBuffer>,
    detections: Arc<DetectionStore>,
    events: EventBus,
    status: Arc<StreamStatus>,
    services: Mutex<Option<RunningServices>>,
}

impl StreamSession {
    pub fn new(config: GatewayConfig) -> Self {
        let events = EventBus::new(config.stream.event_queue_capacity);
        Self {
            frames: Arc::new(FrameBuffer::new(config.stream.frame_buffer_capacity)),
            detections: Arc::new(DetectionStore::new()),
            status: Arc::new(StreamStatus::new(events.clone())),
            events,
            config,
            services: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn detections(&self) -> &Arc<DetectionStore> {
        &self.detections
    }

    pub fn status(&self) -> &Arc<StreamStatus> {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// A compositor for one new viewer.
    pub fn compositor(&self) -> FrameCompositor {
        FrameCompositor::new(self.frames.clone(), self.detections.clone())
    }

    /// Launch the RTSP reader and MQTT subscriber.
    ///
    /// Idempotent: a second call while running launches nothing. Fails only
    /// when the services cannot be constructed locally (bad TLS material,
    /// thread spawn failure); unreachable upstreams are retried in the
    /// background.
    pub fn start(&self) -> Result<StartOutcome> {
        let mut services = self.lock_services();
        if services.is_some() {
            log::warn!("stream session already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let mqtt_settings = self.config.mqtt.settings()?;
        self.status.set_running(true);

        let mqtt = MqttSubscriber::new(
            mqtt_settings,
            self.detections.clone(),
            self.events.clone(),
            self.status.clone(),
        )
        .spawn();
        let mqtt = match mqtt {
            Ok(handle) => handle,
            Err(e) => {
                self.status.set_running(false);
                return Err(e);
            }
        };

        let reader = RtspReader::new(
            RtspConnector::new(self.config.rtsp.source_config()),
            self.frames.clone(),
            self.status.clone(),
        )
        .with_backoff(self.config.rtsp.reconnect_backoff)
        .spawn()
        .context("spawn RTSP reader thread");
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                self.status.set_running(false);
                mqtt.shutdown();
                return Err(e);
            }
        };

        *services = Some(RunningServices { reader, mqtt });
        log::info!(
            "stream session started (rtsp {}, mqtt {} topic {})",
            self.config.rtsp.url,
            self.config.mqtt.broker_addr,
            self.config.mqtt.topic
        );
        Ok(StartOutcome::Started)
    }

    /// Stop both services and reset shared state. Blocks until the worker
    /// threads exit. Idempotent.
    pub fn stop(&self) {
        let mut services = self.lock_services();
        let Some(running) = services.take() else {
            return;
        };

        self.status.set_running(false);
        running.mqtt.shutdown();
        if running.reader.join().is_err() {
            log::error!("rtsp reader thread panicked");
        }

        self.detections.clear();
        self.frames.clear();
        self.status.reset_connectivity();
        log::info!("stream session stopped");
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            is_running: self.status.is_running(),
            mqtt_connected: self.status.mqtt_connected(),
            rtsp_connected: self.status.rtsp_connected(),
            active_detections: self.detections.len(),
            frame_queue_size: self.frames.len(),
            rtsp_url: self.config.rtsp.url.clone(),
            mqtt_broker: self.config.mqtt.broker_addr.clone(),
            mqtt_topic: self.config.mqtt.topic.clone(),
        }
    }

    fn lock_services(&self) -> MutexGuard<'_, Option<RunningServices>> {
        match self.services.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}
