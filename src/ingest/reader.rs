use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceConnector};
use crate::frame::FrameBuffer;
use crate::session::StreamStatus;

/// Default pause between failed connection attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Longest uninterrupted sleep while backing off; bounds stop latency.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Keeps one video source open while the session runs and pushes every decoded
/// frame into the shared buffer.
///
/// A read error drops the source, clears the RTSP flag and reopens at once.
/// A failed open waits out the backoff before the next attempt. The loop exits
/// once the session's running flag goes false.
pub struct RtspReader<C: SourceConnector> {
    connector: C,
    frames: Arc<FrameBuffer>,
    status: Arc<StreamStatus>,
    backoff: Duration,
    state: ReaderState,
}

impl<C: SourceConnector> RtspReader<C> {
    pub fn new(connector: C, frames: Arc<FrameBuffer>, status: Arc<StreamStatus>) -> Self {
        Self {
            connector,
            frames,
            status,
            backoff: DEFAULT_RECONNECT_BACKOFF,
            state: ReaderState::Disconnected,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Run the reader on its own named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("rtsp-reader".to_string())
            .spawn(move || self.run())
    }

    /// Read until the session stops.
    pub fn run(mut self) {
        let target = self.connector.describe();
        let mut source: Option<C::Source> = None;

        while self.status.is_running() {
            match source.as_mut() {
                None => {
                    self.state = ReaderState::Connecting;
                    match self.connector.connect() {
                        Ok(opened) => {
                            log::info!("rtsp reader: stream opened ({})", target);
                            source = Some(opened);
                            self.state = ReaderState::Streaming;
                            self.status.set_rtsp_connected(true);
                        }
                        Err(e) => {
                            log::warn!("rtsp reader: cannot open {}: {:#}", target, e);
                            self.state = ReaderState::Disconnected;
                            self.status.set_rtsp_connected(false);
                            self.pause();
                        }
                    }
                }
                Some(open) => match open.read_frame() {
                    Ok(frame) => {
                        log::debug!("rtsp reader: frame {}", frame.sequence);
                        self.frames.push(frame);
                    }
                    Err(e) => {
                        log::warn!("rtsp reader: stream lost ({}): {:#}", target, e);
                        source = None;
                        self.state = ReaderState::Disconnected;
                        self.status.set_rtsp_connected(false);
                    }
                },
            }
        }

        drop(source);
        self.state = ReaderState::Disconnected;
        self.status.set_rtsp_connected(false);
        log::info!("rtsp reader: stopped");
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.backoff;
        while self.status.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }
}
