//! Frame ingestion.
//!
//! - `rtsp`: the RTSP source (GStreamer backend, synthetic `stub://` backend)
//! - `reader`: the background loop that keeps a source open and feeds the frame buffer
//!
//! Sources are opened through a `SourceConnector`, so the reader's reconnect policy
//! is independent of how frames are decoded.

use anyhow::Result;

use crate::frame::Frame;

mod reader;
pub mod rtsp;

pub use reader::{ReaderState, RtspReader};
pub use rtsp::{RtspConfig, RtspConnector, RtspSource};

/// An open video stream.
pub trait FrameSource: Send {
    /// Block until the next decoded frame is available.
    ///
    /// An error means the stream is unusable; the caller drops the source.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Opens a fresh `FrameSource` for each connection attempt.
pub trait SourceConnector: Send + 'static {
    type Source: FrameSource;

    fn connect(&self) -> Result<Self::Source>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}
