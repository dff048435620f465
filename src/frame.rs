//! Raw video frames and the bounded frame buffer.
//!
//! - `Frame`: one decoded RGB image captured from the RTSP source.
//! - `FrameBuffer`: bounded, drop-oldest queue between the RTSP reader and the compositor.
//!
//! Frames are a "latest-wins" resource. The buffer never blocks and never fails on push;
//! when full, the oldest frame is evicted to admit the newest.

use image::RgbImage;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default frame buffer capacity.
pub const DEFAULT_FRAME_BUFFER_CAPACITY: usize = 5;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One raw image captured from the video source.
///
/// Not `Clone`: ownership moves from the reader into the buffer, then into the
/// compositor, which does not hand it back.
pub struct Frame {
    image: RgbImage,
    /// Capture sequence number assigned by the source.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from tightly packed RGB bytes.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(|image| Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded drop-oldest queue
// ----------------------------------------------------------------------------

/// Bounded ring buffer for raw frames.
///
/// Shared between the RTSP reader (writer) and any number of compositors (readers).
/// The lock is held for a single push or pop only, never across I/O.
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest one first if the buffer is full.
    ///
    /// Returns the number of frames evicted (0 or 1).
    pub fn push(&self, frame: Frame) -> usize {
        let mut frames = self.lock();
        let mut evicted = 0;
        while frames.len() >= self.capacity {
            frames.pop_front();
            evicted += 1;
        }
        frames.push_back(frame);
        evicted
    }

    /// Take the oldest buffered frame, if any. Never blocks on an empty buffer.
    pub fn try_pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered frame.
    pub fn clear(&self) {
        self.lock().clear();
    }

    // A writer that panicked mid-push leaves the deque structurally intact,
    // so a poisoned lock is still safe to reuse.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_BUFFER_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
