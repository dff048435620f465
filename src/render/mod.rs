//! Frame compositing: overlay the current detections on the latest frame.
//!
//! One `FrameCompositor` exists per video viewer. It pops from the shared frame
//! buffer, remembers the last frame it saw, and re-draws that frame with the
//! current detections whenever the buffer is empty.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::Arc;

use crate::detect::{BoundingBox, Detection, DetectionStore};
use crate::frame::{Frame, FrameBuffer};

pub mod font;

pub const DEFAULT_TARGET_WIDTH: u32 = 800;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const PLACEHOLDER_TEXT: &str = "NO STREAM";

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: u32 = 2;
const LABEL_GAP: i32 = 4;
const PLACEHOLDER_SCALE: u32 = 3;

/// A detection box in rendered-frame pixels, already clamped to the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub struct FrameCompositor {
    frames: Arc<FrameBuffer>,
    detections: Arc<DetectionStore>,
    last_frame: Option<Frame>,
}

impl FrameCompositor {
    pub fn new(frames: Arc<FrameBuffer>, detections: Arc<DetectionStore>) -> Self {
        Self {
            frames,
            detections,
            last_frame: None,
        }
    }

    /// Whether a source frame has been seen by this compositor.
    pub fn has_frame(&self) -> bool {
        self.last_frame.is_some()
    }

    /// Produce one annotated image `target_width` pixels wide.
    pub fn render(&mut self, target_width: u32) -> RgbImage {
        if let Some(frame) = self.frames.try_pop() {
            self.last_frame = Some(frame);
        }
        let Some(frame) = &self.last_frame else {
            return placeholder(target_width);
        };

        let mut canvas = resize_to_width(frame.image(), target_width);
        let scale_x = canvas.width() as f64 / frame.width() as f64;
        let scale_y = canvas.height() as f64 / frame.height() as f64;

        let batch = self.detections.snapshot();
        for detection in &batch.detections {
            let Some(pixels) =
                scale_box(&detection.bounding_box, scale_x, scale_y, canvas.width(), canvas.height())
            else {
                log::warn!("skipping detection with invalid box: {:?}", detection);
                continue;
            };
            draw_detection(&mut canvas, detection, pixels);
        }
        canvas
    }
}

/// Scale a detector box into a `frame_width` x `frame_height` image.
///
/// Coordinates truncate toward zero. The origin is clamped into the frame and
/// the size into `[1, remaining extent]`. Non-finite boxes yield `None`.
pub fn scale_box(
    bbox: &BoundingBox,
    scale_x: f64,
    scale_y: f64,
    frame_width: u32,
    frame_height: u32,
) -> Option<PixelBox> {
    if !bbox.is_finite() || frame_width == 0 || frame_height == 0 {
        return None;
    }
    let fw = frame_width as i64;
    let fh = frame_height as i64;

    let x = ((bbox.x * scale_x) as i64).clamp(0, fw - 1);
    let y = ((bbox.y * scale_y) as i64).clamp(0, fh - 1);
    let width = ((bbox.width * scale_x) as i64).clamp(1, fw - x);
    let height = ((bbox.height * scale_y) as i64).clamp(1, fh - y);

    Some(PixelBox {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    })
}

pub fn color_for(detection: &Detection) -> Rgb<u8> {
    if detection.is_unknown() {
        UNKNOWN_COLOR
    } else {
        KNOWN_COLOR
    }
}

fn draw_detection(canvas: &mut RgbImage, detection: &Detection, pixels: PixelBox) {
    let color = color_for(detection);
    for inset in 0..BOX_THICKNESS {
        if pixels.width <= 2 * inset || pixels.height <= 2 * inset {
            break;
        }
        let rect = Rect::at((pixels.x + inset) as i32, (pixels.y + inset) as i32)
            .of_size(pixels.width - 2 * inset, pixels.height - 2 * inset);
        draw_hollow_rect_mut(canvas, rect, color);
    }

    // Below the box, or above it when there is no room.
    let label = detection.display_label();
    let label_height = font::text_height(LABEL_SCALE) as i32;
    let below = (pixels.y + pixels.height) as i32 + LABEL_GAP;
    let label_y = if below + label_height <= canvas.height() as i32 {
        below
    } else {
        (pixels.y as i32 - LABEL_GAP - label_height).max(0)
    };
    font::draw_text(canvas, pixels.x as i32, label_y, &label, color, LABEL_SCALE);
}

fn resize_to_width(image: &RgbImage, target_width: u32) -> RgbImage {
    let target_width = target_width.max(1);
    if image.width() == target_width {
        return image.clone();
    }
    let scale = target_width as f64 / image.width() as f64;
    let target_height = ((image.height() as f64 * scale) as u32).max(1);
    imageops::resize(image, target_width, target_height, FilterType::Triangle)
}

/// Black 16:9 frame with a centred "no stream" marker.
pub fn placeholder(target_width: u32) -> RgbImage {
    let width = target_width.max(1);
    let height = (width * 9 / 16).max(1);
    let mut image = RgbImage::new(width, height);

    let text_width = font::text_width(PLACEHOLDER_TEXT, PLACEHOLDER_SCALE) as i32;
    let text_height = font::text_height(PLACEHOLDER_SCALE) as i32;
    let x = (width as i32 - text_width) / 2;
    let y = (height as i32 - text_height) / 2;
    font::draw_text(&mut image, x, y, PLACEHOLDER_TEXT, TEXT_COLOR, PLACEHOLDER_SCALE);
    image
}

/// Encode an image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode JPEG")?;
    Ok(out)
}
