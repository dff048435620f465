use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label the detector uses for faces it could not match to a known identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

const DEFAULT_FRAME_WIDTH: u32 = 1280;
const DEFAULT_FRAME_HEIGHT: u32 = 720;

/// Axis-aligned box in source-frame pixel coordinates.
///
/// Serialized as the detector's `[x, y, w, h]` array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// One recognized face/object, in the detector's wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,

    /// Display name; `UNKNOWN_LABEL` when the detector has no match.
    #[serde(rename = "name", default = "unknown_label")]
    pub label: String,

    /// Score in 0..=100.
    #[serde(default)]
    pub confidence: f64,

    /// Stable identifier of a known person, when matched. Detectors send
    /// strings or integers; the value is forwarded as received.
    #[serde(rename = "person_id", default)]
    pub identity_id: Option<Value>,
}

impl Detection {
    pub fn is_unknown(&self) -> bool {
        self.label.trim().eq_ignore_ascii_case(UNKNOWN_LABEL)
    }

    /// Overlay text: the label, plus the rounded confidence when positive.
    pub fn display_label(&self) -> String {
        if self.confidence > 0.0 {
            format!("{} ({:.0}%)", self.label, self.confidence)
        } else {
            self.label.clone()
        }
    }
}

fn unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

/// Source frame size the detector ran at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for FrameDimensions {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
        }
    }
}

/// Latest full result from the detector. Replaced wholesale, never merged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    /// Detector timestamp, passed through verbatim (`Null` when absent).
    pub timestamp: Value,
    pub frame_dimensions: FrameDimensions,
}

impl DetectionBatch {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Parse one MQTT payload from the detector.
    ///
    /// The payload must be a JSON object. A missing `detected_faces` key is an
    /// empty batch. Individual records that fail to parse are skipped.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(payload).context("decode detector payload as JSON")?;
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("detector payload is not a JSON object"))?;

        let records: &[Value] = match object.get("detected_faces") {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(_) => return Err(anyhow!("detected_faces is not an array")),
        };

        let mut detections = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match Detection::deserialize(record) {
                Ok(detection) => detections.push(detection),
                Err(e) => log::warn!("skipping malformed detection #{}: {}", index, e),
            }
        }

        let frame_dimensions = object
            .get("frame_dimensions")
            .and_then(|v| FrameDimensions::deserialize(v).ok())
            .unwrap_or_default();

        Ok(Self {
            detections,
            timestamp: object.get("timestamp").cloned().unwrap_or(Value::Null),
            frame_dimensions,
        })
    }
}
