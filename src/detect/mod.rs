mod result;
mod store;

pub use result::{BoundingBox, Detection, DetectionBatch, FrameDimensions, UNKNOWN_LABEL};
pub use store::DetectionStore;
