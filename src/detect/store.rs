use std::sync::{Arc, RwLock};

use super::{Detection, DetectionBatch};

/// Latest-value cache for the most recent detection batch.
///
/// Written by the MQTT subscriber, read by compositors and status queries.
/// `replace` swaps the whole batch under the write lock; `snapshot` hands out
/// the immutable batch that was current at that instant, so readers never see
/// fields from two different batches.
#[derive(Default)]
pub struct DetectionStore {
    current: RwLock<Arc<DetectionBatch>>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the stored batch. Returns the new detection count.
    pub fn replace(&self, batch: DetectionBatch) -> usize {
        let count = batch.len();
        let batch = Arc::new(batch);
        match self.current.write() {
            Ok(mut guard) => *guard = batch,
            Err(poisoned) => *poisoned.into_inner() = batch,
        }
        count
    }

    pub fn snapshot(&self) -> Arc<DetectionBatch> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Owned copy of the current detections.
    pub fn detections(&self) -> Vec<Detection> {
        self.snapshot().detections.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.replace(DetectionBatch::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, FrameDimensions};
    use serde_json::Value;

    fn uniform_batch(tag: &str, count: usize, size: u32) -> DetectionBatch {
        DetectionBatch {
            detections: (0..count)
                .map(|i| Detection {
                    bounding_box: BoundingBox::new(i as f64, 0.0, 1.0, 1.0),
                    label: tag.to_string(),
                    confidence: 50.0,
                    identity_id: None,
                })
                .collect(),
            timestamp: Value::from(tag),
            frame_dimensions: FrameDimensions {
                width: size,
                height: size,
            },
        }
    }

    #[test]
    fn replace_swaps_whole_batch() {
        let store = DetectionStore::new();
        assert!(store.is_empty());

        assert_eq!(store.replace(uniform_batch("a", 3, 10)), 3);
        assert_eq!(store.len(), 3);

        store.replace(uniform_batch("b", 1, 20));
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.detections[0].label, "b");
    }

    #[test]
    fn snapshot_is_unaffected_by_later_replace() {
        let store = DetectionStore::new();
        store.replace(uniform_batch("a", 2, 10));
        let before = store.snapshot();
        store.replace(uniform_batch("b", 5, 20));
        assert_eq!(before.len(), 2);
        assert_eq!(before.timestamp, Value::from("a"));
    }

    #[test]
    fn clear_resets_to_empty() {
        let store = DetectionStore::new();
        store.replace(uniform_batch("a", 2, 10));
        store.clear();
        assert!(store.is_empty());
        assert!(store.detections().is_empty());
    }

    #[test]
    fn concurrent_readers_never_observe_mixed_batches() {
        let store = Arc::new(DetectionStore::new());
        store.replace(uniform_batch("a", 2, 10));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    if i % 2 == 0 {
                        store.replace(uniform_batch("a", 2, 10));
                    } else {
                        store.replace(uniform_batch("b", 7, 20));
                    }
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = store.snapshot();
                        let tag = snap.timestamp.as_str().expect("tag").to_string();
                        let (count, size) = if tag == "a" { (2, 10) } else { (7, 20) };
                        assert_eq!(snap.len(), count);
                        assert_eq!(snap.frame_dimensions.width, size);
                        assert!(snap.detections.iter().all(|d| d.label == tag));
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for reader in readers {
            reader.join().expect("reader");
        }
    }
}
