use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Sliding window over the most recent microphone samples
///
/// The device callback writes into it and the level meter reads a snapshot;
/// once full, every write evicts the oldest samples.
pub struct AnalysisWindow {
    buffer: Arc<Mutex<HeapRb<f32>>>,
}

impl AnalysisWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    pub fn write(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        for &sample in samples {
            buffer.push_overwrite(sample);
        }
    }

    /// Copy of the window, oldest first, zero-padded at the front to capacity
    pub fn snapshot(&self) -> Vec<f32> {
        let buffer = self.buffer.lock();
        let capacity = buffer.capacity().get();
        let occupied = buffer.occupied_len();

        let mut samples = vec![0.0; capacity - occupied];
        samples.extend(buffer.iter().copied());
        samples
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}

impl Clone for AnalysisWindow {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_pads_front() {
        let window = AnalysisWindow::new(8);
        window.write(&[1.0, 2.0, 3.0]);

        assert_eq!(window.len(), 3);
        assert_eq!(
            window.snapshot(),
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_overflow_keeps_latest() {
        let window = AnalysisWindow::new(4);
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        window.write(&data);

        assert_eq!(window.len(), 4);
        assert_eq!(window.snapshot(), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_clear_is_shared_between_clones() {
        let window = AnalysisWindow::new(4);
        let reader = window.clone();
        window.write(&[0.5; 4]);
        assert_eq!(reader.len(), 4);

        reader.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 4);
    }
}
