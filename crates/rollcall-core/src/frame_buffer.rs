//! Single-slot, latest-wins frame hand-off between capture and recognition.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::Arc;

/// A frame as seen by the consumer, tagged with its publish number.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic publish counter, starting at 1. Equal numbers mean the same frame.
    pub generation: u64,
    pub frame: Arc<Frame>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    frame: Option<Arc<Frame>>,
}

/// Holds only the most recent frame.
///
/// `publish` never waits on the consumer: the lock is held just long enough
/// to swap an `Arc`. Frames that were never snapshotted are dropped.
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame unconditionally.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.frame = Some(frame);
        slot.generation
    }

    /// Return the most recent frame without consuming it.
    pub fn take_snapshot(&self) -> Option<Snapshot> {
        let slot = self.slot.lock();
        slot.frame.as_ref().map(|frame| Snapshot {
            generation: slot.generation,
            frame: Arc::clone(frame),
        })
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.slot.lock().generation
    }
}
