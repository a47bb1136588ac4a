use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU page replacement policy.
///
/// Tracks the frames that are currently unpinned, in the order they became
/// unpinned. `LinkedHashMap` gives O(1) insert, O(1) remove-by-id, and O(1)
/// removal at the LRU end: the front of the map is the least-recently
/// unpinned frame, new entries join at the back.
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

struct LruInner {
    capacity: usize,
    frames: LinkedHashMap<FrameId, ()>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                capacity,
                frames: LinkedHashMap::with_capacity(capacity),
            }),
        }
    }

    /// Remove and return the least-recently-unpinned frame, if any
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        inner.frames.pop_front().map(|(frame_id, _)| frame_id)
    }

    /// The frame is in use again; stop tracking it
    pub fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames.remove(&frame_id);
    }

    /// The frame's pin count dropped to zero; start tracking it as the most
    /// recently unpinned. A frame that is already tracked keeps its position.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.frames.contains_key(&frame_id) {
            return;
        }
        if inner.frames.len() == inner.capacity {
            inner.frames.pop_front();
        }
        inner.frames.insert(frame_id, ());
    }

    /// Number of frames currently tracked
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
