use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{FrameId, Result, SableError, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameRecord {
    /// History of access timestamps, most recent at the back, capped at k
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameRecord {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn push_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// The timestamp of the k-th most recent access, or None when the frame
    /// has fewer than k accesses (backward k-distance of +inf). The history
    /// is capped at k entries, so the front is that timestamp.
    fn kth_back(&self, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            self.history.front().copied()
        }
    }

    /// First recorded access; for an under-k frame this is the frame's true
    /// first access since nothing has been dropped from the history yet.
    fn first_access(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

struct ReplacerInner {
    records: HashMap<FrameId, FrameRecord>,
    num_evictable: usize,
}

/// LRU-K Replacement Policy
///
/// Evicts the frame whose backward k-distance (time since the k-th most
/// recent access) is the largest. A frame with fewer than k recorded
/// accesses has a backward k-distance of +inf; when several frames are at
/// +inf, the one with the earliest first access goes first, so a burst of
/// once-touched scan pages cannot push out frequently reused ones.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    capacity: usize,
    /// Monotonic logical clock, advanced on every recorded access
    current_timestamp: AtomicU64,
    inner: Mutex<ReplacerInner>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer tracking at most `capacity` frames.
    pub fn new(k: usize, capacity: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            capacity,
            current_timestamp: AtomicU64::new(0),
            inner: Mutex::new(ReplacerInner {
                records: HashMap::new(),
                num_evictable: 0,
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.num_evictable == 0 {
            return None;
        }

        let mut victim: Option<FrameId> = None;
        let mut victim_inf = false;
        let mut victim_ts: Timestamp = Timestamp::MAX;

        for (&frame_id, record) in inner.records.iter() {
            if !record.is_evictable {
                continue;
            }

            // Under-k frames rank by first access, full frames by the k-th
            // most recent access; any under-k frame beats every full one.
            let (is_inf, ts) = match record.kth_back(self.k) {
                None => (true, record.first_access().unwrap_or(Timestamp::MAX)),
                Some(kth) => (false, kth),
            };

            let better = match (victim_inf, is_inf) {
                (true, false) => false,
                (false, true) => true,
                _ => ts < victim_ts,
            };

            if victim.is_none() || better {
                victim = Some(frame_id);
                victim_inf = is_inf;
                victim_ts = ts;
            }
        }

        if let Some(frame_id) = victim {
            inner.records.remove(&frame_id);
            inner.num_evictable -= 1;
        }

        victim
    }

    /// Records that the given frame was accessed, advancing the logical
    /// clock. The record is created on first access.
    pub fn record_access(&self, frame_id: FrameId) -> Result<()> {
        if frame_id.as_usize() >= self.capacity {
            return Err(SableError::InvalidFrameId(frame_id));
        }

        let timestamp = self.current_timestamp.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        inner
            .records
            .entry(frame_id)
            .or_insert_with(FrameRecord::new)
            .push_access(timestamp, self.k);

        Ok(())
    }

    /// Sets whether a frame is evictable. Unknown frames are ignored.
    /// When a frame's pin count drops to 0, it should be marked evictable.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if let Some(record) = inner.records.get_mut(&frame_id) {
            if record.is_evictable != is_evictable {
                record.is_evictable = is_evictable;
                if is_evictable {
                    inner.num_evictable += 1;
                } else {
                    inner.num_evictable -= 1;
                }
            }
        }
    }

    /// Removes a frame from the replacer entirely, e.g. when its page is
    /// deleted from the buffer pool. Removing a tracked but pinned frame is
    /// a contract violation.
    pub fn remove(&self, frame_id: FrameId) -> Result<()> {
        let mut inner = self.inner.lock();

        let is_evictable = match inner.records.get(&frame_id) {
            Some(record) => record.is_evictable,
            None => return Ok(()),
        };
        if !is_evictable {
            return Err(SableError::NotEvictable(frame_id));
        }

        inner.records.remove(&frame_id);
        inner.num_evictable -= 1;
        Ok(())
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_under_k_fifo() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i)).unwrap();
            replacer.set_evictable(FrameId::new(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // All have a single access, so all sit at +inf distance; the one
        // touched first goes first.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_replacer_inf_beats_finite() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has only one access, so its distance is +inf and it loses
        // to frame 0's finite distance.
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_largest_k_distance_wins() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i)).unwrap();
            replacer.record_access(FrameId::new(i)).unwrap();
        }
        for i in 0..3 {
            replacer.set_evictable(FrameId::new(i), true);
        }

        // Frame 0's second access is the oldest k-th-back timestamp.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_lru_k_replacer_record_access_out_of_range() {
        let replacer = LruKReplacer::new(2, 4);
        assert!(matches!(
            replacer.record_access(FrameId::new(4)),
            Err(SableError::InvalidFrameId(_))
        ));
    }

    #[test]
    fn test_lru_k_replacer_set_evictable_unknown_is_noop() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.set_evictable(FrameId::new(3), true);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_remove_pinned_fails() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        assert!(matches!(
            replacer.remove(FrameId::new(0)),
            Err(SableError::NotEvictable(_))
        ));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.remove(FrameId::new(0)).unwrap();
        assert_eq!(replacer.size(), 0);

        // Removing an untracked frame is fine.
        replacer.remove(FrameId::new(7)).unwrap();
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)).unwrap();
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_history_capped_at_k() {
        let replacer = LruKReplacer::new(2, 10);

        for _ in 0..10 {
            replacer.record_access(FrameId::new(0)).unwrap();
        }
        replacer.record_access(FrameId::new(1)).unwrap();
        replacer.record_access(FrameId::new(1)).unwrap();

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Only frame 0's last two accesses count, and both predate frame 1's.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
