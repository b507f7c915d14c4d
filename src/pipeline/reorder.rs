//! Byte-budgeted reorder cache for converted frames

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::Frame;

/// Gap markers kept before the lowest ids are forgotten. A fetch of a
/// forgotten id reports a miss instead of its gap reason.
pub const MAX_GAP_MARKERS: usize = 1024;

/// What to do when an insert would push resident bytes past the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the lowest resident ids until the new frame fits
    #[default]
    DropOldest,
    /// Refuse the incoming frame
    Reject,
}

/// Why an id that was handed out has no frame behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    /// Conversion failed after the id was assigned
    Dropped,
    /// Evicted to make room under `DropOldest`
    Evicted,
    /// Refused by the budget under `Reject`
    Rejected,
}

/// Result of removing an id from the cache.
#[derive(Debug, Clone)]
pub enum Lookup {
    Ready(Arc<Frame>),
    Gap(GapReason),
    Missing,
}

/// Frame-id indexed store whose resident bytes never exceed `max_bytes`.
///
/// All inserts and removals go through one critical section shared by the
/// conversion tasks and the consumers.
pub struct ReorderCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    policy: OverflowPolicy,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Inner {
    frames: BTreeMap<u64, Arc<Frame>>,
    gaps: BTreeMap<u64, GapReason>,
    resident_bytes: usize,
}

impl Inner {
    fn record_gap(&mut self, id: u64, reason: GapReason) {
        self.gaps.insert(id, reason);
        while self.gaps.len() > MAX_GAP_MARKERS {
            self.gaps.pop_first();
        }
    }
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_evicted: AtomicUsize,
    frames_rejected: AtomicUsize,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub frames_written: usize,
    pub frames_read: usize,
    pub frames_evicted: usize,
    pub frames_rejected: usize,
    pub resident_frames: usize,
    pub resident_bytes: usize,
    pub gap_markers: usize,
}

impl ReorderCache {
    pub fn new(max_bytes: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: BTreeMap::new(),
                gaps: BTreeMap::new(),
                resident_bytes: 0,
            }),
            max_bytes,
            policy,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Insert a converted frame. Returns the ids evicted to make room.
    ///
    /// A refused frame leaves a [`GapReason::Rejected`] marker behind so the
    /// consumer of that id gets an empty result instead of a miss.
    pub fn insert(&self, frame: Arc<Frame>) -> Result<Vec<u64>, CacheError> {
        let id = frame.id();
        let bytes = frame.byte_size();
        let mut inner = self.inner.lock();

        if bytes > self.max_bytes {
            inner.record_gap(id, GapReason::Rejected);
            self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::TooLarge {
                id,
                bytes,
                max: self.max_bytes,
            });
        }

        if let Some(old) = inner.frames.remove(&id) {
            warn!("Frame {} inserted twice, replacing", id);
            inner.resident_bytes -= old.byte_size();
        }

        let mut evicted = Vec::new();
        if inner.resident_bytes + bytes > self.max_bytes {
            match self.policy {
                OverflowPolicy::Reject => {
                    let resident = inner.resident_bytes;
                    inner.record_gap(id, GapReason::Rejected);
                    self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(CacheError::OverBudget {
                        id,
                        bytes,
                        resident,
                        max: self.max_bytes,
                    });
                }
                OverflowPolicy::DropOldest => {
                    while inner.resident_bytes + bytes > self.max_bytes {
                        let Some((old_id, old)) = inner.frames.pop_first() else {
                            break;
                        };
                        inner.resident_bytes -= old.byte_size();
                        inner.record_gap(old_id, GapReason::Evicted);
                        evicted.push(old_id);
                    }
                    self.stats
                        .frames_evicted
                        .fetch_add(evicted.len(), Ordering::Relaxed);
                    metrics::counter!("cache_evicted_frames").increment(evicted.len() as u64);
                    debug!("Evicted {} frame(s) to fit frame {}", evicted.len(), id);
                }
            }
        }

        inner.resident_bytes += bytes;
        inner.gaps.remove(&id);
        inner.frames.insert(id, frame);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(evicted)
    }

    /// Record that `id` will never arrive.
    pub fn mark_gap(&self, id: u64, reason: GapReason) {
        let mut inner = self.inner.lock();
        if !inner.frames.contains_key(&id) {
            inner.record_gap(id, reason);
        }
    }

    pub fn exists(&self, id: u64) -> bool {
        self.inner.lock().frames.contains_key(&id)
    }

    /// Retrieve and remove `id` in one step, so it is handed out once.
    pub fn take(&self, id: u64) -> Lookup {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.remove(&id) {
            inner.resident_bytes -= frame.byte_size();
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            return Lookup::Ready(frame);
        }
        match inner.gaps.remove(&id) {
            Some(reason) => Lookup::Gap(reason),
            None => Lookup::Missing,
        }
    }

    /// Remove `id` without handing it out. Returns true if a frame was resident.
    pub fn remove(&self, id: u64) -> bool {
        matches!(self.take(id), Lookup::Ready(_))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let (resident_frames, resident_bytes, gap_markers) = {
            let inner = self.inner.lock();
            (inner.frames.len(), inner.resident_bytes, inner.gaps.len())
        };
        CacheStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
            resident_frames,
            resident_bytes,
            gap_markers,
        }
    }

    /// Diagnostic dump of resident ids and gaps.
    pub fn describe(&self) -> String {
        let inner = self.inner.lock();
        let mut out = format!(
            "{} frame(s), {}/{} bytes, ids [",
            inner.frames.len(),
            inner.resident_bytes,
            self.max_bytes
        );
        for (i, id) in inner.frames.keys().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", id);
        }
        out.push_str("], gaps [");
        for (i, (id, reason)) in inner.gaps.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}:{:?}", id, reason);
        }
        out.push(']');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{AudioBlock, FrameMetadata, PixelFormat};
    use bytes::Bytes;

    fn frame(id: u64, bytes: usize) -> Arc<Frame> {
        let meta = FrameMetadata {
            sequence: id,
            width: 1,
            height: 1,
            stride: 4,
            format: PixelFormat::Argb,
            device_timestamp: None,
        };
        Arc::new(Frame::new(meta, Bytes::from(vec![0u8; bytes]), AudioBlock::placeholder()))
    }

    #[test]
    fn take_hands_out_each_id_once() {
        let cache = ReorderCache::new(1024, OverflowPolicy::DropOldest);
        cache.insert(frame(0, 10)).unwrap();
        cache.insert(frame(1, 10)).unwrap();
        assert!(cache.exists(1));

        assert!(matches!(cache.take(1), Lookup::Ready(f) if f.id() == 1));
        assert!(matches!(cache.take(1), Lookup::Missing));
        assert_eq!(cache.resident_bytes(), 10);
    }

    #[test]
    fn drop_oldest_keeps_budget() {
        let cache = ReorderCache::new(30, OverflowPolicy::DropOldest);
        for id in 0..3 {
            assert!(cache.insert(frame(id, 10)).unwrap().is_empty());
        }

        let evicted = cache.insert(frame(3, 15)).unwrap();
        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(cache.resident_bytes(), 25);
        assert!(matches!(cache.take(0), Lookup::Gap(GapReason::Evicted)));
        assert!(matches!(cache.take(3), Lookup::Ready(_)));
        assert_eq!(cache.stats().frames_evicted, 2);
    }

    #[test]
    fn reject_refuses_and_leaves_gap() {
        let cache = ReorderCache::new(20, OverflowPolicy::Reject);
        cache.insert(frame(0, 15)).unwrap();

        let err = cache.insert(frame(1, 10)).unwrap_err();
        assert_eq!(
            err,
            CacheError::OverBudget {
                id: 1,
                bytes: 10,
                resident: 15,
                max: 20
            }
        );
        assert_eq!(cache.resident_bytes(), 15);
        assert!(matches!(cache.take(1), Lookup::Gap(GapReason::Rejected)));
        assert!(matches!(cache.take(0), Lookup::Ready(_)));
    }

    #[test]
    fn oversized_frame_is_always_refused() {
        let cache = ReorderCache::new(8, OverflowPolicy::DropOldest);
        cache.insert(frame(0, 4)).unwrap();
        assert!(matches!(
            cache.insert(frame(1, 9)),
            Err(CacheError::TooLarge { id: 1, .. })
        ));
        // Nothing was evicted for a frame that could never fit
        assert!(cache.exists(0));
    }

    #[test]
    fn mark_gap_does_not_shadow_resident_frame() {
        let cache = ReorderCache::new(64, OverflowPolicy::DropOldest);
        cache.insert(frame(5, 4)).unwrap();
        cache.mark_gap(5, GapReason::Dropped);
        cache.mark_gap(6, GapReason::Dropped);

        assert!(matches!(cache.take(5), Lookup::Ready(_)));
        assert!(matches!(cache.take(6), Lookup::Gap(GapReason::Dropped)));
    }

    #[test]
    fn gap_markers_stay_bounded_under_churn() {
        let cache = ReorderCache::new(20, OverflowPolicy::DropOldest);
        for id in 0..10_000 {
            cache.insert(frame(id, 10)).unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.resident_frames, 2);
        assert_eq!(stats.frames_evicted, 9_998);
        assert_eq!(stats.gap_markers, MAX_GAP_MARKERS);
        // Recent evictions keep their reason, the oldest are forgotten
        assert!(matches!(cache.take(9_997), Lookup::Gap(GapReason::Evicted)));
        assert!(matches!(cache.take(0), Lookup::Missing));
    }

    #[test]
    fn rejected_gaps_are_bounded_too() {
        let cache = ReorderCache::new(10, OverflowPolicy::Reject);
        cache.insert(frame(0, 10)).unwrap();
        for id in 1..5_000 {
            assert!(cache.insert(frame(id, 10)).is_err());
        }
        assert_eq!(cache.stats().gap_markers, MAX_GAP_MARKERS);
        assert!(cache.describe().len() < 32 * MAX_GAP_MARKERS);
    }

    #[test]
    fn describe_lists_ids_and_gaps() {
        let cache = ReorderCache::new(64, OverflowPolicy::DropOldest);
        cache.insert(frame(2, 4)).unwrap();
        cache.insert(frame(4, 4)).unwrap();
        cache.mark_gap(3, GapReason::Dropped);

        let text = cache.describe();
        assert!(text.contains("ids [2, 4]"), "{text}");
        assert!(text.contains("3:Dropped"), "{text}");
    }
}
