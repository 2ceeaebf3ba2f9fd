//! Capacity-bound store: synthetic keys, bounded size, FIFO eviction

use super::{Completion, CorrelationStore, StoreStrategy};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deptrack_core::metrics::{self, TrackingMetrics};
use deptrack_core::{OperationHandle, OperationRecord};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Queue length below which stale insertion-order entries are not compacted
const MIN_COMPACT_LEN: usize = 1024;

struct Slot {
    handle: OperationHandle,
    /// Insertion sequence, matches the order queue entry
    seq: u64,
    size: usize,
    user_created: bool,
}

/// Store keyed by synthetic `u64` keys with a hard entry cap.
///
/// When full, the oldest-inserted open record is evicted silently; a later
/// `complete` for it reports [`Completion::NotFound`].
pub struct CapacityBoundStore {
    map: DashMap<u64, Slot>,
    /// Insertion order as `(key, seq)`. Entries whose key was completed in the
    /// meantime are stale and skipped on eviction.
    order: Mutex<VecDeque<(u64, u64)>>,
    next_seq: AtomicU64,
    bytes: AtomicUsize,
    max_entries: usize,
    max_bytes: Option<usize>,
    metrics: Arc<TrackingMetrics>,
}

impl CapacityBoundStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            bytes: AtomicUsize::new(0),
            max_entries: max_entries.max(1),
            max_bytes: None,
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    /// Also evict while the estimated size of open records exceeds `max_bytes`
    pub fn with_max_bytes(mut self, max_bytes: Option<usize>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Estimated bytes held by open records
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn over_budget(&self) -> bool {
        if self.map.len() > self.max_entries {
            return true;
        }
        match self.max_bytes {
            // Always keep the newest record, however large
            Some(max) => self.map.len() > 1 && self.bytes() > max,
            None => false,
        }
    }

    fn enforce_bounds(&self) {
        let mut order = self.order.lock();

        while self.over_budget() {
            let Some((key, seq)) = order.pop_front() else {
                break;
            };
            if let Some((_, slot)) = self.map.remove_if(&key, |_, slot| slot.seq == seq) {
                self.bytes.fetch_sub(slot.size, Ordering::Relaxed);
                metrics::incr(&self.metrics.store.evicted);
                debug!("Evicted open record for key {:#x}", key);
            }
        }

        if order.len() > MIN_COMPACT_LEN.max(self.map.len() * 2) {
            let before = order.len();
            order.retain(|(key, seq)| self.map.get(key).is_some_and(|slot| slot.seq == *seq));
            trace!("Compacted insertion order {} -> {}", before, order.len());
        }
    }
}

impl CorrelationStore for CapacityBoundStore {
    type Key = u64;

    fn try_begin<F>(&self, key: &u64, factory: F) -> (OperationHandle, bool)
    where
        F: FnOnce() -> OperationRecord,
    {
        // The shard lock is released before the order queue is touched;
        // enforce_bounds takes them the other way round.
        let (handle, seq) = match self.map.entry(*key) {
            Entry::Occupied(occupied) => return (occupied.get().handle.clone(), false),
            Entry::Vacant(vacant) => {
                let record = factory();
                let size = record.estimated_size();
                let user_created = record.is_user_created;
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let handle = record.into_handle();
                vacant.insert(Slot {
                    handle: handle.clone(),
                    seq,
                    size,
                    user_created,
                });
                self.bytes.fetch_add(size, Ordering::Relaxed);
                (handle, seq)
            }
        };

        self.order.lock().push_back((*key, seq));
        self.enforce_bounds();
        (handle, true)
    }

    fn complete(&self, key: &u64) -> Completion {
        match self.map.remove_if(key, |_, slot| !slot.user_created) {
            Some((_, slot)) => {
                self.bytes.fetch_sub(slot.size, Ordering::Relaxed);
                Completion::Completed(slot.handle)
            }
            None if self.map.contains_key(key) => Completion::UserOwned,
            None => Completion::NotFound,
        }
    }

    fn complete_user_created(&self, key: &u64) -> Option<OperationHandle> {
        let (_, slot) = self.map.remove_if(key, |_, slot| slot.user_created)?;
        self.bytes.fetch_sub(slot.size, Ordering::Relaxed);
        Some(slot.handle)
    }

    fn remove(&self, key: &u64) -> Option<OperationHandle> {
        let (_, slot) = self.map.remove(key)?;
        self.bytes.fetch_sub(slot.size, Ordering::Relaxed);
        Some(slot.handle)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::CapacityBound
    }

    fn key_label(&self, key: &u64) -> u64 {
        *key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deptrack_core::DependencyKind;
    use std::thread;

    fn record() -> OperationRecord {
        OperationRecord::new(DependencyKind::Http, None)
    }

    #[test]
    fn test_begin_inserts_once() {
        let store = CapacityBoundStore::new(16);
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::Relaxed);
            record()
        };

        let (first, inserted) = store.try_begin(&7, factory);
        assert!(inserted);
        let (second, inserted) = store.try_begin(&7, || {
            calls.fetch_add(1, Ordering::Relaxed);
            record()
        });
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_complete_removes_exactly_once() {
        let store = CapacityBoundStore::new(16);
        store.try_begin(&1, record);

        assert!(store.complete(&1).is_completed());
        assert!(matches!(store.complete(&1), Completion::NotFound));
        assert!(store.is_empty());
        assert_eq!(store.bytes(), 0);
    }

    #[test]
    fn test_user_created_left_in_place() {
        let store = CapacityBoundStore::new(16);
        store.try_begin(&3, || record().user_created());

        assert!(matches!(store.complete(&3), Completion::UserOwned));
        assert_eq!(store.len(), 1);
        assert!(store.remove(&3).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_complete_user_created_only() {
        let store = CapacityBoundStore::new(16);
        store.try_begin(&1, record);
        store.try_begin(&2, || record().user_created());

        assert!(store.complete_user_created(&1).is_none());
        assert_eq!(store.len(), 2);
        assert!(store.complete_user_created(&2).is_some());
        assert!(store.complete_user_created(&2).is_none());
        assert!(store.complete(&1).is_completed());
        assert_eq!(store.bytes(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let metrics = Arc::new(TrackingMetrics::new());
        let store = CapacityBoundStore::new(4).with_metrics(metrics.clone());
        for key in 0..5u64 {
            store.try_begin(&key, record);
        }

        assert_eq!(store.len(), 4);
        assert!(matches!(store.complete(&0), Completion::NotFound));
        for key in 1..5u64 {
            assert!(store.complete(&key).is_completed(), "key {} missing", key);
        }
        assert_eq!(metrics.store.evicted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_eviction_skips_completed_keys() {
        let store = CapacityBoundStore::new(2);
        store.try_begin(&1, record);
        store.try_begin(&2, record);
        assert!(store.complete(&1).is_completed());
        store.try_begin(&3, record);
        store.try_begin(&4, record);

        // 2 is now the oldest open key
        assert!(matches!(store.complete(&2), Completion::NotFound));
        assert!(store.complete(&3).is_completed());
        assert!(store.complete(&4).is_completed());
    }

    #[test]
    fn test_byte_budget() {
        let one = record().estimated_size();
        let store = CapacityBoundStore::new(100).with_max_bytes(Some(one * 2));
        for key in 0..3u64 {
            store.try_begin(&key, record);
        }
        assert_eq!(store.len(), 2);
        assert!(matches!(store.complete(&0), Completion::NotFound));
        assert!(store.bytes() <= one * 2);
    }

    #[test]
    fn test_order_queue_compacts() {
        let store = CapacityBoundStore::new(8);
        for key in 0..(MIN_COMPACT_LEN as u64 * 3) {
            store.try_begin(&key, record);
            store.complete(&key);
        }
        assert!(store.order.lock().len() <= MIN_COMPACT_LEN + 1);
    }

    #[test]
    fn test_concurrent_same_key_single_insert() {
        let store = Arc::new(CapacityBoundStore::new(16));
        let inserted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let inserted = inserted.clone();
                thread::spawn(move || {
                    if store.try_begin(&99, record).1 {
                        inserted.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(inserted.load(Ordering::Relaxed), 1);
        assert_eq!(store.len(), 1);
    }
}
