//! Identity-bound store: entries live as long as the call object

use super::{Completion, CorrelationStore, StoreStrategy};
use crate::key::allocation_address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deptrack_core::metrics::{self, TrackingMetrics};
use deptrack_core::{OperationHandle, OperationRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

struct Slot<C> {
    /// Pins the allocation, so its address cannot be handed to another call
    /// while this entry exists. Never upgraded.
    call: Weak<C>,
    handle: OperationHandle,
    user_created: bool,
}

impl<C> Slot<C> {
    fn is_alive(&self) -> bool {
        self.call.strong_count() > 0
    }
}

/// Store keyed by the identity of an `Arc<C>` call object.
///
/// Only a weak reference is held, so tracking never extends the life of the
/// call. Entries whose call object was dropped without an end are removed by
/// [`sweep`](Self::sweep), which also runs every `sweep_interval` inserts.
pub struct IdentityBoundStore<C> {
    map: DashMap<u64, Slot<C>>,
    inserts: AtomicUsize,
    sweep_interval: usize,
    metrics: Arc<TrackingMetrics>,
}

impl<C: Send + Sync + 'static> IdentityBoundStore<C> {
    pub fn new(sweep_interval: usize) -> Self {
        Self {
            map: DashMap::new(),
            inserts: AtomicUsize::new(0),
            sweep_interval: sweep_interval.max(1),
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Drop entries whose call object is gone. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, slot| slot.is_alive());
        let swept = before.saturating_sub(self.map.len());
        if swept > 0 {
            self.metrics
                .store
                .swept
                .fetch_add(swept as u64, Ordering::Relaxed);
            debug!("Swept {} records of dropped calls", swept);
        }
        swept
    }

    /// Release the entry for `call` early, e.g. when its owner disposes it.
    /// Returns whether an entry existed.
    pub fn invalidate(&self, call: &Arc<C>) -> bool {
        let removed = self.map.remove(&allocation_address(call)).is_some();
        if removed {
            metrics::incr(&self.metrics.store.swept);
        }
        removed
    }
}

impl<C: Send + Sync + 'static> CorrelationStore for IdentityBoundStore<C> {
    type Key = Arc<C>;

    fn try_begin<F>(&self, call: &Arc<C>, factory: F) -> (OperationHandle, bool)
    where
        F: FnOnce() -> OperationRecord,
    {
        match self.map.entry(allocation_address(call)) {
            // `call` keeps the allocation alive, so an existing entry at its
            // address belongs to this very object
            Entry::Occupied(occupied) => (occupied.get().handle.clone(), false),
            Entry::Vacant(vacant) => {
                let record = factory();
                let user_created = record.is_user_created;
                let handle = record.into_handle();
                vacant.insert(Slot {
                    call: Arc::downgrade(call),
                    handle: handle.clone(),
                    user_created,
                });
                let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
                if inserts % self.sweep_interval == 0 {
                    // The shard guard was consumed by insert; retain locks every shard
                    self.sweep();
                }
                (handle, true)
            }
        }
    }

    fn complete(&self, call: &Arc<C>) -> Completion {
        let key = allocation_address(call);
        match self.map.remove_if(&key, |_, slot| !slot.user_created) {
            Some((_, slot)) => Completion::Completed(slot.handle),
            None if self.map.contains_key(&key) => Completion::UserOwned,
            None => Completion::NotFound,
        }
    }

    fn complete_user_created(&self, call: &Arc<C>) -> Option<OperationHandle> {
        self.map
            .remove_if(&allocation_address(call), |_, slot| slot.user_created)
            .map(|(_, slot)| slot.handle)
    }

    fn remove(&self, call: &Arc<C>) -> Option<OperationHandle> {
        self.map
            .remove(&allocation_address(call))
            .map(|(_, slot)| slot.handle)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::IdentityBound
    }

    fn key_label(&self, call: &Arc<C>) -> u64 {
        allocation_address(call)
    }
}
