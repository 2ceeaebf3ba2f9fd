//! Correlation stores
//!
//! A store maps an identity key to the open record for that call and
//! guarantees exactly-once semantics: one insert per open key, one removal
//! per insert. Two strategies exist:
//!
//! - [`CapacityBoundStore`]: synthetic `u64` keys, bounded entry count and
//!   optional byte budget, oldest-inserted entries evicted first
//! - [`IdentityBoundStore`]: keyed by the call object's allocation, entries
//!   dropped once the call object is gone
//!
//! Trackers are generic over [`CorrelationStore`] and pick one strategy at
//! construction.

mod capacity;
mod identity;

pub use capacity::CapacityBoundStore;
pub use identity::IdentityBoundStore;

use deptrack_core::{OperationHandle, OperationRecord};
use std::fmt;

/// Backing strategy of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStrategy {
    CapacityBound,
    IdentityBound,
}

impl fmt::Display for StoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreStrategy::CapacityBound => write!(f, "capacity-bound"),
            StoreStrategy::IdentityBound => write!(f, "identity-bound"),
        }
    }
}

/// Result of completing a key
#[derive(Debug)]
pub enum Completion {
    /// The record was removed and now belongs to the caller
    Completed(OperationHandle),
    /// The record was created by application code and was left in place
    UserOwned,
    /// No open record for the key
    NotFound,
}

impl Completion {
    pub fn is_completed(&self) -> bool {
        matches!(self, Completion::Completed(_))
    }
}

/// Concurrent key to record map with exactly-once insert and remove
pub trait CorrelationStore: Send + Sync {
    /// Identity key type
    type Key;

    /// Return the open record for `key`, inserting `factory()` if there is
    /// none. The flag is `true` only for the call that inserted.
    ///
    /// `factory` runs at most once and while the key's shard is locked, so it
    /// must not touch the store.
    fn try_begin<F>(&self, key: &Self::Key, factory: F) -> (OperationHandle, bool)
    where
        F: FnOnce() -> OperationRecord;

    /// Atomically remove and return the open record for `key`.
    ///
    /// User-created records stay in place and yield [`Completion::UserOwned`].
    fn complete(&self, key: &Self::Key) -> Completion;

    /// Atomically remove the record for `key` only if application code
    /// created it. Instrumentation records are left in place.
    fn complete_user_created(&self, key: &Self::Key) -> Option<OperationHandle>;

    /// Unconditionally remove `key`
    fn remove(&self, key: &Self::Key) -> Option<OperationHandle>;

    /// Number of open records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn strategy(&self) -> StoreStrategy;

    /// Numeric label of a key, for logs
    fn key_label(&self, key: &Self::Key) -> u64;
}
