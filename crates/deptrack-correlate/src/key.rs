//! Identity keys
//!
//! Capacity-bound stores are keyed by a synthetic 64-bit value derived from
//! the call object. Each protocol adds its own offset so an HTTP request and
//! a SQL command that hash alike still land on different keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Protocol a tracker instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Sql,
}

impl Protocol {
    /// Fixed offset mixed into synthetic keys
    pub const fn key_offset(self) -> u64 {
        match self {
            Protocol::Http => 0x4854_5450_0000_0000,
            Protocol::Sql => 0x5351_4c00_0000_0000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Sql => "sql",
        }
    }
}

/// Synthetic key for a hashable call object
pub fn synthetic_key<T: Hash + ?Sized>(call: &T, protocol: Protocol) -> u64 {
    let mut hasher = DefaultHasher::new();
    call.hash(&mut hasher);
    hasher.finish().wrapping_add(protocol.key_offset())
}

/// Synthetic key for a shared call object, derived from its allocation
pub fn address_key<T: ?Sized>(call: &Arc<T>, protocol: Protocol) -> u64 {
    allocation_address(call).wrapping_add(protocol.key_offset())
}

/// Address of the allocation behind an `Arc`
pub fn allocation_address<T: ?Sized>(call: &Arc<T>) -> u64 {
    Arc::as_ptr(call) as *const () as usize as u64
}
