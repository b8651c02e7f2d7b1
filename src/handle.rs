// SPDX-License-Identifier: Apache-2.0

//! Opaque channel identifiers.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::RpcError;

/// An opaque, non-negative 64-bit id naming a bidirectional transport
/// channel inside one [`crate::rpc::Rpc`] instance.
///
/// Handles are issued by `Bind`/`Connect` and are meaningless outside
/// the instance that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i64);

impl Handle {
    /// Construct a handle from a raw value, rejecting negatives.
    pub fn new(raw: i64) -> Result<Self, RpcError> {
        if raw < 0 {
            return Err(RpcError::InvalidParam(format!(
                "handle must be non-negative, got {raw}"
            )));
        }
        Ok(Handle(raw))
    }

    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Monotonically issues fresh, non-negative handles for one RPC instance.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: AtomicI64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
        }
    }

    pub fn alloc(&self) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        // fetch_add never returns a negative value starting from 0 short
        // of billions of allocations wrapping i64, which is not a
        // realistic runtime condition for a single process.
        Handle(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative() {
        assert!(Handle::new(-1).is_err());
        assert!(Handle::new(0).is_ok());
    }

    #[test]
    fn allocator_is_monotonic() {
        let alloc = HandleAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert!(b.raw() > a.raw());
    }
}
