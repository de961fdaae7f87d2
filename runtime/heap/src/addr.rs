//! Heap addresses
//!
//! A [`HeapAddr`] is a byte offset into the heap arena. Handles returned by
//! [`Heap::alloc`](crate::Heap::alloc) are payload addresses, i.e. the offset
//! of the first usable byte after a block header. Offset zero is always a
//! block header, so [`HeapAddr::NULL`] never names a payload.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Byte offset into the heap arena
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeapAddr(u64);

impl HeapAddr {
    /// The null address (never a valid handle)
    pub const NULL: HeapAddr = HeapAddr(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Arena index, saturating for addresses that cannot be indexed
    #[inline]
    pub(crate) fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl fmt::Debug for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapAddr({:#x})", self.0)
    }
}

impl fmt::Display for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<HeapAddr> for u64 {
    fn from(addr: HeapAddr) -> u64 {
        addr.0
    }
}
