//! Capability System
//!
//! Capabilities are unforgeable tokens naming a kernel object and the
//! rights held over it. Each one lives in a fixed-size slot, either in a
//! capability node or in a thread's root slot, and is encoded there with
//! `bincode` so its size does not depend on the object it names.
//!
//! ## Addressing
//!
//! A [`CapAddress`] names a slot absolutely: the owning thread (id plus
//! thread-table bucket) and a bit path from that thread's root slot. Path
//! bits are consumed low bits first, `slot_bits` at a time per node. Depth
//! 0 names the root slot itself.
//!
//! ## Lists
//!
//! Every capability sits in two doubly-linked lists whose links are
//! capability addresses:
//! - the **resource list**: every capability naming the same object; its
//!   head owns the object
//! - the **derivation list**: the capabilities copied from one original or
//!   badged capability (the unit of revocation)
//!
//! ## Slot Layout
//!
//! ```text
//! +--------+----------+-------+--------+-------+---------+-----------------+
//! | object | resource | flags | rights | badge | address | 6 optional links|
//! +--------+----------+-------+--------+-------+---------+-----------------+
//!   fixint bincode, zero padded to CAP_SLOT_SIZE; all zeros = empty slot
//! ```

use core::fmt;

use bincode::Options;
use bitflags::bitflags;
use kaal_heap::HeapAddr;
use serde::{Deserialize, Serialize};

use super::tcb::ThreadId;
use super::{codec, ObjectKind};
use crate::config::{CAP_SLOT_SIZE, MAX_ADDRESS_BITS};
use crate::error::{KernelError, Result};

bitflags! {
    /// Access rights carried by a capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CapRights: u8 {
        /// Observe the object (lock memory, receive messages, read registers)
        const READ = 1 << 0;
        /// Mutate the object (node operations, send, allocate)
        const WRITE = 1 << 1;
        /// Pass capabilities through IPC
        const GRANT = 1 << 2;

        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::GRANT.bits();
    }
}

bitflags! {
    /// Bookkeeping flags of a capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CapFlags: u8 {
        /// The resource is a heap block freed with its last capability
        const HEAP_MANAGED = 1 << 0;
        /// Held in a thread's root slot
        const ROOT = 1 << 1;
        /// Carries a badge stamped by a copy
        const BADGED = 1 << 2;
        /// First capability created for its resource
        const ORIGINAL = 1 << 3;
    }
}

impl Default for CapRights {
    fn default() -> Self {
        CapRights::empty()
    }
}

impl Default for CapFlags {
    fn default() -> Self {
        CapFlags::empty()
    }
}

/// Absolute address of a capability slot
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapAddress {
    pub thread: ThreadId,
    /// Thread-table bucket of `thread`
    pub bucket: u16,
    /// Path bits, low bits consumed first
    pub path: u64,
    /// Number of meaningful path bits
    pub depth: u8,
}

/// Mask of the low `bits` bits
#[inline]
pub(crate) fn low_bits(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl CapAddress {
    pub fn new(thread: ThreadId, path: u64, depth: u8) -> Self {
        Self { thread, bucket: thread.bucket(), path, depth }
    }

    /// The thread's root slot
    pub fn root(thread: ThreadId) -> Self {
        Self::new(thread, 0, 0)
    }

    /// Same slot with path bits above `depth` cleared
    pub fn canonical(self, depth: u8) -> Self {
        Self { path: self.path & low_bits(depth), depth, ..self }
    }

    /// Slot `index` of the node whose capability lives at `self`
    pub fn child(self, index: u64, slot_bits: u8) -> Result<Self> {
        if index > low_bits(slot_bits) {
            return Err(KernelError::InvalidArgument);
        }
        let depth = self
            .depth
            .checked_add(slot_bits)
            .filter(|depth| *depth <= MAX_ADDRESS_BITS)
            .ok_or(KernelError::InvalidArgument)?;
        let bits = index.checked_shl(u32::from(self.depth)).unwrap_or(0);
        Ok(Self { path: self.path | bits, depth, ..self })
    }

    /// Whether `self` is `top` or lies in the subtree below it
    pub fn is_within(&self, top: &CapAddress) -> bool {
        self.thread == top.thread
            && self.bucket == top.bucket
            && self.depth >= top.depth
            && (self.path & low_bits(top.depth)) == top.path
    }

    /// Rename an address in the subtree `from` to the subtree `to`
    pub(crate) fn rebase(&self, from: &CapAddress, to: &CapAddress) -> Result<Self> {
        let below = self.depth - from.depth;
        let depth = to
            .depth
            .checked_add(below)
            .filter(|depth| *depth <= MAX_ADDRESS_BITS)
            .ok_or(KernelError::InvalidArgument)?;
        let suffix = self.path.checked_shr(u32::from(from.depth)).unwrap_or(0);
        let shifted = suffix.checked_shl(u32::from(to.depth)).unwrap_or(0);
        Ok(CapAddress {
            thread: to.thread,
            bucket: to.bucket,
            path: to.path | (shifted & low_bits(depth)),
            depth,
        })
    }
}

impl fmt::Debug for CapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}/{}", self.thread.0, self.path, self.depth)
    }
}

impl fmt::Display for CapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One capability slot
///
/// `object == None` is an empty slot; every other field is then zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Kind of object named (its operation set)
    pub object: Option<ObjectKind>,
    /// Heap handle of the object, or a raw value for non-heap objects
    pub resource: HeapAddr,
    pub flags: CapFlags,
    pub rights: CapRights,
    /// Set once by a badging copy
    pub badge: u64,
    /// Where this capability lives
    pub address: CapAddress,

    pub res_prev: Option<CapAddress>,
    pub res_next: Option<CapAddress>,

    /// Head of the derivation list this capability belongs to
    pub derived_from: Option<CapAddress>,
    /// First capability derived from this one
    pub first_derived: Option<CapAddress>,
    pub deriv_prev: Option<CapAddress>,
    pub deriv_next: Option<CapAddress>,
}

impl Capability {
    /// A fresh original capability with full rights
    pub fn original(
        object: ObjectKind,
        resource: HeapAddr,
        flags: CapFlags,
        address: CapAddress,
    ) -> Self {
        Self {
            object: Some(object),
            resource,
            flags: (flags - CapFlags::BADGED) | CapFlags::ORIGINAL,
            rights: CapRights::ALL,
            address,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.object.is_none()
    }

    #[inline]
    pub fn kind(&self) -> Option<ObjectKind> {
        self.object
    }

    #[inline]
    pub fn is_original(&self) -> bool {
        self.flags.contains(CapFlags::ORIGINAL)
    }

    #[inline]
    pub fn is_badged(&self) -> bool {
        self.flags.contains(CapFlags::BADGED)
    }

    /// Whether copies of this capability start a new derivation list
    #[inline]
    pub fn heads_derivation(&self) -> bool {
        self.flags.intersects(CapFlags::ORIGINAL | CapFlags::BADGED)
    }

    /// Whether this capability owns its resource
    #[inline]
    pub fn owns_resource(&self) -> bool {
        !self.is_empty() && self.res_prev.is_none()
    }

    /// Every link field, for renaming
    pub(crate) fn links(&self) -> [Option<CapAddress>; 6] {
        [
            self.res_prev,
            self.res_next,
            self.derived_from,
            self.first_derived,
            self.deriv_prev,
            self.deriv_next,
        ]
    }

    pub(crate) fn links_mut(&mut self) -> [&mut Option<CapAddress>; 6] {
        [
            &mut self.res_prev,
            &mut self.res_next,
            &mut self.derived_from,
            &mut self.first_derived,
            &mut self.deriv_prev,
            &mut self.deriv_next,
        ]
    }

    /// Encode into a full slot image
    pub fn encode(&self) -> Result<[u8; CAP_SLOT_SIZE]> {
        let mut slot = [0u8; CAP_SLOT_SIZE];
        if self.is_empty() {
            return Ok(slot);
        }
        let bytes = codec().serialize(self)?;
        if bytes.len() > CAP_SLOT_SIZE {
            return Err(KernelError::Corrupted);
        }
        slot[..bytes.len()].copy_from_slice(&bytes);
        Ok(slot)
    }

    pub fn decode(slot: &[u8]) -> Result<Self> {
        if slot.iter().all(|&byte| byte == 0) {
            return Ok(Self::default());
        }
        Ok(codec().deserialize(slot)?)
    }
}
