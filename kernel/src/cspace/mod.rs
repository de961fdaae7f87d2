//! Capability space: lookup and the capability operations
//!
//! A thread's capability space is the tree rooted at its root slot. An
//! address is resolved by walking from the thread table to the thread
//! object's root slot, then consuming `slot_bits` of the path at each node.
//!
//! Resolution never allocates, so the walk reads node objects in place and
//! only the container of the final slot is pinned (see [`LookedUp`]). Every
//! other operation in this module re-resolves by address, so nothing holds a
//! heap address across a relocating allocation.

mod links;
mod ops;

use kaal_heap::HeapAddr;
use log::{debug, trace};

use crate::config::{CAP_SLOT_SIZE, DEPTH_ANY, MAX_ADDRESS_BITS};
use crate::context::Core;
use crate::error::{KernelError, Result};
use crate::objects::capability::low_bits;
use crate::objects::{
    CapAddress, Capability, KernelHeap, NodeHeader, ObjectKind, Tcb, ThreadTable,
};

/// A resolved slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// Heap address of the slot
    pub slot: HeapAddr,
    /// Canonical address of the slot (exact depth, masked path)
    pub address: CapAddress,
    /// Object holding the slot: a node, or the thread object for a root slot
    pub container: HeapAddr,
    /// Nesting depth of the container node; `None` for a thread root slot
    pub nesting: Option<u8>,
}

/// A resolved slot whose container is pinned
///
/// Must be handed back to [`Core::unlock_looked_up`] exactly once; the type
/// is neither `Clone` nor `Copy`, so the pin cannot be released twice.
#[must_use = "release the pin with Core::unlock_looked_up"]
#[derive(Debug, PartialEq, Eq)]
pub struct LookedUp {
    pub located: Located,
    pinned_here: bool,
}

impl LookedUp {
    #[inline]
    pub fn slot(&self) -> HeapAddr {
        self.located.slot
    }

    #[inline]
    pub fn address(&self) -> CapAddress {
        self.located.address
    }
}

/// Decode the depth word of the syscall ABI
///
/// `u64::MAX` and `255` select [`DEPTH_ANY`].
pub fn parse_depth(word: u64) -> Result<u8> {
    match word {
        u64::MAX => Ok(DEPTH_ANY),
        w if w == u64::from(DEPTH_ANY) => Ok(DEPTH_ANY),
        w if w <= u64::from(MAX_ADDRESS_BITS) => Ok(w as u8),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub(crate) fn read_slot(heap: &KernelHeap, slot: HeapAddr) -> Result<Capability> {
    Capability::decode(heap.read(slot, CAP_SLOT_SIZE)?)
}

/// Resolve `addr` without pinning anything
///
/// An exact depth returns the slot at that depth, descending only through
/// node capabilities. [`DEPTH_ANY`] stops at the first slot that does not
/// hold a node (or when the path bits run out).
pub(crate) fn locate(heap: &KernelHeap, threads: &ThreadTable, addr: &CapAddress) -> Result<Located> {
    let object = threads.lookup(addr.thread, addr.bucket).ok_or(KernelError::NoCapability)?;
    let mut here = Located {
        slot: Tcb::root_slot(object),
        address: CapAddress::root(addr.thread),
        container: object,
        nesting: None,
    };

    let mut consumed = 0u8;
    loop {
        if addr.depth != DEPTH_ANY && consumed == addr.depth {
            return Ok(here);
        }

        let cap = read_slot(heap, here.slot)?;
        if cap.kind() != Some(ObjectKind::Node) {
            if addr.depth == DEPTH_ANY {
                return Ok(here);
            }
            trace!("cspace: {} stops at {} (no node)", addr, here.address);
            return Err(KernelError::NoCapability);
        }

        let header = NodeHeader::read(heap, cap.resource)?;
        let next = consumed + header.slot_bits;
        let limit = if addr.depth == DEPTH_ANY { MAX_ADDRESS_BITS } else { addr.depth };
        if next > limit {
            if addr.depth == DEPTH_ANY {
                return Ok(here);
            }
            return Err(KernelError::NoCapability);
        }

        let index = (addr.path >> consumed) & low_bits(header.slot_bits);
        here = Located {
            slot: header.slot(cap.resource, index),
            address: here.address.child(index, header.slot_bits)?,
            container: cap.resource,
            nesting: Some(header.nesting),
        };
        consumed = next;
    }
}

impl Core {
    /// Resolve `addr` without pinning
    pub fn locate(&self, addr: &CapAddress) -> Result<Located> {
        locate(&self.heap, &self.threads, addr)
    }

    /// Resolve `addr` and pin the container of the slot
    pub fn lookup(&mut self, addr: &CapAddress) -> Result<LookedUp> {
        let located = self.locate(addr)?;
        let was_pinned = self.heap.pin(located.container)?;
        trace!("cspace: lookup {} -> {} in {}", addr, located.slot, located.container);
        Ok(LookedUp { located, pinned_here: !was_pinned })
    }

    /// Release the pin taken by [`lookup`](Self::lookup)
    ///
    /// The container may have been destroyed by the operation that used the
    /// slot (a thread deleting its own capability space); that is not an
    /// error.
    pub fn unlock_looked_up(&mut self, looked: LookedUp) {
        if !looked.pinned_here {
            return;
        }
        if let Err(err) = self.heap.unpin(looked.located.container) {
            debug!("cspace: container {} gone before unlock: {}", looked.located.container, err);
        }
    }

    /// Run `f` on the slot at `addr` with its container pinned
    pub fn with_slot<R>(
        &mut self,
        addr: &CapAddress,
        f: impl FnOnce(&mut Core, &Located) -> Result<R>,
    ) -> Result<R> {
        let looked = self.lookup(addr)?;
        let result = f(self, &looked.located);
        self.unlock_looked_up(looked);
        result
    }

    pub fn read_cap(&self, slot: HeapAddr) -> Result<Capability> {
        read_slot(&self.heap, slot)
    }

    pub fn write_cap(&mut self, slot: HeapAddr, cap: &Capability) -> Result<()> {
        self.heap.write(slot, &cap.encode()?)?;
        Ok(())
    }

    /// Capability at `addr` (possibly empty)
    pub fn capability(&self, addr: &CapAddress) -> Result<Capability> {
        let located = self.locate(addr)?;
        self.read_cap(located.slot)
    }

    /// Read-modify-write the capability at `addr`
    pub(crate) fn update_cap(
        &mut self,
        addr: &CapAddress,
        f: impl FnOnce(&mut Capability),
    ) -> Result<()> {
        let located = self.locate(addr)?;
        let mut cap = self.read_cap(located.slot)?;
        f(&mut cap);
        self.write_cap(located.slot, &cap)
    }

    pub(crate) fn clear_slot(&mut self, addr: &CapAddress) -> Result<()> {
        let located = self.locate(addr)?;
        self.heap.zero(located.slot, CAP_SLOT_SIZE)?;
        Ok(())
    }
}
