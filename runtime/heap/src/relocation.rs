//! Relocation Targets
//!
//! When an allocation moves a relocatable block, the block's single
//! registered target is told about it:
//!
//! - [`RelocationTarget::Absolute`]: an 8-byte little-endian slot in the
//!   arena that holds the block's address. The heap rewrites it.
//! - [`RelocationTarget::Callback`]: an arbitrary closure.
//! - [`RelocationTarget::Capability`]: an owner of type `C` (a capability
//!   address in the kernel). The heap hands it to the caller's
//!   [`Relocator`], which may itself read and write the heap.

use core::fmt;
use std::sync::Arc;

use log::error;

use crate::{Heap, HeapAddr, HeapError, Result};

/// Closure invoked with `(old, new)` when a block moves
pub type RelocationCallback = Arc<dyn Fn(HeapAddr, HeapAddr) + Send + Sync>;

/// What to update when a block moves
#[derive(Clone)]
pub enum RelocationTarget<C> {
    None,
    Absolute(HeapAddr),
    Callback(RelocationCallback),
    Capability(C),
}

impl<C> Default for RelocationTarget<C> {
    fn default() -> Self {
        RelocationTarget::None
    }
}

impl<C: fmt::Debug> fmt::Debug for RelocationTarget<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationTarget::None => f.write_str("None"),
            RelocationTarget::Absolute(slot) => f.debug_tuple("Absolute").field(slot).finish(),
            RelocationTarget::Callback(_) => f.write_str("Callback(..)"),
            RelocationTarget::Capability(owner) => {
                f.debug_tuple("Capability").field(owner).finish()
            }
        }
    }
}

/// Callbacks compare by identity
impl<C: PartialEq> PartialEq for RelocationTarget<C> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RelocationTarget::None, RelocationTarget::None) => true,
            (RelocationTarget::Absolute(a), RelocationTarget::Absolute(b)) => a == b,
            (RelocationTarget::Callback(a), RelocationTarget::Callback(b)) => Arc::ptr_eq(a, b),
            (RelocationTarget::Capability(a), RelocationTarget::Capability(b)) => a == b,
            _ => false,
        }
    }
}

impl<C: Eq> Eq for RelocationTarget<C> {}

/// Receives capability-target relocations
///
/// `relocated` runs while the allocation is in progress: the heap is in a
/// consistent state, the payload already lives at `new`, and writes made
/// through `heap` are undone if the allocation is later rolled back.
///
/// `rolled_back` is called in reverse order for every relocation of an
/// allocation that failed, including one whose `relocated` call returned
/// the error. It also runs for relocations made while evacuating into a
/// run that was abandoned for another candidate. Arena contents are already restored at that
/// point; only state kept outside the heap needs rewinding.
pub trait Relocator<C> {
    fn relocated(&mut self, heap: &mut Heap<C>, owner: &C, old: HeapAddr, new: HeapAddr)
        -> Result<()>;

    fn rolled_back(&mut self, owner: &C, current: HeapAddr, restored: HeapAddr) {
        let _ = (owner, current, restored);
    }
}

/// Relocator for heaps that never register capability targets
///
/// Moving a block with a capability target through this relocator fails the
/// allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelocator;

impl<C: fmt::Debug> Relocator<C> for NoRelocator {
    fn relocated(
        &mut self,
        _heap: &mut Heap<C>,
        owner: &C,
        old: HeapAddr,
        new: HeapAddr,
    ) -> Result<()> {
        error!("heap: capability target {:?} moved {} -> {} with no relocator", owner, old, new);
        Err(HeapError::Corrupted {
            offset: old.as_usize(),
            reason: "capability target without relocator",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_compare_by_value() {
        assert_eq!(RelocationTarget::<u32>::default(), RelocationTarget::None);
        assert_eq!(
            RelocationTarget::<u32>::Absolute(HeapAddr::new(16)),
            RelocationTarget::Absolute(HeapAddr::new(16))
        );
        assert_ne!(
            RelocationTarget::<u32>::Absolute(HeapAddr::new(16)),
            RelocationTarget::Absolute(HeapAddr::new(24))
        );
        assert_eq!(RelocationTarget::Capability(7u32), RelocationTarget::Capability(7));
        assert_ne!(RelocationTarget::Capability(7u32), RelocationTarget::None);
    }

    #[test]
    fn test_callbacks_compare_by_identity() {
        let callback: RelocationCallback = Arc::new(|_, _| {});
        let same = RelocationTarget::<u32>::Callback(Arc::clone(&callback));
        assert_eq!(same, RelocationTarget::Callback(callback));

        let other: RelocationCallback = Arc::new(|_, _| {});
        assert_ne!(same, RelocationTarget::Callback(other));
        assert_eq!(format!("{:?}", same), "Callback(..)");
    }
}
