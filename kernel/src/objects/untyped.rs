//! Untyped Memory
//!
//! Untyped objects are plain heap blocks handed to user code. They are
//! relocatable like every other object, so user code must lock a block
//! before touching its bytes:
//!
//! ```text
//! lock     -> pin, return the payload address (stable until unlock)
//! unlock   -> unpin; the heap may move the block again
//! try_lock -> lock, but PermissionDenied if someone already holds it
//! sizeof   -> usable payload bytes
//! ```

use kaal_heap::HeapAddr;
use log::{trace, warn};

use crate::context::Core;
use crate::error::{KernelError, Result};

impl Core {
    /// Pin an untyped block and return its payload address
    ///
    /// Locking an already locked block keeps it locked; the second lock is
    /// not counted.
    pub fn lock(&mut self, resource: HeapAddr) -> Result<u64> {
        let was_pinned = self.heap.pin(resource)?;
        trace!("untyped: lock {} (was locked: {})", resource, was_pinned);
        Ok(resource.raw())
    }

    pub fn try_lock(&mut self, resource: HeapAddr) -> Result<u64> {
        if self.heap.is_pinned(resource)? {
            return Err(KernelError::PermissionDenied);
        }
        self.lock(resource)
    }

    pub fn unlock(&mut self, resource: HeapAddr) -> Result<u64> {
        if !self.heap.is_pinned(resource)? {
            warn!("untyped: unlock of {} which is not locked", resource);
            return Err(KernelError::InvalidArgument);
        }
        self.heap.unpin(resource)?;
        Ok(0)
    }

    pub fn untyped_size(&self, resource: HeapAddr) -> Result<u64> {
        Ok(self.heap.size_of(resource)? as u64)
    }
}
