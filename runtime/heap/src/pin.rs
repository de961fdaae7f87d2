//! Scoped pinning
//!
//! [`Pinned`] pins a block for as long as the guard lives and releases the
//! pin on drop, but only if the guard took it: pinning a block that is
//! already pinned (for instance a freshly allocated one) leaves it pinned
//! after the guard goes away.

use core::fmt;

use log::warn;

use crate::{Heap, HeapAddr, Result};

/// Guard that keeps a block pinned
pub struct Pinned<'h, C: Clone + fmt::Debug> {
    heap: &'h mut Heap<C>,
    handle: HeapAddr,
    owned: bool,
}

impl<'h, C: Clone + fmt::Debug> Pinned<'h, C> {
    #[inline]
    pub fn handle(&self) -> HeapAddr {
        self.handle
    }

    /// Whether the block was pinned before the guard was taken
    #[inline]
    pub fn was_pinned(&self) -> bool {
        !self.owned
    }

    pub fn payload(&self) -> Result<&[u8]> {
        self.heap.payload(self.handle)
    }

    pub fn heap(&self) -> &Heap<C> {
        &*self.heap
    }

    /// The heap, for allocations made while the block stays put
    pub fn heap_mut(&mut self) -> &mut Heap<C> {
        &mut *self.heap
    }
}

impl<C: Clone + fmt::Debug> Drop for Pinned<'_, C> {
    fn drop(&mut self) {
        if self.owned {
            if let Err(err) = self.heap.unpin(self.handle) {
                warn!("heap: releasing pin on {}: {}", self.handle, err);
            }
        }
    }
}

impl<C: Clone + fmt::Debug> Heap<C> {
    /// Pin `handle` until the returned guard is dropped
    pub fn pinned(&mut self, handle: HeapAddr) -> Result<Pinned<'_, C>> {
        let was_pinned = self.pin(handle)?;
        Ok(Pinned { heap: self, handle, owned: !was_pinned })
    }

    /// Run `f` with `handle` pinned
    pub fn with_pinned<R>(
        &mut self,
        handle: HeapAddr,
        f: impl FnOnce(&mut Heap<C>) -> R,
    ) -> Result<R> {
        let mut guard = self.pinned(handle)?;
        Ok(f(guard.heap_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoRelocator;

    #[test]
    fn test_guard_unpins_on_drop() {
        let mut heap: Heap<u32> = Heap::new(256).unwrap();
        let a = heap.alloc(32, &mut NoRelocator).unwrap();
        heap.unpin(a).unwrap();

        {
            let guard = heap.pinned(a).unwrap();
            assert!(!guard.was_pinned());
            assert!(guard.heap().is_pinned(a).unwrap());
        }
        assert!(!heap.is_pinned(a).unwrap());
    }

    #[test]
    fn test_guard_keeps_existing_pin() {
        let mut heap: Heap<u32> = Heap::new(256).unwrap();
        let a = heap.alloc(32, &mut NoRelocator).unwrap();
        drop(heap.pinned(a).unwrap());
        assert!(heap.is_pinned(a).unwrap());
    }

    #[test]
    fn test_with_pinned_allows_allocation() {
        let mut heap: Heap<u32> = Heap::new(512).unwrap();
        let a = heap.alloc(32, &mut NoRelocator).unwrap();
        heap.write(a, b"pinned").unwrap();
        heap.unpin(a).unwrap();

        let b = heap
            .with_pinned(a, |heap| heap.alloc(64, &mut NoRelocator))
            .unwrap()
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(&heap.payload(a).unwrap()[..6], b"pinned");
        assert!(!heap.is_pinned(a).unwrap());
    }

    #[test]
    fn test_guard_on_invalid_handle() {
        let mut heap: Heap<u32> = Heap::new(256).unwrap();
        assert!(heap.pinned(HeapAddr::new(16)).is_err());
    }
}
