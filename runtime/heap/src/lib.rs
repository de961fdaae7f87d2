//! KaaL Heap - Relocating kernel object heap
//!
//! # Purpose
//! Backs every kernel object with a block in one flat arena. Blocks are
//! referred to by handles (payload addresses) and may be moved by later
//! allocations unless pinned, which lets the heap compact itself instead of
//! failing when free space is fragmented.
//!
//! # Integration Points
//! - Provides to: the capability layer (`kaal-core`), which registers each
//!   object's owning capability as the block's relocation target
//! - Depends on: nothing beyond the arena it owns
//!
//! # Architecture
//! - Address-ordered block list with in-arena stamps and a side table
//! - Run-based allocation that evacuates relocatable blocks
//! - Undo-log transactions so a failed relocation chain leaves no trace
//! - [`Pinned`] guards for scoped pinning
//!
//! # Testing Strategy
//! - Unit tests: allocation, coalescing, relocation targets, rollback
//! - Property tests: coalescing and conservation over random workloads
//! - Benchmarks: allocation with and without relocation
//!
//! # Example
//!
//! ```
//! use kaal_heap::{Heap, NoRelocator};
//!
//! let mut heap: Heap<u32> = Heap::new(4096)?;
//! let block = heap.alloc(128, &mut NoRelocator)?;
//! heap.write(block, b"hello")?;
//! heap.unpin(block)?;
//! assert_eq!(heap.stats().used + heap.stats().free, heap.capacity());
//! # Ok::<(), kaal_heap::HeapError>(())
//! ```

mod addr;
mod block;
mod error;
mod heap;
mod pin;
mod relocation;
mod stats;
mod transaction;

pub use addr::HeapAddr;
pub use block::{BlockInfo, BlockKind, ALIGN, HEADER_SIZE, MIN_BLOCK_SIZE};
pub use error::{HeapError, Result};
pub use heap::Heap;
pub use pin::Pinned;
pub use relocation::{NoRelocator, RelocationCallback, RelocationTarget, Relocator};
pub use stats::HeapStats;
