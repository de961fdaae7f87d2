//! Capability Node (CNode) layout
//!
//! A node is a heap block holding a small header and `2^slot_bits` slots:
//!
//! ```text
//! +-----------+---------+---------+--------+--------+-----
//! | slot_bits | nesting | (pad 6) | slot 0 | slot 1 | ...
//! +-----------+---------+---------+--------+--------+-----
//! ```
//!
//! `nesting` is the node's distance from a thread's root slot: 0 for a root
//! node, parent + 1 below it. Nodes cannot be copied, so a node always has
//! exactly one capability.

use kaal_heap::HeapAddr;
use log::error;

use super::KernelHeap;
use crate::config::{CAP_SLOT_SIZE, MAX_SLOT_BITS, NODE_HEADER_SIZE};
use crate::error::{KernelError, Result};

/// Header of a node object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub slot_bits: u8,
    pub nesting: u8,
}

impl NodeHeader {
    pub fn new(slot_bits: u8) -> Result<Self> {
        if slot_bits == 0 || slot_bits > MAX_SLOT_BITS {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self { slot_bits, nesting: 0 })
    }

    pub fn read(heap: &KernelHeap, node: HeapAddr) -> Result<Self> {
        let bytes = heap.read(node, 2)?;
        let (slot_bits, nesting) = (bytes[0], bytes[1]);
        if slot_bits == 0 || slot_bits > MAX_SLOT_BITS {
            error!("cnode: bad header at {}: slot_bits={}", node, slot_bits);
            return Err(KernelError::Corrupted);
        }
        Ok(Self { slot_bits, nesting })
    }

    pub fn write(&self, heap: &mut KernelHeap, node: HeapAddr) -> Result<()> {
        heap.write(node, &[self.slot_bits, self.nesting])?;
        Ok(())
    }

    /// Number of slots
    #[inline]
    pub fn slots(&self) -> u64 {
        1u64 << self.slot_bits
    }

    /// Heap address of slot `index`
    #[inline]
    pub fn slot(&self, node: HeapAddr, index: u64) -> HeapAddr {
        node.offset(NODE_HEADER_SIZE + index as usize * CAP_SLOT_SIZE)
    }
}

/// Bytes needed for a node of `2^slot_bits` slots
pub fn node_object_size(slot_bits: u8) -> Result<usize> {
    let header = NodeHeader::new(slot_bits)?;
    Ok(NODE_HEADER_SIZE + header.slots() as usize * CAP_SLOT_SIZE)
}
