//! Kernel configuration
//!
//! Layout constants are fixed at build time; [`KernelConfig`] carries the
//! values chosen at boot (arena size, root node size, nesting limit).

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::error::{KernelError, Result};

/// Bytes reserved for one capability slot
pub const CAP_SLOT_SIZE: usize = 144;

/// Bytes before the first slot of a node object
pub const NODE_HEADER_SIZE: usize = 8;

/// Message registers per thread (`r0..r7`)
pub const NUM_MSG_REGISTERS: usize = 8;

/// Buckets in the thread table
pub const THREAD_BUCKETS: usize = 16;

/// Wait queue length of an endpoint (per direction)
pub const ENDPOINT_QUEUE_CAPACITY: usize = 16;

/// Largest node: 2^8 slots
pub const MAX_SLOT_BITS: u8 = 8;

/// Bits in a capability path
pub const MAX_ADDRESS_BITS: u8 = 64;

/// Depth sentinel: resolve until the first slot that is not a node
pub const DEPTH_ANY: u8 = u8::MAX;

/// Derivation trees hold at most original → badged → derived
pub const MAX_DERIVATION_LEVEL: u8 = 2;

/// Root node slot holding the address-space (allocator) capability
pub const ROOT_SLOT_ADDRESS_SPACE: u64 = 0;

/// Root node slot holding the debug console capability
pub const ROOT_SLOT_DEBUG: u64 = 1;

/// Root node slot holding the boot thread's own thread capability
pub const ROOT_SLOT_THREAD: u64 = 2;

const_assert!(CAP_SLOT_SIZE % 8 == 0);
const_assert!(NODE_HEADER_SIZE % 8 == 0);
const_assert!(THREAD_BUCKETS <= u16::MAX as usize);

/// Boot-time kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Heap arena size in bytes
    pub heap_size: usize,
    /// Address bits of the boot thread's root node
    pub root_slot_bits: u8,
    /// Deepest allowed node nesting (root node = 0)
    pub max_nesting: u8,
    /// Priority of the boot thread (0 = highest)
    pub boot_priority: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { heap_size: 64 * 1024, root_slot_bits: 4, max_nesting: 8, boot_priority: 128 }
    }
}

impl KernelConfig {
    /// Reject configurations the kernel cannot boot with
    pub fn validate(&self) -> Result<()> {
        // Slots 0..=2 are populated at boot.
        if !(2..=MAX_SLOT_BITS).contains(&self.root_slot_bits) {
            return Err(KernelError::InvalidArgument);
        }
        if self.max_nesting == 0 || self.max_nesting >= MAX_ADDRESS_BITS {
            return Err(KernelError::InvalidArgument);
        }
        if self.heap_size < 4096 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}
