//! Kernel Object Model
//!
//! Every kernel object is a block in the relocating heap, named by the
//! capabilities whose `resource` is the block's handle.
//!
//! ## Object Types
//!
//! - **Untyped**: raw memory that user code can lock and access
//! - **Node**: capability node, `2^slot_bits` capability slots
//! - **Thread**: control block plus the thread's root capability slot
//! - **Endpoint**: synchronous IPC rendezvous point
//! - **AddressSpace**: the allocator; creates the other objects
//! - **Debug**: console output
//!
//! Object state is encoded into the heap block with `bincode`, so a block
//! can be moved by the heap without any fix-up beyond the capabilities
//! naming it.

pub mod capability;
pub mod cnode;
pub mod endpoint;
pub mod invoke;
pub mod tcb;
pub mod untyped;

use bincode::Options;
use kaal_heap::Heap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// Re-export main types
pub use capability::{CapAddress, CapFlags, CapRights, Capability};
pub use cnode::NodeHeader;
pub use endpoint::EndpointObject;
pub use invoke::Operation;
pub use tcb::{IpcState, Tcb, ThreadId, ThreadState, ThreadTable};

/// The kernel heap: relocation targets are capability addresses
pub type KernelHeap = Heap<CapAddress>;

/// Kind of object a capability names
///
/// Each kind has its own closed set of operations, see [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Untyped,
    Node,
    Thread,
    Endpoint,
    AddressSpace,
    Debug,
}

impl ObjectKind {
    /// Object type number used by `AddressSpace::alloc`
    pub fn from_type_number(number: u64) -> Result<Self> {
        match number {
            0 => Ok(ObjectKind::Untyped),
            1 => Ok(ObjectKind::Node),
            2 => Ok(ObjectKind::Thread),
            3 => Ok(ObjectKind::Endpoint),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Fixed-width encoding shared by every heap-resident object
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding().allow_trailing_bytes()
}
