//! Inter-Process Communication (IPC)
//!
//! Synchronous rendezvous IPC over endpoint objects, with one message word
//! and an optional capability per message.
//!
//! ## IPC Model
//!
//! **Synchronous Rendezvous**:
//! - Sender and receiver must both be ready
//! - No buffering: the message lands directly in the receiver's registers
//! - A thread with no partner blocks on the endpoint's wait queue
//!
//! **Delivery** (receiver's message registers):
//! - `r2` = message word
//! - `r3` = badge of the endpoint capability the sender used
//! - `r4` = 1 if a capability was transferred into the receive slot
//!
//! The kernel core only knows the [`EndpointIpc`] trait; [`Rendezvous`] is
//! the implementation used by the kernel and the tests.

pub mod cap_transfer;
pub mod operations;

pub use cap_transfer::transfer_capability;
pub use operations::Rendezvous;

use kaal_heap::HeapAddr;

use crate::context::Core;
use crate::error::Result;
use crate::objects::{CapAddress, ObjectKind, ThreadId};
use crate::scheduler::Scheduler;

/// Register receiving the message word
pub const REG_MESSAGE: usize = 2;
/// Register receiving the sender's badge
pub const REG_BADGE: usize = 3;
/// Register set to 1 when a capability arrived
pub const REG_TRANSFERRED: usize = 4;

/// A send on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub endpoint: HeapAddr,
    pub sender: ThreadId,
    pub badge: u64,
    pub message: u64,
    /// Capability to copy to the receiver
    pub transfer: Option<CapAddress>,
}

/// A receive on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub endpoint: HeapAddr,
    pub receiver: ThreadId,
    /// Where a transferred capability goes
    pub slot: Option<CapAddress>,
}

/// Endpoint IPC collaborator
pub trait EndpointIpc {
    fn send(&mut self, core: &mut Core, sched: &mut dyn Scheduler, req: SendRequest)
        -> Result<u64>;

    fn receive(
        &mut self,
        core: &mut Core,
        sched: &mut dyn Scheduler,
        req: ReceiveRequest,
    ) -> Result<u64>;

    /// Release the threads that were waiting on a destroyed endpoint
    fn endpoint_destroyed(
        &mut self,
        core: &mut Core,
        sched: &mut dyn Scheduler,
        endpoint: HeapAddr,
        waiters: &[ThreadId],
    );

    /// The heap moved an object
    fn resource_moved(&mut self, kind: ObjectKind, old: HeapAddr, new: HeapAddr) {
        let _ = (kind, old, new);
    }
}
