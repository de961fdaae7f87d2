//! IPC Operations - Send and Receive
//!
//! IPC follows a synchronous rendezvous model:
//! 1. If the sender arrives first, it blocks on the endpoint's send queue
//! 2. If the receiver arrives first, it blocks on the receive queue
//! 3. When both are present the message moves immediately and the waiting
//!    partner is resumed
//!
//! Queued thread ids can outlive their threads; dead ids are skipped when
//! popped.

use kaal_heap::HeapAddr;
use log::{debug, trace, warn};

use super::{
    transfer_capability, EndpointIpc, ReceiveRequest, SendRequest, REG_BADGE, REG_MESSAGE,
    REG_TRANSFERRED,
};
use crate::context::Core;
use crate::error::{KernelError, Result};
use crate::objects::{CapAddress, EndpointObject, IpcState, ThreadId, ThreadState};
use crate::scheduler::Scheduler;

/// Rendezvous IPC over endpoint wait queues
#[derive(Debug, Default, Clone, Copy)]
pub struct Rendezvous;

/// A message on its way into a receiver's registers
struct Delivery {
    message: u64,
    badge: u64,
    transfer: Option<CapAddress>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self
    }

    /// Pop the first waiter that still exists
    fn pop_live(core: &Core, queue: &mut std::collections::VecDeque<ThreadId>) -> Option<ThreadId> {
        while let Some(tid) = queue.pop_front() {
            if core.threads().get(tid).is_some() {
                return Some(tid);
            }
            trace!("ipc: skipping dead waiter {}", tid.0);
        }
        None
    }

    /// Write `delivery` into the receiver's registers
    fn deliver(
        core: &mut Core,
        receiver: ThreadId,
        receive_slot: Option<CapAddress>,
        delivery: Delivery,
    ) -> Result<()> {
        let arrived = transfer_capability(core, delivery.transfer, receive_slot);
        let mut tcb = core.tcb(receiver)?;
        tcb.registers[REG_MESSAGE] = delivery.message;
        tcb.registers[REG_BADGE] = delivery.badge;
        tcb.registers[REG_TRANSFERRED] = u64::from(arrived == Some(true));
        tcb.ipc = IpcState {
            result: if arrived == Some(false) { KernelError::BadMessage.code() } else { 0 },
            ..IpcState::default()
        };
        tcb.state = ThreadState::Runnable;
        core.write_tcb(&tcb)
    }

    fn block(
        core: &mut Core,
        sched: &mut dyn Scheduler,
        tid: ThreadId,
        state: ThreadState,
        ipc: IpcState,
    ) -> Result<()> {
        let mut tcb = core.tcb(tid)?;
        tcb.state = state;
        tcb.ipc = ipc;
        core.write_tcb(&tcb)?;
        sched.block(tid);
        Ok(())
    }

    fn resume(core: &Core, sched: &mut dyn Scheduler, tid: ThreadId) -> Result<()> {
        let tcb = core.tcb(tid)?;
        sched.resume(tid, tcb.priority);
        Ok(())
    }

    fn endpoint(core: &Core, endpoint: HeapAddr) -> Result<EndpointObject> {
        EndpointObject::read(core.heap(), endpoint)
    }
}

impl EndpointIpc for Rendezvous {
    fn send(&mut self, core: &mut Core, sched: &mut dyn Scheduler, req: SendRequest) -> Result<u64> {
        let mut endpoint = Self::endpoint(core, req.endpoint)?;
        let delivery = Delivery { message: req.message, badge: req.badge, transfer: req.transfer };

        if let Some(receiver) = Self::pop_live(core, &mut endpoint.receivers) {
            core.write_endpoint(req.endpoint, &endpoint)?;
            let slot = core.tcb(receiver)?.ipc.receive_slot;
            Self::deliver(core, receiver, slot, delivery)?;
            Self::resume(core, sched, receiver)?;
            debug!("ipc: {} -> {} message {:#x}", req.sender.0, receiver.0, req.message);
            return Ok(0);
        }

        endpoint.enqueue_sender(req.sender)?;
        core.write_endpoint(req.endpoint, &endpoint)?;
        let pending = IpcState {
            message: req.message,
            badge: req.badge,
            transfer: req.transfer,
            ..IpcState::default()
        };
        Self::block(core, sched, req.sender, ThreadState::BlockedOnSend, pending)?;
        debug!("ipc: {} blocked sending on {}", req.sender.0, req.endpoint);
        Ok(0)
    }

    fn receive(
        &mut self,
        core: &mut Core,
        sched: &mut dyn Scheduler,
        req: ReceiveRequest,
    ) -> Result<u64> {
        let mut endpoint = Self::endpoint(core, req.endpoint)?;

        if let Some(sender) = Self::pop_live(core, &mut endpoint.senders) {
            core.write_endpoint(req.endpoint, &endpoint)?;
            let mut sender_tcb = core.tcb(sender)?;
            let pending = std::mem::take(&mut sender_tcb.ipc);
            let delivery = Delivery {
                message: pending.message,
                badge: pending.badge,
                transfer: pending.transfer,
            };
            Self::deliver(core, req.receiver, req.slot, delivery)?;

            sender_tcb.state = ThreadState::Runnable;
            core.write_tcb(&sender_tcb)?;
            Self::resume(core, sched, sender)?;
            debug!("ipc: {} -> {} message {:#x}", sender.0, req.receiver.0, pending.message);
            return Ok(0);
        }

        endpoint.enqueue_receiver(req.receiver)?;
        core.write_endpoint(req.endpoint, &endpoint)?;
        let pending = IpcState { receive_slot: req.slot, ..IpcState::default() };
        Self::block(core, sched, req.receiver, ThreadState::BlockedOnReceive, pending)?;
        debug!("ipc: {} blocked receiving on {}", req.receiver.0, req.endpoint);
        Ok(0)
    }

    fn endpoint_destroyed(
        &mut self,
        core: &mut Core,
        sched: &mut dyn Scheduler,
        endpoint: HeapAddr,
        waiters: &[ThreadId],
    ) {
        for &tid in waiters {
            let Ok(mut tcb) = core.tcb(tid) else {
                continue;
            };
            tcb.state = ThreadState::Runnable;
            tcb.ipc = IpcState { result: KernelError::BadMessage.code(), ..IpcState::default() };
            if let Err(err) = core.write_tcb(&tcb) {
                warn!("ipc: releasing {} from {}: {}", tid.0, endpoint, err);
                continue;
            }
            sched.resume(tid, tcb.priority);
            debug!("ipc: {} released from destroyed endpoint {}", tid.0, endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::objects::{CapFlags, ObjectKind};
    use crate::scheduler::PriorityScheduler;

    struct World {
        core: Core,
        sched: PriorityScheduler,
        ipc: Rendezvous,
        endpoint: HeapAddr,
        a: ThreadId,
        b: ThreadId,
    }

    fn world() -> World {
        let mut core = Core::new(KernelConfig::default()).unwrap();
        let mut sched = PriorityScheduler::new();
        let mut threads = Vec::new();
        for _ in 0..2 {
            let (tid, object) = core.create_thread(5).unwrap();
            core.heap.unpin(object).unwrap();
            let root = core.alloc_node(2).unwrap();
            core.populate(&CapAddress::root(tid), root, ObjectKind::Node, CapFlags::HEAP_MANAGED)
                .unwrap();
            core.heap.unpin(root).unwrap();
            sched.resume(tid, 5);
            threads.push(tid);
        }
        let endpoint = core.heap_alloc(crate::objects::endpoint::ENDPOINT_OBJECT_SIZE).unwrap();
        World { core, sched, ipc: Rendezvous::new(), endpoint, a: threads[0], b: threads[1] }
    }

    #[test]
    fn test_receiver_first() {
        let mut w = world();
        let recv = ReceiveRequest { endpoint: w.endpoint, receiver: w.a, slot: None };
        w.ipc.receive(&mut w.core, &mut w.sched, recv).unwrap();
        assert_eq!(w.core.tcb(w.a).unwrap().state, ThreadState::BlockedOnReceive);
        assert_eq!(w.sched.current_thread(), Some(w.b));

        let send = SendRequest {
            endpoint: w.endpoint,
            sender: w.b,
            badge: 42,
            message: 0xfeed,
            transfer: None,
        };
        w.ipc.send(&mut w.core, &mut w.sched, send).unwrap();

        let tcb = w.core.tcb(w.a).unwrap();
        assert_eq!(tcb.state, ThreadState::Runnable);
        assert_eq!(tcb.registers[REG_MESSAGE], 0xfeed);
        assert_eq!(tcb.registers[REG_BADGE], 42);
        assert_eq!(tcb.registers[REG_TRANSFERRED], 0);
        assert!(w.sched.is_ready(w.a));
        assert!(EndpointObject::read(w.core.heap(), w.endpoint).unwrap().is_idle());
    }

    #[test]
    fn test_sender_first_with_transfer() {
        let mut w = world();
        let block = w.core.heap_alloc(16).unwrap();
        let source = CapAddress::new(w.a, 1, 2);
        w.core.populate(&source, block, ObjectKind::Untyped, CapFlags::HEAP_MANAGED).unwrap();

        let send = SendRequest {
            endpoint: w.endpoint,
            sender: w.a,
            badge: 0,
            message: 7,
            transfer: Some(source),
        };
        w.ipc.send(&mut w.core, &mut w.sched, send).unwrap();
        assert_eq!(w.core.tcb(w.a).unwrap().state, ThreadState::BlockedOnSend);

        let dest = CapAddress::new(w.b, 3, 2);
        let recv = ReceiveRequest { endpoint: w.endpoint, receiver: w.b, slot: Some(dest) };
        w.ipc.receive(&mut w.core, &mut w.sched, recv).unwrap();

        let tcb = w.core.tcb(w.b).unwrap();
        assert_eq!(tcb.registers[REG_MESSAGE], 7);
        assert_eq!(tcb.registers[REG_TRANSFERRED], 1);
        assert_eq!(w.core.capability(&dest).unwrap().resource, block);
        assert_eq!(w.core.capability(&dest).unwrap().derived_from, Some(source));
        assert_eq!(w.core.tcb(w.a).unwrap().state, ThreadState::Runnable);
    }

    #[test]
    fn test_failed_transfer_still_delivers() {
        let mut w = world();
        let recv = ReceiveRequest {
            endpoint: w.endpoint,
            receiver: w.a,
            slot: Some(CapAddress::new(w.a, 0, 2)),
        };
        w.ipc.receive(&mut w.core, &mut w.sched, recv).unwrap();

        // Nothing to transfer at the source address.
        let send = SendRequest {
            endpoint: w.endpoint,
            sender: w.b,
            badge: 1,
            message: 3,
            transfer: Some(CapAddress::new(w.b, 2, 2)),
        };
        w.ipc.send(&mut w.core, &mut w.sched, send).unwrap();

        let tcb = w.core.tcb(w.a).unwrap();
        assert_eq!(tcb.registers[REG_MESSAGE], 3);
        assert_eq!(tcb.registers[REG_TRANSFERRED], 0);
        assert_eq!(tcb.ipc.result, KernelError::BadMessage.code());
    }

    #[test]
    fn test_destroyed_endpoint_releases_waiters() {
        let mut w = world();
        let recv = ReceiveRequest { endpoint: w.endpoint, receiver: w.a, slot: None };
        w.ipc.receive(&mut w.core, &mut w.sched, recv).unwrap();

        w.ipc.endpoint_destroyed(&mut w.core, &mut w.sched, w.endpoint, &[w.a]);
        let tcb = w.core.tcb(w.a).unwrap();
        assert_eq!(tcb.state, ThreadState::Runnable);
        assert_eq!(tcb.ipc.result, KernelError::BadMessage.code());
        assert!(w.sched.is_ready(w.a));
    }
}
