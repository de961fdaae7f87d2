//! Kernel context and the invocation entry point
//!
//! [`Kernel`] ties the capability core to its two collaborators: a
//! [`Scheduler`] that knows which thread is running, and an [`EndpointIpc`]
//! implementation for endpoint operations. Events the core queues during an
//! invocation (thread and endpoint destruction, object moves) are forwarded
//! to them before `invoke` returns.

use kaal_heap::HeapAddr;
use log::info;

use crate::config::{
    KernelConfig, NUM_MSG_REGISTERS, ROOT_SLOT_ADDRESS_SPACE, ROOT_SLOT_DEBUG, ROOT_SLOT_THREAD,
};
use crate::context::{Core, CoreEvent};
use crate::cspace::parse_depth;
use crate::error::{KernelError, Result, SyscallReturn};
use crate::ipc::EndpointIpc;
use crate::objects::{CapAddress, CapFlags, ObjectKind, ThreadId, ThreadState};
use crate::scheduler::Scheduler;

/// The kernel: capability core plus collaborators
#[derive(Debug)]
pub struct Kernel<S: Scheduler, I: EndpointIpc> {
    pub(crate) core: Core,
    pub(crate) scheduler: S,
    pub(crate) ipc: I,
    boot_thread: ThreadId,
}

impl<S: Scheduler, I: EndpointIpc> Kernel<S, I> {
    /// Build the kernel context and the boot thread
    ///
    /// The boot thread's root node has `2^root_slot_bits` slots: slot 0
    /// holds the address-space capability, slot 1 the debug console, slot 2
    /// the boot thread's own thread capability.
    pub fn boot(config: KernelConfig, mut scheduler: S, ipc: I) -> Result<Self> {
        let mut core = Core::new(config.clone())?;

        let (tid, thread) = core.create_thread(config.boot_priority)?;
        let root = core.alloc_node(config.root_slot_bits)?;
        let root_at = CapAddress::root(tid);
        core.populate(&root_at, root, ObjectKind::Node, CapFlags::HEAP_MANAGED)?;

        let bits = config.root_slot_bits;
        core.populate(
            &root_at.child(ROOT_SLOT_ADDRESS_SPACE, bits)?,
            HeapAddr::NULL,
            ObjectKind::AddressSpace,
            CapFlags::empty(),
        )?;
        core.populate(
            &root_at.child(ROOT_SLOT_DEBUG, bits)?,
            HeapAddr::NULL,
            ObjectKind::Debug,
            CapFlags::empty(),
        )?;
        core.populate(
            &root_at.child(ROOT_SLOT_THREAD, bits)?,
            thread,
            ObjectKind::Thread,
            CapFlags::HEAP_MANAGED,
        )?;
        core.heap.unpin(root)?;
        core.heap.unpin(thread)?;

        let mut tcb = core.tcb(tid)?;
        tcb.state = ThreadState::Runnable;
        core.write_tcb(&tcb)?;
        scheduler.resume(tid, tcb.priority);

        info!(
            "kernel: booted thread {} with {} root slots, heap {} bytes",
            tid.0,
            1u64 << bits,
            config.heap_size
        );
        Ok(Self { core, scheduler, ipc, boot_thread: tid })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Direct access to the capability core, for privileged setup code
    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn ipc(&self) -> &I {
        &self.ipc
    }

    pub fn boot_thread(&self) -> ThreadId {
        self.boot_thread
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.scheduler.current_thread()
    }

    /// Invoke operation `op` on the capability at `path`/`depth` in the
    /// current thread's capability space
    pub fn invoke(&mut self, path: u64, depth: u64, op: u64, arg: u64) -> Result<u64> {
        let caller = self.scheduler.current_thread().ok_or(KernelError::NoCapability)?;
        let addr = CapAddress::new(caller, path, parse_depth(depth)?);

        let looked = self.core.lookup(&addr)?;
        let result = self.dispatch(caller, &looked.located, op, arg);
        self.core.unlock_looked_up(looked);

        self.drain_events();
        self.verify();
        result
    }

    /// [`invoke`](Self::invoke) with the result in ABI form
    pub fn syscall(&mut self, path: u64, depth: u64, op: u64, arg: u64) -> SyscallReturn {
        self.invoke(path, depth, op, arg).into()
    }

    /// Message registers of a thread
    pub fn registers(&self, tid: ThreadId) -> Result<[u64; NUM_MSG_REGISTERS]> {
        Ok(self.core.tcb(tid)?.registers)
    }

    /// Load the leading message registers of a thread
    pub fn set_registers(&mut self, tid: ThreadId, values: &[u64]) -> Result<()> {
        if values.len() > NUM_MSG_REGISTERS {
            return Err(KernelError::InvalidArgument);
        }
        let mut tcb = self.core.tcb(tid)?;
        tcb.registers[..values.len()].copy_from_slice(values);
        self.core.write_tcb(&tcb)
    }

    /// Forward queued core events to the collaborators
    fn drain_events(&mut self) {
        for event in self.core.take_events() {
            match event {
                CoreEvent::ThreadDestroyed(tid) => self.scheduler.thread_destroyed(tid),
                CoreEvent::EndpointDestroyed { endpoint, waiters } => {
                    self.ipc.endpoint_destroyed(
                        &mut self.core,
                        &mut self.scheduler,
                        endpoint,
                        &waiters,
                    );
                }
                CoreEvent::Moved { kind, old, new } => self.ipc.resource_moved(kind, old, new),
            }
        }
    }

    #[cfg(any(debug_assertions, feature = "verification"))]
    fn verify(&self) {
        if let Err(err) = self.core.heap.validate() {
            log::error!("kernel: heap inconsistent after invocation: {}", err);
            debug_assert!(false, "heap inconsistent: {err}");
        }
    }

    #[cfg(not(any(debug_assertions, feature = "verification")))]
    fn verify(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Rendezvous;
    use crate::scheduler::PriorityScheduler;

    fn boot() -> Kernel<PriorityScheduler, Rendezvous> {
        Kernel::boot(KernelConfig::default(), PriorityScheduler::new(), Rendezvous::new()).unwrap()
    }

    #[test]
    fn test_boot_layout() {
        let kernel = boot();
        let tid = kernel.boot_thread();
        assert_eq!(kernel.current_thread(), Some(tid));

        let core = kernel.core();
        let root = core.capability(&CapAddress::root(tid)).unwrap();
        assert_eq!(root.kind(), Some(ObjectKind::Node));
        assert!(root.flags.contains(CapFlags::ROOT));

        let slot = |i| core.capability(&CapAddress::new(tid, i, 4)).unwrap().kind();
        assert_eq!(slot(0), Some(ObjectKind::AddressSpace));
        assert_eq!(slot(1), Some(ObjectKind::Debug));
        assert_eq!(slot(2), Some(ObjectKind::Thread));
        assert_eq!(slot(3), None);
        assert_eq!(core.heap().stats().pinned, 0);
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let config = KernelConfig { root_slot_bits: 0, ..KernelConfig::default() };
        assert!(Kernel::boot(config, PriorityScheduler::new(), Rendezvous::new()).is_err());
    }

    #[test]
    fn test_invoke_debug_and_errors() {
        let mut kernel = boot();
        for byte in b"ok\n" {
            assert_eq!(kernel.invoke(ROOT_SLOT_DEBUG, 4, 0, u64::from(*byte)), Ok(0));
        }
        assert_eq!(kernel.core().console(), b"ok\n");

        assert_eq!(kernel.invoke(9, 4, 0, 0), Err(KernelError::NoCapability));
        assert_eq!(kernel.invoke(ROOT_SLOT_DEBUG, 4, 1, 0), Err(KernelError::InvalidCapability));
        assert_eq!(kernel.syscall(ROOT_SLOT_DEBUG, 99, 0, 0), SyscallReturn { code: 5, value: 0 });
        assert_eq!(kernel.core().heap().stats().pinned, 0);
    }

    #[test]
    fn test_registers_round_trip() {
        let mut kernel = boot();
        let tid = kernel.boot_thread();
        kernel.set_registers(tid, &[1, 2, 3]).unwrap();
        assert_eq!(&kernel.registers(tid).unwrap()[..4], &[1, 2, 3, 0]);
        assert_eq!(kernel.set_registers(tid, &[0; 9]), Err(KernelError::InvalidArgument));
    }
}
