//! Object Invocation System
//!
//! Every user-visible kernel operation is an invocation on a capability:
//!
//! ```text
//! User Space                  Kernel Space
//! ----------                  ------------
//! invoke(path, depth, op, arg) -> lookup (pins the container)
//!                                  ├─> Operation::decode(kind, op)
//!                                  ├─> check rights
//!                                  ├─> invoke_<object>()
//!                                  └─> unlock
//! ```
//!
//! Operation numbers decode into a closed enum per object kind, so an
//! unknown number is rejected once, before any handler runs. Extra words
//! travel in the invoker's message registers (`r0..r7`).

use log::{debug, trace};

use super::{CapAddress, CapRights, Capability, NodeHeader, ObjectKind, Tcb, ThreadId, ThreadState};
use crate::config::NUM_MSG_REGISTERS;
use crate::cspace::{parse_depth, Located};
use crate::error::{KernelError, Result};
use crate::ipc::{EndpointIpc, ReceiveRequest, SendRequest};
use crate::kernel::Kernel;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    Copy,
    Move,
    Delete,
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntypedOp {
    Lock,
    Unlock,
    TryLock,
    SizeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceOp {
    Alloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOp {
    ReadRegisters,
    WriteRegisters,
    Resume,
    Suspend,
    SetRootNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOp {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOp {
    PutChar,
}

/// A decoded invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Node(NodeOp),
    Untyped(UntypedOp),
    AddressSpace(AddressSpaceOp),
    Thread(ThreadOp),
    Endpoint(EndpointOp),
    Debug(DebugOp),
}

impl Operation {
    /// Decode operation number `op` for an object of `kind`
    pub fn decode(kind: ObjectKind, op: u64) -> Result<Self> {
        let operation = match (kind, op) {
            (ObjectKind::Node, 0) => Operation::Node(NodeOp::Copy),
            (ObjectKind::Node, 1) => Operation::Node(NodeOp::Move),
            (ObjectKind::Node, 2) => Operation::Node(NodeOp::Delete),
            (ObjectKind::Node, 3) => Operation::Node(NodeOp::Revoke),
            (ObjectKind::Untyped, 0) => Operation::Untyped(UntypedOp::Lock),
            (ObjectKind::Untyped, 1) => Operation::Untyped(UntypedOp::Unlock),
            (ObjectKind::Untyped, 2) => Operation::Untyped(UntypedOp::TryLock),
            (ObjectKind::Untyped, 3) => Operation::Untyped(UntypedOp::SizeOf),
            (ObjectKind::AddressSpace, 0) => Operation::AddressSpace(AddressSpaceOp::Alloc),
            (ObjectKind::Thread, 0) => Operation::Thread(ThreadOp::ReadRegisters),
            (ObjectKind::Thread, 1) => Operation::Thread(ThreadOp::WriteRegisters),
            (ObjectKind::Thread, 2) => Operation::Thread(ThreadOp::Resume),
            (ObjectKind::Thread, 3) => Operation::Thread(ThreadOp::Suspend),
            (ObjectKind::Thread, 4) => Operation::Thread(ThreadOp::SetRootNode),
            (ObjectKind::Endpoint, 0) => Operation::Endpoint(EndpointOp::Send),
            (ObjectKind::Endpoint, 1) => Operation::Endpoint(EndpointOp::Receive),
            (ObjectKind::Debug, 0) => Operation::Debug(DebugOp::PutChar),
            _ => return Err(KernelError::InvalidCapability),
        };
        Ok(operation)
    }

    /// Rights the invoked capability must carry
    pub fn required_rights(self) -> CapRights {
        match self {
            Operation::Untyped(UntypedOp::SizeOf) => CapRights::empty(),
            Operation::Untyped(_)
            | Operation::Thread(ThreadOp::ReadRegisters)
            | Operation::Endpoint(EndpointOp::Receive) => CapRights::READ,
            _ => CapRights::WRITE,
        }
    }
}

/// Optional capability address in two registers; depth 0 means none
fn optional_address(caller: ThreadId, path: u64, depth: u64) -> Result<Option<CapAddress>> {
    if depth == 0 {
        return Ok(None);
    }
    Ok(Some(CapAddress::new(caller, path, parse_depth(depth)?)))
}

impl<S: Scheduler, I: EndpointIpc> Kernel<S, I> {
    /// Decode, check and run one invocation on the capability at `at`
    pub(crate) fn dispatch(&mut self, caller: ThreadId, at: &Located, op: u64, arg: u64) -> Result<u64> {
        let cap = self.core.read_cap(at.slot)?;
        let kind = cap.kind().ok_or(KernelError::NoCapability)?;
        let operation = Operation::decode(kind, op)?;
        if !cap.rights.contains(operation.required_rights()) {
            debug!("invoke: {:?} on {} lacks {:?}", operation, at.address, operation.required_rights());
            return Err(KernelError::PermissionDenied);
        }
        trace!("invoke: {} {:?} arg={:#x}", at.address, operation, arg);

        match operation {
            Operation::Node(op) => self.invoke_node(caller, at.address, &cap, op, arg),
            Operation::Untyped(op) => self.invoke_untyped(&cap, op),
            Operation::AddressSpace(AddressSpaceOp::Alloc) => self.invoke_alloc(caller, arg),
            Operation::Thread(op) => self.invoke_thread(caller, &cap, op, arg),
            Operation::Endpoint(op) => self.invoke_endpoint(caller, &cap, op, arg),
            Operation::Debug(DebugOp::PutChar) => {
                self.core.put_char(arg as u8);
                Ok(0)
            }
        }
    }

    fn invoke_node(
        &mut self,
        caller: ThreadId,
        node_at: CapAddress,
        cap: &Capability,
        op: NodeOp,
        arg: u64,
    ) -> Result<u64> {
        let header = NodeHeader::read(self.core.heap(), cap.resource)?;
        let slot = node_at.child(arg, header.slot_bits)?;
        let regs = self.core.tcb(caller)?.registers;

        match op {
            NodeOp::Copy => {
                let src = CapAddress::new(caller, regs[0], parse_depth(regs[1])?);
                let rights = CapRights::from_bits_truncate(regs[2] as u8);
                let badge = (regs[4] != 0).then_some(regs[3]);
                self.core.copy(&src, &slot, rights, badge)?;
            }
            NodeOp::Move => {
                let src = CapAddress::new(caller, regs[0], parse_depth(regs[1])?);
                self.core.move_cap(&src, &slot)?;
            }
            NodeOp::Delete => self.core.delete(&slot)?,
            NodeOp::Revoke => self.core.revoke(&slot)?,
        }
        Ok(0)
    }

    fn invoke_untyped(&mut self, cap: &Capability, op: UntypedOp) -> Result<u64> {
        match op {
            UntypedOp::Lock => self.core.lock(cap.resource),
            UntypedOp::Unlock => self.core.unlock(cap.resource),
            UntypedOp::TryLock => self.core.try_lock(cap.resource),
            UntypedOp::SizeOf => self.core.untyped_size(cap.resource),
        }
    }

    fn invoke_alloc(&mut self, caller: ThreadId, size: u64) -> Result<u64> {
        let tcb = self.core.tcb(caller)?;
        let kind = ObjectKind::from_type_number(tcb.registers[0])?;
        let dest = CapAddress::new(caller, tcb.registers[1], parse_depth(tcb.registers[2])?);
        self.core.alloc_object(kind, size, &dest, tcb.priority)?;
        Ok(0)
    }

    fn invoke_thread(
        &mut self,
        caller: ThreadId,
        cap: &Capability,
        op: ThreadOp,
        arg: u64,
    ) -> Result<u64> {
        let mut target = Tcb::read(self.core.heap(), cap.resource)?;

        match op {
            ThreadOp::ReadRegisters | ThreadOp::WriteRegisters => {
                let count = usize::try_from(arg).map_err(|_| KernelError::InvalidArgument)?;
                if count > NUM_MSG_REGISTERS {
                    return Err(KernelError::InvalidArgument);
                }
                let mut invoker = self.core.tcb(caller)?;
                if op == ThreadOp::ReadRegisters {
                    invoker.registers[..count].copy_from_slice(&target.registers[..count]);
                    self.core.write_tcb(&invoker)?;
                } else {
                    target.registers[..count].copy_from_slice(&invoker.registers[..count]);
                    self.core.write_tcb(&target)?;
                }
            }
            ThreadOp::Resume => {
                if target.state == ThreadState::Inactive {
                    target.state = ThreadState::Runnable;
                    self.core.write_tcb(&target)?;
                    self.scheduler.resume(target.tid, target.priority);
                }
            }
            ThreadOp::Suspend => match target.state {
                ThreadState::Runnable => {
                    target.state = ThreadState::Inactive;
                    self.core.write_tcb(&target)?;
                    self.scheduler.suspend(target.tid);
                }
                ThreadState::Inactive => {}
                ThreadState::BlockedOnSend | ThreadState::BlockedOnReceive => {
                    return Err(KernelError::NotSupported);
                }
            },
            ThreadOp::SetRootNode => {
                let regs = self.core.tcb(caller)?.registers;
                let node = CapAddress::new(caller, regs[0], parse_depth(regs[1])?);
                if self.core.capability(&node)?.kind() != Some(ObjectKind::Node) {
                    return Err(KernelError::InvalidCapability);
                }
                self.core.move_cap(&node, &CapAddress::root(target.tid))?;
            }
        }
        Ok(0)
    }

    fn invoke_endpoint(
        &mut self,
        caller: ThreadId,
        cap: &Capability,
        op: EndpointOp,
        arg: u64,
    ) -> Result<u64> {
        let regs = self.core.tcb(caller)?.registers;
        let address = optional_address(caller, regs[0], regs[1])?;

        match op {
            EndpointOp::Send => {
                if address.is_some() && !cap.rights.contains(CapRights::GRANT) {
                    return Err(KernelError::PermissionDenied);
                }
                let req = SendRequest {
                    endpoint: cap.resource,
                    sender: caller,
                    badge: cap.badge,
                    message: arg,
                    transfer: address,
                };
                self.ipc.send(&mut self.core, &mut self.scheduler, req)
            }
            EndpointOp::Receive => {
                let req = ReceiveRequest { endpoint: cap.resource, receiver: caller, slot: address };
                self.ipc.receive(&mut self.core, &mut self.scheduler, req)
            }
        }
    }
}
