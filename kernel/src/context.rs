//! Kernel core context
//!
//! [`Core`] owns all state of the capability object model: the heap, the
//! thread table and the boot configuration. It is built once by
//! [`Kernel::boot`](crate::Kernel::boot) and passed explicitly to every
//! operation; there is no global kernel state.
//!
//! ## Relocation
//!
//! Every heap allocation goes through [`Core::heap_alloc`], which hands the
//! heap a [`CoreRelocator`]. When a heap-managed object moves, the relocator
//! rewrites the `resource` field of every capability in the owner's
//! resource list and, for thread objects, the thread table entry.

use kaal_heap::{Heap, HeapAddr, HeapError, Relocator};
use log::{debug, error, info, trace};

use crate::config::KernelConfig;
use crate::cspace::{locate, read_slot};
use crate::error::{KernelError, Result};
use crate::objects::cnode::node_object_size;
use crate::objects::endpoint::ENDPOINT_OBJECT_SIZE;
use crate::objects::tcb::THREAD_OBJECT_SIZE;
use crate::objects::{
    CapAddress, CapFlags, Capability, EndpointObject, KernelHeap, NodeHeader, ObjectKind, Tcb,
    ThreadId, ThreadTable,
};

/// Something collaborators must hear about, queued during an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A thread object was destroyed
    ThreadDestroyed(ThreadId),
    /// An endpoint was destroyed with threads still waiting on it
    EndpointDestroyed { endpoint: HeapAddr, waiters: Vec<ThreadId> },
    /// The heap moved an object
    Moved { kind: ObjectKind, old: HeapAddr, new: HeapAddr },
}

/// Capability object model state
#[derive(Debug)]
pub struct Core {
    pub(crate) heap: KernelHeap,
    pub(crate) threads: ThreadTable,
    pub(crate) config: KernelConfig,
    pub(crate) events: Vec<CoreEvent>,
    /// Thread capabilities awaiting teardown during a delete
    pub(crate) dying_threads: Vec<Capability>,
    console: Vec<u8>,
    line: Vec<u8>,
}

impl Core {
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let heap = Heap::new(config.heap_size)?;
        Ok(Self {
            heap,
            threads: ThreadTable::new(),
            config,
            events: Vec::new(),
            dying_threads: Vec::new(),
            console: Vec::new(),
            line: Vec::new(),
        })
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Everything written to the debug console so far
    pub fn console(&self) -> &[u8] {
        &self.console
    }

    pub(crate) fn take_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Allocate a pinned, zeroed heap block, fixing up capabilities of any
    /// object the heap moves to make room
    pub fn heap_alloc(&mut self, size: usize) -> Result<HeapAddr> {
        let Core { heap, threads, events, .. } = self;
        let mut relocator = CoreRelocator { threads, events };
        Ok(heap.alloc(size, &mut relocator)?)
    }

    /// Allocate a pinned node object of `2^slot_bits` empty slots
    pub fn alloc_node(&mut self, slot_bits: u8) -> Result<HeapAddr> {
        let header = NodeHeader::new(slot_bits)?;
        let node = self.heap_alloc(node_object_size(slot_bits)?)?;
        header.write(&mut self.heap, node)?;
        Ok(node)
    }

    /// Allocate a pinned thread object and enter it in the thread table
    pub fn create_thread(&mut self, priority: u8) -> Result<(ThreadId, HeapAddr)> {
        let object = self.heap_alloc(THREAD_OBJECT_SIZE)?;
        let tid = self.threads.allocate_id();
        let setup = Tcb::new(tid, priority)
            .write(&mut self.heap, object)
            .and_then(|()| self.threads.insert(tid, object));
        if let Err(err) = setup {
            self.heap.free(object)?;
            return Err(err);
        }
        debug!("core: thread {} at {}", tid.0, object);
        Ok((tid, object))
    }

    pub fn tcb(&self, tid: ThreadId) -> Result<Tcb> {
        let object = self.threads.get(tid).ok_or(KernelError::NoCapability)?;
        Tcb::read(&self.heap, object)
    }

    pub fn write_tcb(&mut self, tcb: &Tcb) -> Result<()> {
        let object = self.threads.get(tcb.tid).ok_or(KernelError::NoCapability)?;
        tcb.write(&mut self.heap, object)
    }

    pub fn write_endpoint(&mut self, endpoint: HeapAddr, object: &EndpointObject) -> Result<()> {
        object.write(&mut self.heap, endpoint)
    }

    /// Create an object of `kind` and install its original capability at
    /// `dest`
    ///
    /// `size` is the payload size for untyped memory and the slot bits for a
    /// node; other kinds have a fixed size. The destination is checked
    /// before anything is allocated, and a failure after allocation frees
    /// the new object again.
    pub fn alloc_object(
        &mut self,
        kind: ObjectKind,
        size: u64,
        dest: &CapAddress,
        priority: u8,
    ) -> Result<CapAddress> {
        self.with_slot(dest, |core, located| {
            if !core.read_cap(located.slot)?.is_empty() {
                return Err(KernelError::CapabilityExists);
            }
            if kind == ObjectKind::Node
                && located.nesting.map_or(0, |n| n + 1) > core.config.max_nesting
            {
                return Err(KernelError::TooMuchNesting);
            }

            let mut thread = None;
            let object = match kind {
                ObjectKind::Untyped => {
                    let size = usize::try_from(size).map_err(|_| KernelError::InvalidArgument)?;
                    core.heap_alloc(size)?
                }
                ObjectKind::Node => {
                    let slot_bits = u8::try_from(size).map_err(|_| KernelError::InvalidArgument)?;
                    core.alloc_node(slot_bits)?
                }
                ObjectKind::Thread => {
                    let (tid, object) = core.create_thread(priority)?;
                    thread = Some(tid);
                    object
                }
                ObjectKind::Endpoint => core.heap_alloc(ENDPOINT_OBJECT_SIZE)?,
                ObjectKind::AddressSpace | ObjectKind::Debug => {
                    return Err(KernelError::NotSupported)
                }
            };

            match core.populate(&located.address, object, kind, CapFlags::HEAP_MANAGED) {
                Ok(address) => {
                    core.heap.unpin(object)?;
                    debug!("core: alloc {:?} ({}) at {} -> {}", kind, size, object, address);
                    Ok(address)
                }
                Err(err) => {
                    if let Some(tid) = thread {
                        core.threads.remove(tid);
                    }
                    core.heap.free(object)?;
                    Err(err)
                }
            }
        })
    }

    /// Debug console output; complete lines are logged
    pub fn put_char(&mut self, byte: u8) {
        self.console.push(byte);
        if byte == b'\n' {
            info!("console: {}", String::from_utf8_lossy(&self.line));
            self.line.clear();
        } else {
            self.line.push(byte);
        }
    }
}

/// Relocator that keeps capabilities and the thread table current
pub struct CoreRelocator<'a> {
    threads: &'a mut ThreadTable,
    events: &'a mut Vec<CoreEvent>,
}

impl CoreRelocator<'_> {
    fn fix_up(
        &mut self,
        heap: &mut KernelHeap,
        owner: &CapAddress,
        old: HeapAddr,
        new: HeapAddr,
    ) -> Result<ObjectKind> {
        if let Some(tid) = self.threads.relocate(old, new) {
            trace!("core: thread {} object {} -> {}", tid.0, old, new);
        }

        let mut kind = None;
        let mut cursor = Some(*owner);
        while let Some(addr) = cursor {
            let located = locate(heap, self.threads, &addr)?;
            let mut cap = read_slot(heap, located.slot)?;
            if cap.is_empty() || cap.resource != old {
                error!("core: {} in resource list of {} does not name {}", addr, owner, old);
                return Err(KernelError::Corrupted);
            }
            cap.resource = new;
            heap.write(located.slot, &cap.encode()?)?;
            kind = cap.kind();
            cursor = cap.res_next;
        }
        kind.ok_or(KernelError::Corrupted)
    }
}

impl Relocator<CapAddress> for CoreRelocator<'_> {
    fn relocated(
        &mut self,
        heap: &mut KernelHeap,
        owner: &CapAddress,
        old: HeapAddr,
        new: HeapAddr,
    ) -> kaal_heap::Result<()> {
        match self.fix_up(heap, owner, old, new) {
            Ok(kind) => {
                debug!("core: {:?} owned by {} moved {} -> {}", kind, owner, old, new);
                self.events.push(CoreEvent::Moved { kind, old, new });
                Ok(())
            }
            Err(err) => {
                error!("core: relocating {} for {}: {}", old, owner, err);
                Err(HeapError::Corrupted {
                    offset: old.raw() as usize,
                    reason: "capability fix-up failed",
                })
            }
        }
    }

    fn rolled_back(&mut self, owner: &CapAddress, current: HeapAddr, restored: HeapAddr) {
        trace!("core: rollback of {} {} -> {}", owner, current, restored);
        self.threads.relocate(current, restored);
        if let Some(index) = self.events.iter().rposition(
            |event| matches!(event, CoreEvent::Moved { old, new, .. } if *old == restored && *new == current),
        ) {
            self.events.remove(index);
        }
    }
}
