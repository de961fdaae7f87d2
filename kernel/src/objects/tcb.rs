//! Thread Control Block (TCB) Implementation
//!
//! A thread object is a heap block holding the encoded control block
//! followed by the thread's root capability slot:
//!
//! ```text
//! +---------------------------+------------------+
//! | Tcb (bincode, 256 bytes)  | root slot (cap)  |
//! +---------------------------+------------------+
//! ```
//!
//! Threads are found through the [`ThreadTable`], which maps a thread id to
//! the object's current heap address and is kept current when the heap
//! moves the object.
//!
//! ## Thread Lifecycle
//!
//! ```text
//! Inactive → Runnable → BlockedOnSend / BlockedOnReceive → Runnable
//!    ↑           │
//!    └───────────┘ (suspend / resume)
//! ```

use kaal_heap::HeapAddr;
use serde::{Deserialize, Serialize};

use super::{codec, CapAddress, KernelHeap};
use crate::config::{CAP_SLOT_SIZE, NUM_MSG_REGISTERS, THREAD_BUCKETS};
use crate::error::{KernelError, Result};

use bincode::Options;

/// Bytes reserved for the encoded control block
pub const TCB_CONTROL_SIZE: usize = 256;

/// Size of a thread object
pub const THREAD_OBJECT_SIZE: usize = TCB_CONTROL_SIZE + CAP_SLOT_SIZE;

/// Thread identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Thread-table bucket this id hashes to
    #[inline]
    pub fn bucket(self) -> u16 {
        (self.0 as usize % THREAD_BUCKETS) as u16
    }
}

/// Thread execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Not scheduled (new or suspended)
    Inactive,
    /// Ready to run
    Runnable,
    /// Waiting for a receiver on an endpoint
    BlockedOnSend,
    /// Waiting for a sender on an endpoint
    BlockedOnReceive,
}

/// Pending IPC of a blocked thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcState {
    /// Message word of a blocked sender
    pub message: u64,
    /// Badge of the endpoint capability the sender used
    pub badge: u64,
    /// Capability a blocked sender transfers
    pub transfer: Option<CapAddress>,
    /// Where a blocked receiver accepts a capability
    pub receive_slot: Option<CapAddress>,
    /// Error code of the last blocking operation (0 = success)
    pub result: u64,
}

/// Thread control block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tcb {
    pub tid: ThreadId,
    /// Scheduling priority (0 = highest)
    pub priority: u8,
    pub state: ThreadState,
    /// Message registers
    pub registers: [u64; NUM_MSG_REGISTERS],
    pub ipc: IpcState,
}

impl Tcb {
    pub fn new(tid: ThreadId, priority: u8) -> Self {
        Self {
            tid,
            priority,
            state: ThreadState::Inactive,
            registers: [0; NUM_MSG_REGISTERS],
            ipc: IpcState::default(),
        }
    }

    pub fn read(heap: &KernelHeap, object: HeapAddr) -> Result<Self> {
        let bytes = heap.read(object, TCB_CONTROL_SIZE)?;
        Ok(codec().deserialize(bytes)?)
    }

    pub fn write(&self, heap: &mut KernelHeap, object: HeapAddr) -> Result<()> {
        let bytes = codec().serialize(self)?;
        if bytes.len() > TCB_CONTROL_SIZE {
            return Err(KernelError::Corrupted);
        }
        heap.write(object, &bytes)?;
        Ok(())
    }

    /// Heap address of the root slot of the thread object at `object`
    #[inline]
    pub fn root_slot(object: HeapAddr) -> HeapAddr {
        object.offset(TCB_CONTROL_SIZE)
    }
}

/// Hash table from thread id to thread object
#[derive(Debug)]
pub struct ThreadTable {
    buckets: Vec<Vec<(ThreadId, HeapAddr)>>,
    next_tid: u32,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    pub fn new() -> Self {
        Self { buckets: vec![Vec::new(); THREAD_BUCKETS], next_tid: 1 }
    }

    /// Hand out a fresh thread id
    pub fn allocate_id(&mut self) -> ThreadId {
        loop {
            let tid = ThreadId(self.next_tid);
            self.next_tid = self.next_tid.wrapping_add(1).max(1);
            if self.get(tid).is_none() {
                return tid;
            }
        }
    }

    pub fn insert(&mut self, tid: ThreadId, object: HeapAddr) -> Result<()> {
        if self.get(tid).is_some() {
            return Err(KernelError::FileExists);
        }
        self.buckets[tid.bucket() as usize].push((tid, object));
        Ok(())
    }

    pub fn get(&self, tid: ThreadId) -> Option<HeapAddr> {
        self.lookup(tid, tid.bucket())
    }

    /// Look up with an explicit bucket, as carried by a capability address
    pub fn lookup(&self, tid: ThreadId, bucket: u16) -> Option<HeapAddr> {
        if bucket != tid.bucket() {
            return None;
        }
        self.buckets[bucket as usize]
            .iter()
            .find(|(id, _)| *id == tid)
            .map(|(_, object)| *object)
    }

    pub fn remove(&mut self, tid: ThreadId) -> Option<HeapAddr> {
        let bucket = &mut self.buckets[tid.bucket() as usize];
        let index = bucket.iter().position(|(id, _)| *id == tid)?;
        Some(bucket.swap_remove(index).1)
    }

    /// Point the entry for the object at `old` to `new`
    pub fn relocate(&mut self, old: HeapAddr, new: HeapAddr) -> Option<ThreadId> {
        self.buckets.iter_mut().flatten().find(|(_, object)| *object == old).map(|entry| {
            entry.1 = new;
            entry.0
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, HeapAddr)> + '_ {
        self.buckets.iter().flatten().copied()
    }
}
