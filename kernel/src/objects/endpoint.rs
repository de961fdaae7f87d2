//! Endpoint Object Implementation
//!
//! Endpoints are rendezvous points for synchronous IPC. An endpoint object
//! holds two wait queues of thread ids:
//!
//! ```text
//! Endpoint
//!   ├─ senders:   [t1] → [t2] → [t3]
//!   └─ receivers: [t4] → [t5]
//! ```
//!
//! At most one queue is non-empty at a time: a sender arriving while a
//! receiver waits completes the rendezvous instead of queueing. The
//! rendezvous itself lives in [`crate::ipc`]; this module only owns the
//! queue state stored in the heap block.

use std::collections::VecDeque;

use kaal_heap::HeapAddr;
use log::warn;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use super::{codec, KernelHeap, ThreadId};
use crate::config::ENDPOINT_QUEUE_CAPACITY;
use crate::error::{KernelError, Result};

use bincode::Options;

/// Encoded size of an endpoint with both queues full
pub const ENDPOINT_OBJECT_SIZE: usize = 2 * (8 + 4 * ENDPOINT_QUEUE_CAPACITY);

const_assert!(ENDPOINT_OBJECT_SIZE % 8 == 0);

/// Wait queues of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointObject {
    /// Threads blocked in send, oldest first
    pub senders: VecDeque<ThreadId>,
    /// Threads blocked in receive, oldest first
    pub receivers: VecDeque<ThreadId>,
}

impl EndpointObject {
    pub fn read(heap: &KernelHeap, object: HeapAddr) -> Result<Self> {
        let bytes = heap.read(object, ENDPOINT_OBJECT_SIZE)?;
        Ok(codec().deserialize(bytes)?)
    }

    pub fn write(&self, heap: &mut KernelHeap, object: HeapAddr) -> Result<()> {
        let bytes = codec().serialize(self)?;
        if bytes.len() > ENDPOINT_OBJECT_SIZE {
            return Err(KernelError::Corrupted);
        }
        // Clear the tail so a shrinking queue leaves no stale ids behind.
        heap.zero(object, ENDPOINT_OBJECT_SIZE)?;
        heap.write(object, &bytes)?;
        Ok(())
    }

    pub fn enqueue_sender(&mut self, tid: ThreadId) -> Result<()> {
        Self::enqueue(&mut self.senders, tid)
    }

    pub fn enqueue_receiver(&mut self, tid: ThreadId) -> Result<()> {
        Self::enqueue(&mut self.receivers, tid)
    }

    fn enqueue(queue: &mut VecDeque<ThreadId>, tid: ThreadId) -> Result<()> {
        if queue.len() >= ENDPOINT_QUEUE_CAPACITY {
            warn!("endpoint: wait queue full, rejecting thread {}", tid.0);
            return Err(KernelError::OutOfMemory);
        }
        queue.push_back(tid);
        Ok(())
    }

    /// Drop `tid` from both queues
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        let before = self.senders.len() + self.receivers.len();
        self.senders.retain(|t| *t != tid);
        self.receivers.retain(|t| *t != tid);
        before != self.senders.len() + self.receivers.len()
    }

    /// Every waiting thread, senders first
    pub fn waiters(&self) -> Vec<ThreadId> {
        self.senders.iter().chain(self.receivers.iter()).copied().collect()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.senders.is_empty() && self.receivers.is_empty()
    }
}
