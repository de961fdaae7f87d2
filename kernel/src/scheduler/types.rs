//! Scheduler Types
//!
//! Ready queues and the priority bitmap behind [`PriorityScheduler`].

use std::collections::{HashMap, VecDeque};

use log::{debug, trace, warn};

use super::Scheduler;
use crate::objects::ThreadId;

/// Number of priority levels (0 = highest, 255 = lowest)
pub const NUM_PRIORITIES: usize = 256;

/// Fixed-priority, round-robin within a level
///
/// The current thread is not kept in a ready queue; it is replaced when it
/// blocks, suspends, yields or is destroyed.
#[derive(Debug)]
pub struct PriorityScheduler {
    /// Ready queues per priority level
    ready_queues: Vec<VecDeque<ThreadId>>,

    /// Priority of every thread known to the scheduler
    priorities: HashMap<ThreadId, u8>,

    current: Option<ThreadId>,

    /// Priority bitmap for O(1) lookup
    ///
    /// Divided into 4 x u64 = 256 bits total.
    /// priority_bitmap[0] covers priorities 0-63, [1] 64-127, and so on.
    /// Within a word, priority `p` is bit `63 - p % 64`.
    priority_bitmap: [u64; 4],
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            ready_queues: vec![VecDeque::new(); NUM_PRIORITIES],
            priorities: HashMap::new(),
            current: None,
            priority_bitmap: [0; 4],
        }
    }

    /// Threads waiting in the ready queues
    pub fn ready_len(&self) -> usize {
        self.ready_queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_ready(&self, tid: ThreadId) -> bool {
        self.priorities
            .get(&tid)
            .is_some_and(|&p| self.ready_queues[p as usize].contains(&tid))
    }

    /// Put the current thread at the back of its level and pick again
    pub fn yield_current(&mut self) -> Option<ThreadId> {
        if let Some(tid) = self.current.take() {
            self.enqueue(tid);
        }
        self.current = self.schedule();
        self.current
    }

    /// Add thread to the tail of its ready queue
    fn enqueue(&mut self, tid: ThreadId) {
        let Some(&priority) = self.priorities.get(&tid) else {
            warn!("sched: enqueue of unknown thread {}", tid.0);
            return;
        };
        self.ready_queues[priority as usize].push_back(tid);
        self.set_priority_bit(priority);
    }

    /// Remove thread from its ready queue
    fn dequeue(&mut self, tid: ThreadId) -> bool {
        let Some(&priority) = self.priorities.get(&tid) else {
            return false;
        };
        let queue = &mut self.ready_queues[priority as usize];
        let Some(index) = queue.iter().position(|t| *t == tid) else {
            return false;
        };
        queue.remove(index);
        if queue.is_empty() {
            self.clear_priority_bit(priority);
        }
        true
    }

    /// Pop the highest-priority ready thread
    fn schedule(&mut self) -> Option<ThreadId> {
        let priority = self.find_highest_priority()?;
        let queue = &mut self.ready_queues[priority as usize];
        let tid = queue.pop_front();
        if queue.is_empty() {
            self.clear_priority_bit(priority);
        }
        tid
    }

    /// Stop running `tid` if it is current, otherwise drop it from the queues
    fn deschedule(&mut self, tid: ThreadId) {
        if self.current == Some(tid) {
            self.current = self.schedule();
            debug!("sched: {} off cpu, next {:?}", tid.0, self.current);
        } else {
            self.dequeue(tid);
        }
    }

    /// Find the highest priority level with runnable threads
    fn find_highest_priority(&self) -> Option<u8> {
        self.priority_bitmap
            .iter()
            .enumerate()
            .find(|(_, &chunk)| chunk != 0)
            .map(|(chunk_idx, chunk)| (chunk_idx * 64 + chunk.leading_zeros() as usize) as u8)
    }

    fn set_priority_bit(&mut self, priority: u8) {
        let priority = priority as usize;
        self.priority_bitmap[priority / 64] |= 1u64 << (63 - priority % 64);
    }

    fn clear_priority_bit(&mut self, priority: u8) {
        let priority = priority as usize;
        self.priority_bitmap[priority / 64] &= !(1u64 << (63 - priority % 64));
    }
}

impl Scheduler for PriorityScheduler {
    fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    fn resume(&mut self, tid: ThreadId, priority: u8) {
        if self.current == Some(tid) || self.is_ready(tid) {
            return;
        }
        self.priorities.insert(tid, priority);
        if self.current.is_none() {
            trace!("sched: {} runs immediately", tid.0);
            self.current = Some(tid);
        } else {
            self.enqueue(tid);
        }
    }

    fn suspend(&mut self, tid: ThreadId) {
        self.deschedule(tid);
    }

    fn block(&mut self, tid: ThreadId) {
        self.deschedule(tid);
    }

    fn thread_destroyed(&mut self, tid: ThreadId) {
        self.deschedule(tid);
        self.priorities.remove(&tid);
    }
}
