//! Scheduler - thread selection
//!
//! The kernel core never picks threads itself. It consumes the [`Scheduler`]
//! trait: "who is running", "make runnable", "stop running". Blocking IPC and
//! thread destruction drive it through that trait.
//!
//! ## Architecture
//!
//! [`PriorityScheduler`] uses **fixed-priority scheduling** with
//! **round-robin** within each priority level:
//!
//! - 256 priority levels (0 = highest, 255 = lowest)
//! - O(1) level selection via priority bitmap
//! - Explicit yield points (no automatic preemption)
//!
//! ## Usage
//!
//! ```rust
//! use kaal_core::scheduler::{PriorityScheduler, Scheduler};
//! use kaal_core::objects::ThreadId;
//!
//! let mut sched = PriorityScheduler::new();
//! sched.resume(ThreadId(1), 128);
//! assert_eq!(sched.current_thread(), Some(ThreadId(1)));
//!
//! sched.block(ThreadId(1));
//! assert_eq!(sched.current_thread(), None);
//! ```

mod types;

pub use types::{PriorityScheduler, NUM_PRIORITIES};

use crate::objects::ThreadId;

/// Thread-selection primitives consumed by the kernel core
pub trait Scheduler {
    /// Thread whose capability space `invoke` resolves against
    fn current_thread(&self) -> Option<ThreadId>;

    /// Make `tid` runnable (no-op if it already is)
    fn resume(&mut self, tid: ThreadId, priority: u8);

    /// Take `tid` off the CPU and out of the ready queues
    fn suspend(&mut self, tid: ThreadId);

    /// Like `suspend`, for a thread waiting on IPC
    fn block(&mut self, tid: ThreadId);

    /// Forget `tid`; its object is gone
    fn thread_destroyed(&mut self, tid: ThreadId);
}
