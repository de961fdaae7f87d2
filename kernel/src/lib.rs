//! KaaL Core - capability object model on a relocating heap
//!
//! # Purpose
//! Names and protects every kernel resource through capabilities held in a
//! tree of capability nodes, with every object living in the relocating
//! [`kaal_heap`] arena. The heap may move any unpinned object; the core
//! keeps every capability pointing at the right place.
//!
//! # Integration Points
//! - Depends on: `kaal-heap` for object storage and relocation
//! - Consumes: a [`Scheduler`] ("current thread", resume/suspend/block) and
//!   an [`EndpointIpc`] implementation for endpoint send/receive
//! - Provides: [`Kernel::invoke`], the single entry point for user code
//!
//! # Architecture
//! - `objects`: object kinds, capability records, per-kind layouts
//! - `cspace`: lookup, populate/copy/move/delete/revoke, list maintenance
//! - `context`: the [`Core`] state and the relocation fix-up
//! - `kernel`: boot, invocation, event forwarding
//! - `scheduler`, `ipc`: collaborator traits and default implementations
//!
//! # Testing Strategy
//! - Unit tests next to each module
//! - Integration tests driving [`Kernel::invoke`] in `tests/`
//! - Property tests for rights and badge propagation
//!
//! # Example
//!
//! ```
//! use kaal_core::{ipc::Rendezvous, scheduler::PriorityScheduler, Kernel, KernelConfig};
//!
//! let mut kernel = Kernel::boot(KernelConfig::default(), PriorityScheduler::new(), Rendezvous)?;
//! let tid = kernel.boot_thread();
//!
//! // Allocate 64 bytes of untyped memory into slot 5 of the root node.
//! kernel.set_registers(tid, &[0, 5, 4])?;
//! kernel.invoke(0, 4, 0, 64)?;
//! assert!(kernel.invoke(5, 4, 3, 0)? >= 64);
//! # Ok::<(), kaal_core::KernelError>(())
//! ```

pub mod config;
pub mod context;
pub mod cspace;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod objects;
pub mod scheduler;

pub use config::KernelConfig;
pub use context::{Core, CoreEvent};
pub use cspace::{parse_depth, Located, LookedUp};
pub use error::{KernelError, Result, SyscallReturn};
pub use kernel::Kernel;
pub use objects::{CapAddress, CapFlags, CapRights, Capability, ObjectKind, ThreadId};

pub use ipc::EndpointIpc;
pub use scheduler::Scheduler;
