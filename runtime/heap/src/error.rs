//! Heap error types

use thiserror::Error;

use crate::HeapAddr;

/// Heap allocator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid size (must be > 0)")]
    InvalidSize,

    #[error("Invalid heap handle {addr}")]
    InvalidHandle { addr: HeapAddr },

    #[error("Access of {len} bytes at {addr} is outside the arena")]
    OutOfBounds { addr: HeapAddr, len: usize },

    #[error("Heap corrupted at offset {offset:#x}: {reason}")]
    Corrupted { offset: usize, reason: &'static str },
}

pub type Result<T> = core::result::Result<T, HeapError>;
