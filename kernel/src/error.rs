//! Kernel error codes
//!
//! Every core operation returns [`Result`]. At the syscall boundary errors
//! become small positive integers via [`KernelError::code`], with 0 meaning
//! success.

use kaal_heap::HeapError;
use log::error;
use thiserror::Error;

/// Errors surfaced by capability and object operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    #[error("no capability at the given address")]
    NoCapability,

    #[error("operation not supported")]
    NotSupported,

    #[error("invalid capability for this operation")]
    InvalidCapability,

    #[error("capability nodes nested too deeply")]
    TooMuchNesting,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("permission denied")]
    PermissionDenied,

    #[error("out of memory")]
    OutOfMemory,

    #[error("destination slot already holds a capability")]
    CapabilityExists,

    #[error("object already exists")]
    FileExists,

    #[error("malformed message")]
    BadMessage,

    /// Kernel data structures are inconsistent (a kernel bug)
    #[error("kernel state corrupted")]
    Corrupted,
}

impl KernelError {
    /// Syscall ABI error number
    pub const fn code(self) -> u64 {
        match self {
            KernelError::NoCapability => 1,
            KernelError::NotSupported => 2,
            KernelError::InvalidCapability => 3,
            KernelError::TooMuchNesting => 4,
            KernelError::InvalidArgument => 5,
            KernelError::PermissionDenied => 6,
            KernelError::OutOfMemory => 7,
            KernelError::CapabilityExists => 8,
            KernelError::FileExists => 9,
            KernelError::BadMessage => 10,
            KernelError::Corrupted => 11,
        }
    }

    /// Inverse of [`code`](Self::code); 0 and unknown numbers give `None`
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => KernelError::NoCapability,
            2 => KernelError::NotSupported,
            3 => KernelError::InvalidCapability,
            4 => KernelError::TooMuchNesting,
            5 => KernelError::InvalidArgument,
            6 => KernelError::PermissionDenied,
            7 => KernelError::OutOfMemory,
            8 => KernelError::CapabilityExists,
            9 => KernelError::FileExists,
            10 => KernelError::BadMessage,
            11 => KernelError::Corrupted,
            _ => return None,
        })
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::OutOfMemory { .. } => KernelError::OutOfMemory,
            HeapError::InvalidSize
            | HeapError::InvalidHandle { .. }
            | HeapError::OutOfBounds { .. } => KernelError::InvalidArgument,
            HeapError::Corrupted { .. } => KernelError::Corrupted,
        }
    }
}

impl From<bincode::Error> for KernelError {
    fn from(err: bincode::Error) -> Self {
        error!("object codec: {}", err);
        KernelError::Corrupted
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Result of a syscall as seen by user space: `(code, value)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallReturn {
    pub code: u64,
    pub value: u64,
}

impl From<Result<u64>> for SyscallReturn {
    fn from(result: Result<u64>) -> Self {
        match result {
            Ok(value) => SyscallReturn { code: 0, value },
            Err(err) => SyscallReturn { code: err.code(), value: 0 },
        }
    }
}
