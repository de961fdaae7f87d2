//! Block Headers
//!
//! Every block in the arena starts with a 16-byte stamp:
//!
//! ```text
//! +--------+--------+----------------+
//! | id u32 | magic  | size u64       |
//! +--------+--------+----------------+
//! | payload ...                      |
//! ```
//!
//! The stamp lets a payload address be mapped back to its block in O(1) and
//! rejected when it does not name a live block. Everything else about a
//! block (kind, relocation target, list links) lives in a side table
//! indexed by the block id, so links are ids and never raw addresses.

use static_assertions::const_assert;

use crate::relocation::RelocationTarget;
use crate::HeapAddr;

/// Size of the in-arena block stamp
pub const HEADER_SIZE: usize = 16;

/// Block size granularity
pub const ALIGN: usize = 8;

/// Smallest block worth splitting off (header plus one aligned word)
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + ALIGN;

const BLOCK_MAGIC: u32 = 0x4B48_4550;

const_assert!(ALIGN.is_power_of_two());
const_assert!(HEADER_SIZE % ALIGN == 0);

/// Index of a block in the side table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(pub(crate) u32);

impl BlockId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocation state of a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Available for allocation
    Free,
    /// Allocated and must not move
    Pinned,
    /// Allocated, may be moved by the next allocation
    Relocatable,
}

/// Side-table entry for one block
#[derive(Clone, Debug)]
pub(crate) struct BlockHeader<C> {
    /// Arena offset of the stamp
    pub offset: usize,
    /// Total size including the stamp
    pub size: usize,
    pub kind: BlockKind,
    pub target: RelocationTarget<C>,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}

impl<C> BlockHeader<C> {
    pub(crate) fn free(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            kind: BlockKind::Free,
            target: RelocationTarget::None,
            prev: None,
            next: None,
        }
    }

    #[inline]
    pub(crate) fn payload(&self) -> HeapAddr {
        HeapAddr::new((self.offset + HEADER_SIZE) as u64)
    }

    #[inline]
    pub(crate) fn usable(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// Public view of a block, as yielded by [`Heap::blocks`](crate::Heap::blocks)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address (only a valid handle when the block is allocated)
    pub addr: HeapAddr,
    /// Usable payload bytes
    pub size: usize,
    pub kind: BlockKind,
}

pub(crate) fn encode_stamp(id: BlockId, size: usize) -> [u8; HEADER_SIZE] {
    let mut stamp = [0u8; HEADER_SIZE];
    stamp[0..4].copy_from_slice(&id.0.to_le_bytes());
    stamp[4..8].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
    stamp[8..16].copy_from_slice(&(size as u64).to_le_bytes());
    stamp
}

pub(crate) fn decode_stamp(bytes: &[u8]) -> Option<(BlockId, usize)> {
    let id = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let magic = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    let size = u64::from_le_bytes(bytes.get(8..16)?.try_into().ok()?);
    if magic != BLOCK_MAGIC {
        return None;
    }
    Some((BlockId(id), usize::try_from(size).ok()?))
}

/// Round `size` up to the block granularity
#[inline]
pub(crate) fn align_up(size: usize) -> Option<usize> {
    size.checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}
