//! Allocation transactions
//!
//! The first relocation of a top-level allocation opens a transaction: a
//! snapshot of the block table plus an undo log of every arena write that
//! follows. Committing drops the log. Rolling back replays the undo log
//! backwards, restores the table and hands the move journal back to the
//! heap so out-of-arena targets can be rewound.
//!
//! Nested allocations that try several runs take a savepoint first, so a
//! failed attempt can be unwound without abandoning the whole transaction.

use crate::block::{BlockHeader, BlockId};
use crate::relocation::RelocationTarget;
use crate::HeapAddr;

/// A block move performed inside a transaction
pub(crate) struct Move<C> {
    pub old: HeapAddr,
    pub new: HeapAddr,
    pub target: RelocationTarget<C>,
}

/// Transaction state at the start of a nested attempt
pub(crate) struct Savepoint<C> {
    pub blocks: Vec<Option<BlockHeader<C>>>,
    pub free_ids: Vec<BlockId>,
    pub first: Option<BlockId>,
    undo: usize,
    moves: usize,
}

pub(crate) struct Transaction<C> {
    pub blocks: Vec<Option<BlockHeader<C>>>,
    pub free_ids: Vec<BlockId>,
    pub first: Option<BlockId>,
    pub undo: Vec<(usize, Vec<u8>)>,
    pub moves: Vec<Move<C>>,
}

impl<C: Clone> Transaction<C> {
    pub(crate) fn begin(
        blocks: &[Option<BlockHeader<C>>],
        free_ids: &[BlockId],
        first: Option<BlockId>,
    ) -> Self {
        Self {
            blocks: blocks.to_vec(),
            free_ids: free_ids.to_vec(),
            first,
            undo: Vec::new(),
            moves: Vec::new(),
        }
    }

    /// Remember the bytes about to be overwritten at `offset`
    pub(crate) fn record_write(&mut self, offset: usize, previous: &[u8]) {
        self.undo.push((offset, previous.to_vec()));
    }

    pub(crate) fn record_move(&mut self, old: HeapAddr, new: HeapAddr, target: RelocationTarget<C>) {
        self.moves.push(Move { old, new, target });
    }

    pub(crate) fn savepoint(
        &self,
        blocks: &[Option<BlockHeader<C>>],
        free_ids: &[BlockId],
        first: Option<BlockId>,
    ) -> Savepoint<C> {
        Savepoint {
            blocks: blocks.to_vec(),
            free_ids: free_ids.to_vec(),
            first,
            undo: self.undo.len(),
            moves: self.moves.len(),
        }
    }

    /// Detach the writes and moves recorded after `savepoint`
    pub(crate) fn unwind_to(
        &mut self,
        savepoint: &Savepoint<C>,
    ) -> (Vec<(usize, Vec<u8>)>, Vec<Move<C>>) {
        (self.undo.split_off(savepoint.undo), self.moves.split_off(savepoint.moves))
    }
}
