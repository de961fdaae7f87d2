//! Relocating Heap
//!
//! A single flat arena carved into an address-ordered, contiguous list of
//! blocks. Allocation looks for a run of consecutive free or relocatable
//! blocks large enough for the request, moves every relocatable block out of
//! the run, merges the run and splits off the remainder.
//!
//! ## Run selection
//!
//! For every starting block the shortest run that covers the request is a
//! candidate if the relocatable bytes it contains fit in the free bytes
//! outside it. Candidates are tried in order of least relocatable bytes,
//! then fewest blocks, then smallest span. A top-level allocation that
//! runs out of memory while evacuating one candidate rolls back and tries
//! the next.
//!
//! ## Pinning
//!
//! Allocated blocks start out pinned. Unpinned (relocatable) blocks may move
//! on any later allocation, after which their relocation target sees the new
//! address. Payload access goes through `&self`/`&mut self`, so no slice into
//! the arena can be held across an allocation.

use core::fmt;
use core::ops::Range;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::block::{
    align_up, decode_stamp, encode_stamp, BlockHeader, BlockId, BlockInfo, BlockKind, HEADER_SIZE,
    MIN_BLOCK_SIZE, ALIGN,
};
use crate::relocation::{RelocationTarget, Relocator};
use crate::stats::HeapStats;
use crate::transaction::{Move, Savepoint, Transaction};
use crate::{HeapAddr, HeapError, Result};

/// Candidate run for an allocation
#[derive(Debug)]
struct Plan {
    blocks: Vec<BlockId>,
    relocatable: usize,
    span: usize,
}

/// Relocating heap over an owned arena
///
/// `C` is the owner type of capability relocation targets.
pub struct Heap<C> {
    arena: Box<[u8]>,
    blocks: Vec<Option<BlockHeader<C>>>,
    free_ids: Vec<BlockId>,
    first: Option<BlockId>,
    txn: Option<Transaction<C>>,
    /// Allocation nesting (non-zero while evacuating a run)
    depth: usize,
}

impl<C: Clone + fmt::Debug> Heap<C> {
    /// Create a heap over a zeroed arena of `size` bytes
    ///
    /// The size is rounded down to the block granularity.
    ///
    /// # Errors
    /// `InvalidSize` if the arena cannot hold a single block
    pub fn new(size: usize) -> Result<Self> {
        let size = size & !(ALIGN - 1);
        if size < MIN_BLOCK_SIZE {
            return Err(HeapError::InvalidSize);
        }

        let mut heap = Self {
            arena: vec![0u8; size].into_boxed_slice(),
            blocks: Vec::new(),
            free_ids: Vec::new(),
            first: None,
            txn: None,
            depth: 0,
        };
        let id = heap.insert_block(BlockHeader::free(0, size));
        heap.first = Some(id);
        heap.stamp(id);

        debug!("heap: created {} byte arena", size);
        Ok(heap)
    }

    /// Arena size in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Allocate a pinned, zeroed block of at least `size` usable bytes
    ///
    /// May move relocatable blocks; capability targets of moved blocks are
    /// reported to `relocator`. If the allocation fails after moving
    /// anything, every move is undone before the error is returned.
    ///
    /// # Errors
    /// - `InvalidSize` for zero-sized requests
    /// - `OutOfMemory` if no run can be assembled
    /// - whatever `relocator` returns
    pub fn alloc(&mut self, size: usize, relocator: &mut dyn Relocator<C>) -> Result<HeapAddr> {
        let need = Self::block_size(size)?;

        if self.depth > 0 {
            let id = self.claim_nested(need, relocator)?;
            return Ok(self.hdr(id).payload());
        }

        let plans = self.plan(need);
        if plans.is_empty() {
            debug!("heap: alloc({}) out of memory", size);
            return Err(HeapError::OutOfMemory { requested: size });
        }

        self.depth = 1;
        let mut result = Err(HeapError::OutOfMemory { requested: size });
        for plan in plans {
            match self.claim(plan, need, relocator) {
                Ok(id) => {
                    self.commit();
                    result = Ok(self.hdr(id).payload());
                    break;
                }
                Err(err) => {
                    self.rollback(relocator);
                    let retry = matches!(err, HeapError::OutOfMemory { .. });
                    result = Err(err);
                    if !retry {
                        break;
                    }
                }
            }
        }
        self.depth = 0;

        match result {
            Ok(addr) => {
                debug!("heap: alloc({}) -> {}", size, addr);
                Ok(addr)
            }
            Err(HeapError::OutOfMemory { .. }) => {
                debug!("heap: alloc({}) out of memory after relocation attempts", size);
                Err(HeapError::OutOfMemory { requested: size })
            }
            Err(err) => Err(err),
        }
    }

    /// Release a block and coalesce it with free neighbours
    pub fn free(&mut self, handle: HeapAddr) -> Result<()> {
        let id = self.lookup_block(handle)?;
        {
            let header = self.hdr_mut(id);
            header.kind = BlockKind::Free;
            header.target = RelocationTarget::None;
        }
        debug!("heap: free({})", handle);

        if matches!(self.hdr(id).next, Some(next) if self.hdr(next).kind == BlockKind::Free) {
            self.merge_next(id);
        }
        if let Some(prev) = self.hdr(id).prev {
            if self.hdr(prev).kind == BlockKind::Free {
                self.merge_next(prev);
            }
        }
        Ok(())
    }

    /// Pin a block, returning whether it was already pinned
    pub fn pin(&mut self, handle: HeapAddr) -> Result<bool> {
        let id = self.lookup_block(handle)?;
        let header = self.hdr_mut(id);
        let was_pinned = header.kind == BlockKind::Pinned;
        header.kind = BlockKind::Pinned;
        trace!("heap: pin({}) was_pinned={}", handle, was_pinned);
        Ok(was_pinned)
    }

    /// Make a pinned block relocatable again
    pub fn unpin(&mut self, handle: HeapAddr) -> Result<()> {
        let id = self.lookup_block(handle)?;
        let header = self.hdr_mut(id);
        if header.kind != BlockKind::Pinned {
            error!("heap: unpin({}) of a block that is not pinned", handle);
            debug_assert_eq!(header.kind, BlockKind::Pinned, "unpin of unpinned block {handle}");
            return Ok(());
        }
        header.kind = BlockKind::Relocatable;
        trace!("heap: unpin({})", handle);
        Ok(())
    }

    pub fn is_pinned(&self, handle: HeapAddr) -> Result<bool> {
        let id = self.lookup_block(handle)?;
        Ok(self.hdr(id).kind == BlockKind::Pinned)
    }

    /// Usable payload bytes of a block
    pub fn size_of(&self, handle: HeapAddr) -> Result<usize> {
        let id = self.lookup_block(handle)?;
        Ok(self.hdr(id).usable())
    }

    /// Register an 8-byte arena slot that always holds the block's address
    pub fn set_relocation_absolute(&mut self, handle: HeapAddr, slot: HeapAddr) -> Result<()> {
        self.range(slot, 8)?;
        self.set_target(handle, RelocationTarget::Absolute(slot))
    }

    /// Register a closure called with `(old, new)` whenever the block moves
    pub fn set_relocation_callback<F>(&mut self, handle: HeapAddr, callback: F) -> Result<()>
    where
        F: Fn(HeapAddr, HeapAddr) + Send + Sync + 'static,
    {
        self.set_target(handle, RelocationTarget::Callback(Arc::new(callback)))
    }

    /// Register a capability owner to report moves to
    pub fn set_relocation_capability(&mut self, handle: HeapAddr, owner: C) -> Result<()> {
        self.set_target(handle, RelocationTarget::Capability(owner))
    }

    pub fn clear_relocation(&mut self, handle: HeapAddr) -> Result<()> {
        self.set_target(handle, RelocationTarget::None)
    }

    pub fn relocation_target(&self, handle: HeapAddr) -> Result<&RelocationTarget<C>> {
        let id = self.lookup_block(handle)?;
        Ok(&self.hdr(id).target)
    }

    fn set_target(&mut self, handle: HeapAddr, target: RelocationTarget<C>) -> Result<()> {
        let id = self.lookup_block(handle)?;
        trace!("heap: {} relocation target {:?}", handle, target);
        self.hdr_mut(id).target = target;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------

    /// Whole payload of an allocated block
    pub fn payload(&self, handle: HeapAddr) -> Result<&[u8]> {
        let id = self.lookup_block(handle)?;
        let header = self.hdr(id);
        let start = header.offset + HEADER_SIZE;
        Ok(&self.arena[start..header.offset + header.size])
    }

    pub fn read(&self, addr: HeapAddr, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.arena[range])
    }

    /// Write bytes into the arena
    ///
    /// Writes made during an allocation are undone if it rolls back.
    pub fn write(&mut self, addr: HeapAddr, bytes: &[u8]) -> Result<()> {
        let range = self.range(addr, bytes.len())?;
        self.write_raw(range.start, bytes);
        Ok(())
    }

    pub fn zero(&mut self, addr: HeapAddr, len: usize) -> Result<()> {
        let range = self.range(addr, len)?;
        self.fill_raw(range, 0);
        Ok(())
    }

    pub fn read_u64(&self, addr: HeapAddr) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, addr: HeapAddr, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Blocks in address order
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        core::iter::successors(self.first, move |id| self.hdr(*id).next).map(move |id| {
            let header = self.hdr(id);
            BlockInfo { addr: header.payload(), size: header.usable(), kind: header.kind }
        })
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats { total: self.arena.len(), ..HeapStats::default() };
        let mut cursor = self.first;
        while let Some(id) = cursor {
            let header = self.hdr(id);
            stats.blocks += 1;
            match header.kind {
                BlockKind::Free => {
                    stats.free += header.size;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(header.size);
                }
                BlockKind::Pinned => stats.pinned += header.size,
                BlockKind::Relocatable => stats.relocatable += header.size,
            }
            cursor = header.next;
        }
        stats.used = stats.pinned + stats.relocatable;
        stats
    }

    /// Check every structural invariant of the block list
    ///
    /// Blocks must be address-ordered and contiguous, cover the whole arena,
    /// carry matching stamps and links, and no two free blocks may touch.
    pub fn validate(&self) -> Result<()> {
        let corrupted = |offset: usize, reason: &'static str| {
            error!("heap: corrupted at {:#x}: {}", offset, reason);
            HeapError::Corrupted { offset, reason }
        };

        let mut expected = 0usize;
        let mut prev: Option<BlockId> = None;
        let mut prev_free = false;
        let mut seen = 0usize;
        let mut cursor = self.first;

        while let Some(id) = cursor {
            let header = self
                .blocks
                .get(id.index())
                .and_then(Option::as_ref)
                .ok_or_else(|| corrupted(expected, "dangling block link"))?;

            if header.offset != expected {
                return Err(corrupted(header.offset, "block not contiguous"));
            }
            if header.prev != prev {
                return Err(corrupted(header.offset, "broken back link"));
            }
            if header.size < MIN_BLOCK_SIZE
                || header.size % ALIGN != 0
                || header.offset + header.size > self.arena.len()
            {
                return Err(corrupted(header.offset, "bad block size"));
            }
            match decode_stamp(&self.arena[header.offset..header.offset + HEADER_SIZE]) {
                Some((stamp_id, stamp_size)) if stamp_id == id && stamp_size == header.size => {}
                _ => return Err(corrupted(header.offset, "bad header stamp")),
            }

            let is_free = header.kind == BlockKind::Free;
            if is_free && prev_free {
                return Err(corrupted(header.offset, "adjacent free blocks"));
            }

            seen += 1;
            if seen > self.blocks.len() {
                return Err(corrupted(header.offset, "cycle in block list"));
            }
            prev_free = is_free;
            expected += header.size;
            prev = Some(id);
            cursor = header.next;
        }

        if expected != self.arena.len() {
            return Err(corrupted(expected, "blocks do not cover the arena"));
        }
        if self.blocks.iter().filter(|slot| slot.is_some()).count() != seen {
            return Err(corrupted(expected, "unreachable block"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation internals
    // ------------------------------------------------------------------

    fn block_size(size: usize) -> Result<usize> {
        if size == 0 {
            return Err(HeapError::InvalidSize);
        }
        align_up(size)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(HeapError::OutOfMemory { requested: size })
    }

    /// Candidate runs for a block of `need` bytes, best first
    fn plan(&self, need: usize) -> Vec<Plan> {
        let order: Vec<(BlockId, usize, BlockKind)> =
            core::iter::successors(self.first, |id| self.hdr(*id).next)
                .map(|id| {
                    let header = self.hdr(id);
                    (id, header.size, header.kind)
                })
                .collect();
        let free_total: usize =
            order.iter().filter(|(_, _, kind)| *kind == BlockKind::Free).map(|(_, size, _)| size).sum();

        let mut plans = Vec::new();
        for start in 0..order.len() {
            let mut span = 0;
            let mut relocatable = 0;
            let mut free_inside = 0;
            for end in start..order.len() {
                let (_, size, kind) = order[end];
                match kind {
                    BlockKind::Pinned => break,
                    BlockKind::Free => free_inside += size,
                    BlockKind::Relocatable => relocatable += size,
                }
                span += size;
                if span >= need {
                    if relocatable <= free_total - free_inside {
                        plans.push(Plan {
                            blocks: order[start..=end].iter().map(|(id, _, _)| *id).collect(),
                            relocatable,
                            span,
                        });
                    }
                    break;
                }
            }
        }

        plans.sort_by_key(|plan| (plan.relocatable, plan.blocks.len(), plan.span));
        trace!("heap: {} candidate runs for {} bytes", plans.len(), need);
        plans
    }

    /// Allocation made while evacuating an outer run
    ///
    /// Runs are tried best first. A run that runs out of memory while
    /// evacuating its own blocks is unwound to a savepoint before the next
    /// one is tried.
    fn claim_nested(&mut self, need: usize, relocator: &mut dyn Relocator<C>) -> Result<BlockId> {
        let mut result = Err(HeapError::OutOfMemory { requested: need - HEADER_SIZE });
        for plan in self.plan(need) {
            let Some(savepoint) = self.savepoint() else {
                return self.claim(plan, need, relocator);
            };
            match self.claim(plan, need, relocator) {
                Ok(id) => return Ok(id),
                Err(err @ HeapError::OutOfMemory { .. }) => {
                    self.rollback_to(savepoint, relocator);
                    result = Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        result
    }

    fn claim(&mut self, plan: Plan, need: usize, relocator: &mut dyn Relocator<C>) -> Result<BlockId> {
        if plan.relocatable > 0 {
            self.begin();
        }

        let moving: Vec<BlockId> = plan
            .blocks
            .iter()
            .copied()
            .filter(|id| self.hdr(*id).kind == BlockKind::Relocatable)
            .collect();

        // Reserve the whole run so nested allocations stay out of it.
        for &id in &plan.blocks {
            self.hdr_mut(id).kind = BlockKind::Pinned;
        }
        for id in moving {
            self.evacuate(id, relocator)?;
        }

        let id = plan.blocks[0];
        for _ in 1..plan.blocks.len() {
            self.merge_next(id);
        }
        {
            let header = self.hdr_mut(id);
            header.kind = BlockKind::Pinned;
            header.target = RelocationTarget::None;
        }
        self.split(id, need);

        let header = self.hdr(id);
        let payload = header.offset + HEADER_SIZE..header.offset + header.size;
        self.fill_raw(payload, 0);
        Ok(id)
    }

    /// Move a reserved relocatable block somewhere outside its run
    fn evacuate(&mut self, id: BlockId, relocator: &mut dyn Relocator<C>) -> Result<()> {
        let (size, old) = {
            let header = self.hdr(id);
            (header.size, header.payload())
        };

        let new_id = self.claim_nested(size, relocator)?;
        let new = self.hdr(new_id).payload();
        self.copy_raw(old.as_usize(), new.as_usize(), size - HEADER_SIZE);

        let target = core::mem::take(&mut self.hdr_mut(id).target);
        {
            let header = self.hdr_mut(new_id);
            header.kind = BlockKind::Relocatable;
            header.target = target.clone();
        }
        debug!("heap: relocated {} -> {} ({} bytes, {:?})", old, new, size - HEADER_SIZE, target);

        if let Some(txn) = self.txn.as_mut() {
            txn.record_move(old, new, target.clone());
        }
        self.notify(&target, old, new, relocator)
    }

    fn notify(
        &mut self,
        target: &RelocationTarget<C>,
        old: HeapAddr,
        new: HeapAddr,
        relocator: &mut dyn Relocator<C>,
    ) -> Result<()> {
        match target {
            RelocationTarget::None => Ok(()),
            RelocationTarget::Absolute(slot) => self.write_u64(*slot, new.raw()),
            RelocationTarget::Callback(callback) => {
                callback(old, new);
                Ok(())
            }
            RelocationTarget::Capability(owner) => relocator.relocated(self, owner, old, new),
        }
    }

    /// Shrink `id` to `need` bytes, returning the tail to the free list
    fn split(&mut self, id: BlockId, need: usize) {
        let (offset, size, next) = {
            let header = self.hdr(id);
            (header.offset, header.size, header.next)
        };
        if size - need < MIN_BLOCK_SIZE {
            self.stamp(id);
            return;
        }

        let mut rest = BlockHeader::free(offset + need, size - need);
        rest.prev = Some(id);
        rest.next = next;
        let rest_id = self.insert_block(rest);
        if let Some(next) = next {
            self.hdr_mut(next).prev = Some(rest_id);
        }
        {
            let header = self.hdr_mut(id);
            header.size = need;
            header.next = Some(rest_id);
        }
        self.stamp(id);
        self.stamp(rest_id);

        if matches!(next, Some(next) if self.hdr(next).kind == BlockKind::Free) {
            self.merge_next(rest_id);
        }
    }

    /// Absorb the block after `id` into `id`
    fn merge_next(&mut self, id: BlockId) {
        let Some(next) = self.hdr(id).next else {
            return;
        };
        let Some(absorbed) = self.remove_block(next) else {
            return;
        };
        if let Some(after) = absorbed.next {
            self.hdr_mut(after).prev = Some(id);
        }
        {
            let header = self.hdr_mut(id);
            header.size += absorbed.size;
            header.next = absorbed.next;
        }
        self.stamp(id);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn begin(&mut self) {
        if self.txn.is_none() {
            trace!("heap: transaction begin");
            self.txn = Some(Transaction::begin(&self.blocks, &self.free_ids, self.first));
        }
    }

    fn commit(&mut self) {
        if let Some(txn) = self.txn.take() {
            trace!("heap: transaction commit ({} moves)", txn.moves.len());
        }
    }

    fn rollback(&mut self, relocator: &mut dyn Relocator<C>) {
        let Some(txn) = self.txn.take() else {
            return;
        };

        self.replay_undo(txn.undo);
        self.blocks = txn.blocks;
        self.free_ids = txn.free_ids;
        self.first = txn.first;

        let moves = Self::rewind_moves(txn.moves, relocator);
        warn!("heap: allocation rolled back ({} relocations undone)", moves);
    }

    fn savepoint(&self) -> Option<Savepoint<C>> {
        let txn = self.txn.as_ref()?;
        Some(txn.savepoint(&self.blocks, &self.free_ids, self.first))
    }

    /// Undo everything recorded since `savepoint`, keeping the transaction open
    fn rollback_to(&mut self, savepoint: Savepoint<C>, relocator: &mut dyn Relocator<C>) {
        let Some((undo, moves)) = self.txn.as_mut().map(|txn| txn.unwind_to(&savepoint)) else {
            return;
        };

        self.replay_undo(undo);
        self.blocks = savepoint.blocks;
        self.free_ids = savepoint.free_ids;
        self.first = savepoint.first;

        let moves = Self::rewind_moves(moves, relocator);
        debug!("heap: nested run abandoned ({} relocations undone)", moves);
    }

    fn replay_undo(&mut self, undo: Vec<(usize, Vec<u8>)>) {
        for (offset, bytes) in undo.into_iter().rev() {
            self.arena[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
    }

    /// Report moves back to their targets, newest first
    fn rewind_moves(moves: Vec<Move<C>>, relocator: &mut dyn Relocator<C>) -> usize {
        let count = moves.len();
        for mv in moves.into_iter().rev() {
            match &mv.target {
                RelocationTarget::Callback(callback) => callback(mv.new, mv.old),
                RelocationTarget::Capability(owner) => relocator.rolled_back(owner, mv.new, mv.old),
                RelocationTarget::Absolute(_) | RelocationTarget::None => {}
            }
        }
        count
    }

    // ------------------------------------------------------------------
    // Block table and arena primitives
    // ------------------------------------------------------------------

    /// Map a payload address to a live allocated block
    fn lookup_block(&self, addr: HeapAddr) -> Result<BlockId> {
        let invalid = || HeapError::InvalidHandle { addr };
        let payload = addr.as_usize();
        if payload < HEADER_SIZE || payload % ALIGN != 0 || payload > self.arena.len() {
            return Err(invalid());
        }
        let offset = payload - HEADER_SIZE;
        let (id, _) = decode_stamp(&self.arena[offset..payload]).ok_or_else(invalid)?;
        match self.blocks.get(id.index()) {
            Some(Some(header)) if header.offset == offset && header.kind != BlockKind::Free => {
                Ok(id)
            }
            _ => Err(invalid()),
        }
    }

    /// Header of a block reachable from the list
    ///
    /// Panics if `id` is not live, which means the block table is corrupt.
    fn hdr(&self, id: BlockId) -> &BlockHeader<C> {
        match &self.blocks[id.index()] {
            Some(header) => header,
            None => unreachable!("block {id:?} is not live"),
        }
    }

    fn hdr_mut(&mut self, id: BlockId) -> &mut BlockHeader<C> {
        match &mut self.blocks[id.index()] {
            Some(header) => header,
            None => unreachable!("block {id:?} is not live"),
        }
    }

    fn insert_block(&mut self, header: BlockHeader<C>) -> BlockId {
        match self.free_ids.pop() {
            Some(id) => {
                self.blocks[id.index()] = Some(header);
                id
            }
            None => {
                let id = BlockId(self.blocks.len() as u32);
                self.blocks.push(Some(header));
                id
            }
        }
    }

    fn remove_block(&mut self, id: BlockId) -> Option<BlockHeader<C>> {
        let header = self.blocks.get_mut(id.index())?.take();
        if header.is_some() {
            self.free_ids.push(id);
        }
        header
    }

    fn stamp(&mut self, id: BlockId) {
        let header = self.hdr(id);
        let (offset, stamp) = (header.offset, encode_stamp(id, header.size));
        self.write_raw(offset, &stamp);
    }

    fn range(&self, addr: HeapAddr, len: usize) -> Result<Range<usize>> {
        let start = addr.as_usize();
        match start.checked_add(len) {
            Some(end) if end <= self.arena.len() => Ok(start..end),
            _ => Err(HeapError::OutOfBounds { addr, len }),
        }
    }

    fn write_raw(&mut self, offset: usize, bytes: &[u8]) {
        let range = offset..offset + bytes.len();
        if let Some(txn) = self.txn.as_mut() {
            txn.record_write(offset, &self.arena[range.clone()]);
        }
        self.arena[range].copy_from_slice(bytes);
    }

    fn fill_raw(&mut self, range: Range<usize>, byte: u8) {
        if let Some(txn) = self.txn.as_mut() {
            txn.record_write(range.start, &self.arena[range.clone()]);
        }
        self.arena[range].fill(byte);
    }

    fn copy_raw(&mut self, from: usize, to: usize, len: usize) {
        if let Some(txn) = self.txn.as_mut() {
            txn.record_write(to, &self.arena[to..to + len]);
        }
        self.arena.copy_within(from..from + len, to);
    }
}

impl<C> fmt::Debug for Heap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.arena.len())
            .field("blocks", &self.blocks.iter().filter(|slot| slot.is_some()).count())
            .field("in_transaction", &self.txn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoRelocator;
    use std::sync::Mutex;

    type TestHeap = Heap<u32>;

    /// Records capability relocations, optionally failing the nth one
    #[derive(Default)]
    struct Recorder {
        moved: Vec<(u32, HeapAddr, HeapAddr)>,
        rolled_back: Vec<(u32, HeapAddr, HeapAddr)>,
        fail_at: Option<usize>,
    }

    impl Relocator<u32> for Recorder {
        fn relocated(
            &mut self,
            _heap: &mut Heap<u32>,
            owner: &u32,
            old: HeapAddr,
            new: HeapAddr,
        ) -> Result<()> {
            if self.fail_at == Some(self.moved.len()) {
                return Err(HeapError::Corrupted { offset: 0, reason: "test failure" });
            }
            self.moved.push((*owner, old, new));
            Ok(())
        }

        fn rolled_back(&mut self, owner: &u32, current: HeapAddr, restored: HeapAddr) {
            self.rolled_back.push((*owner, current, restored));
        }
    }

    fn alloc(heap: &mut TestHeap, size: usize) -> HeapAddr {
        heap.alloc(size, &mut NoRelocator).unwrap()
    }

    #[test]
    fn test_new_heap_is_one_free_block() {
        let heap = TestHeap::new(1024).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total, 1024);
        assert_eq!(stats.free, 1024);
        assert_eq!(stats.blocks, 1);
        heap.validate().unwrap();
    }

    #[test]
    fn test_new_rejects_tiny_arena() {
        assert_eq!(TestHeap::new(8).unwrap_err(), HeapError::InvalidSize);
    }

    #[test]
    fn test_alloc_returns_pinned_zeroed_block() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 40);
        heap.write(a, &[0xAA; 40]).unwrap();
        heap.free(a).unwrap();

        let b = alloc(&mut heap, 40);
        assert!(heap.is_pinned(b).unwrap());
        assert!(heap.size_of(b).unwrap() >= 40);
        assert!(heap.payload(b).unwrap().iter().all(|&byte| byte == 0));
        heap.validate().unwrap();
    }

    #[test]
    fn test_alloc_zero_size() {
        let mut heap = TestHeap::new(512).unwrap();
        assert_eq!(heap.alloc(0, &mut NoRelocator), Err(HeapError::InvalidSize));
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        let b = alloc(&mut heap, 32);
        let c = alloc(&mut heap, 32);
        let _d = alloc(&mut heap, 32);

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.stats().free_blocks, 3);

        heap.free(b).unwrap();
        assert_eq!(heap.stats().free_blocks, 2);
        assert_eq!(
            heap.blocks().next(),
            Some(BlockInfo { addr: a, size: 3 * 48 - HEADER_SIZE, kind: BlockKind::Free })
        );
        heap.validate().unwrap();
    }

    #[test]
    fn test_double_free_is_invalid_handle() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        heap.free(a).unwrap();
        assert_eq!(heap.free(a), Err(HeapError::InvalidHandle { addr: a }));
    }

    #[test]
    fn test_invalid_handles() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        assert!(heap.size_of(HeapAddr::NULL).is_err());
        assert!(heap.size_of(a.offset(8)).is_err());
        assert!(heap.size_of(HeapAddr::new(1 << 40)).is_err());
    }

    #[test]
    fn test_pin_reports_previous_state() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        assert!(heap.pin(a).unwrap());
        heap.unpin(a).unwrap();
        assert!(!heap.is_pinned(a).unwrap());
        assert!(!heap.pin(a).unwrap());
        assert!(heap.is_pinned(a).unwrap());
    }

    #[test]
    fn test_relocation_target_replaced() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        heap.set_relocation_capability(a, 9).unwrap();
        heap.set_relocation_absolute(a, a).unwrap();
        assert!(matches!(heap.relocation_target(a).unwrap(), RelocationTarget::Absolute(slot) if *slot == a));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut heap = TestHeap::new(256).unwrap();
        assert!(matches!(heap.read(HeapAddr::new(250), 8), Err(HeapError::OutOfBounds { .. })));
        assert!(heap.write(HeapAddr::new(248), &[1; 8]).is_ok());
        assert!(heap.set_relocation_absolute(HeapAddr::new(16), HeapAddr::new(252)).is_err());
    }

    /// Layout: [A reloc 80][free 48][C pinned 80][free 112]
    fn fragmented_with_relocatable() -> (TestHeap, HeapAddr, HeapAddr) {
        let mut heap = TestHeap::new(320).unwrap();
        let a = alloc(&mut heap, 64);
        let b = alloc(&mut heap, 32);
        let c = alloc(&mut heap, 64);
        heap.free(b).unwrap();
        heap.write(a, &[0x5A; 64]).unwrap();
        heap.unpin(a).unwrap();
        (heap, a, c)
    }

    #[test]
    fn test_relocation_absolute_target() {
        let (mut heap, a, c) = fragmented_with_relocatable();
        heap.write_u64(c, a.raw()).unwrap();
        heap.set_relocation_absolute(a, c).unwrap();

        let big = alloc(&mut heap, 100);
        assert_eq!(big, a);

        let moved = HeapAddr::new(heap.read_u64(c).unwrap());
        assert_ne!(moved, a);
        assert_eq!(heap.read(moved, 64).unwrap(), &[0x5A; 64][..]);
        assert!(!heap.is_pinned(moved).unwrap());
        heap.validate().unwrap();
    }

    #[test]
    fn test_relocation_callback_target() {
        let (mut heap, a, _) = fragmented_with_relocatable();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        heap.set_relocation_callback(a, move |old, new| sink.lock().unwrap().push((old, new)))
            .unwrap();

        alloc(&mut heap, 100);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, a);
        assert_eq!(heap.read(seen[0].1, 64).unwrap(), &[0x5A; 64][..]);
    }

    #[test]
    fn test_relocation_capability_target() {
        let (mut heap, a, _) = fragmented_with_relocatable();
        heap.set_relocation_capability(a, 77).unwrap();

        let mut recorder = Recorder::default();
        heap.alloc(100, &mut recorder).unwrap();
        assert_eq!(recorder.moved.len(), 1);
        let (owner, old, new) = recorder.moved[0];
        assert_eq!((owner, old), (77, a));
        assert_eq!(heap.read(new, 64).unwrap(), &[0x5A; 64][..]);
        assert!(matches!(heap.relocation_target(new).unwrap(), RelocationTarget::Capability(77)));
    }

    #[test]
    fn test_capability_target_without_relocator_fails_cleanly() {
        let (mut heap, a, _) = fragmented_with_relocatable();
        heap.set_relocation_capability(a, 1).unwrap();
        let before = heap.read(HeapAddr::NULL, heap.capacity()).unwrap().to_vec();

        assert!(matches!(heap.alloc(100, &mut NoRelocator), Err(HeapError::Corrupted { .. })));
        assert_eq!(heap.read(HeapAddr::NULL, heap.capacity()).unwrap(), &before[..]);
        assert_eq!(heap.size_of(a).unwrap(), 64);
        heap.validate().unwrap();
    }

    #[test]
    fn test_failed_relocation_chain_rolls_back() {
        // [A 32][B 32][F1 96][P 32][F2 128]
        let mut heap = TestHeap::new(320).unwrap();
        let a = alloc(&mut heap, 16);
        let b = alloc(&mut heap, 16);
        let f1 = alloc(&mut heap, 80);
        let _p = alloc(&mut heap, 16);
        heap.free(f1).unwrap();
        heap.write(a, &[1; 16]).unwrap();
        heap.write(b, &[2; 16]).unwrap();
        heap.unpin(a).unwrap();
        heap.unpin(b).unwrap();
        heap.set_relocation_capability(a, 1).unwrap();
        heap.set_relocation_capability(b, 2).unwrap();

        let before = heap.read(HeapAddr::NULL, heap.capacity()).unwrap().to_vec();
        let stats = heap.stats();

        let mut recorder = Recorder { fail_at: Some(1), ..Recorder::default() };
        let err = heap.alloc(136, &mut recorder).unwrap_err();
        assert!(matches!(err, HeapError::Corrupted { .. }));

        assert_eq!(heap.read(HeapAddr::NULL, heap.capacity()).unwrap(), &before[..]);
        assert_eq!(heap.stats(), stats);
        // The second move failed in the relocator; both are rewound, newest first.
        assert_eq!(recorder.moved.len(), 1);
        let (owner, old, new) = recorder.moved[0];
        assert_eq!(recorder.rolled_back.len(), 2);
        assert_eq!(recorder.rolled_back[0].0, 2);
        assert_eq!(recorder.rolled_back[1], (owner, new, old));
        assert_eq!(heap.payload(a).unwrap(), &[1; 16][..]);
        assert_eq!(heap.payload(b).unwrap(), &[2; 16][..]);
        heap.validate().unwrap();
    }

    #[test]
    fn test_nested_evacuation_tries_later_runs() {
        // [B 96][F0 64][P1][C 48][F1 64][P2][D 64][F2 40][P3][F3 40][P4]
        let mut heap = TestHeap::new(512).unwrap();
        let b = alloc(&mut heap, 80);
        let f0 = alloc(&mut heap, 48);
        let p1 = alloc(&mut heap, 8);
        let c = alloc(&mut heap, 32);
        let f1 = alloc(&mut heap, 48);
        let p2 = alloc(&mut heap, 8);
        let d = alloc(&mut heap, 48);
        let f2 = alloc(&mut heap, 24);
        let p3 = alloc(&mut heap, 8);
        let f3 = alloc(&mut heap, 24);
        let _p4 = alloc(&mut heap, 8);
        assert_eq!(heap.stats().free, 0);

        for (block, slot, fill) in [(b, p1, 1u8), (c, p2, 2), (d, p3, 3)] {
            heap.write(block, &vec![fill; heap.size_of(block).unwrap()]).unwrap();
            heap.write_u64(slot, block.raw()).unwrap();
            heap.set_relocation_absolute(block, slot).unwrap();
            heap.unpin(block).unwrap();
        }
        for free in [f0, f1, f2, f3] {
            heap.free(free).unwrap();
        }

        // Making room for B at [C, F1] needs C moved, which has nowhere to
        // go. The run at [D, F2] works once D moves into F1.
        let big = alloc(&mut heap, 144);
        assert_eq!(big, b);

        let b_new = HeapAddr::new(heap.read_u64(p1).unwrap());
        let c_now = HeapAddr::new(heap.read_u64(p2).unwrap());
        let d_new = HeapAddr::new(heap.read_u64(p3).unwrap());
        assert_eq!(b_new, d);
        assert_eq!(c_now, c);
        assert_eq!(d_new, f1);
        assert_eq!(&heap.payload(b_new).unwrap()[..80], &[1; 80][..]);
        assert_eq!(heap.payload(c_now).unwrap(), &[2; 32][..]);
        assert_eq!(heap.payload(d_new).unwrap(), &[3; 48][..]);
        assert!(!heap.is_pinned(c_now).unwrap());
        heap.validate().unwrap();
    }

    #[test]
    fn test_out_of_memory_leaves_heap_untouched() {
        let mut heap = TestHeap::new(256).unwrap();
        let a = alloc(&mut heap, 64);
        let _b = alloc(&mut heap, 64);
        let stats = heap.stats();
        assert_eq!(
            heap.alloc(200, &mut NoRelocator),
            Err(HeapError::OutOfMemory { requested: 200 })
        );
        assert_eq!(heap.stats(), stats);
        assert!(heap.is_pinned(a).unwrap());
    }

    #[test]
    fn test_prefers_runs_without_relocation() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 64);
        heap.unpin(a).unwrap();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        heap.set_relocation_callback(a, move |_, _| *sink.lock().unwrap() += 1).unwrap();

        alloc(&mut heap, 64);
        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(heap.size_of(a).unwrap(), 64);
    }

    #[test]
    fn test_scenario_alloc_free_alloc_reuses_space() {
        let mut heap = TestHeap::new(512).unwrap();
        let first = alloc(&mut heap, 100);
        let _second = alloc(&mut heap, 100);
        heap.free(first).unwrap();
        let third = alloc(&mut heap, 150);
        assert!(heap.size_of(third).unwrap() >= 150);
        heap.validate().unwrap();
    }

    #[test]
    fn test_scenario_alloc_free_alloc_relocates_when_needed() {
        // [free 120][second reloc 120][free 120]
        let mut heap = TestHeap::new(360).unwrap();
        let first = alloc(&mut heap, 100);
        let second = alloc(&mut heap, 100);
        heap.free(first).unwrap();
        heap.write(second, &[9; 100]).unwrap();
        heap.unpin(second).unwrap();

        let moved = Arc::new(Mutex::new(second));
        let sink = Arc::clone(&moved);
        heap.set_relocation_callback(second, move |_, new| *sink.lock().unwrap() = new)
            .unwrap();

        let third = alloc(&mut heap, 150);
        assert!(heap.size_of(third).unwrap() >= 150);
        let second = *moved.lock().unwrap();
        assert_eq!(&heap.payload(second).unwrap()[..100], &[9; 100][..]);
        heap.validate().unwrap();
    }

    #[test]
    fn test_scenario_alloc_free_alloc_fails_when_all_pinned() {
        let mut heap = TestHeap::new(360).unwrap();
        let first = alloc(&mut heap, 100);
        let _second = alloc(&mut heap, 100);
        heap.free(first).unwrap();
        assert_eq!(
            heap.alloc(150, &mut NoRelocator),
            Err(HeapError::OutOfMemory { requested: 150 })
        );
        heap.validate().unwrap();
    }

    #[test]
    fn test_blocks_iterator_in_address_order() {
        let mut heap = TestHeap::new(512).unwrap();
        let a = alloc(&mut heap, 32);
        let b = alloc(&mut heap, 32);
        heap.unpin(b).unwrap();
        let blocks: Vec<BlockInfo> = heap.blocks().collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], BlockInfo { addr: a, size: 32, kind: BlockKind::Pinned });
        assert_eq!(blocks[1], BlockInfo { addr: b, size: 32, kind: BlockKind::Relocatable });
        assert_eq!(blocks[2].kind, BlockKind::Free);
    }
}
