//! Heap statistics

/// Snapshot of arena usage
///
/// Byte counts include block headers, so `used + free == total` always
/// holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Arena size in bytes
    pub total: usize,
    /// Bytes in allocated (pinned or relocatable) blocks
    pub used: usize,
    /// Bytes in free blocks
    pub free: usize,
    /// Bytes in pinned blocks
    pub pinned: usize,
    /// Bytes in relocatable blocks
    pub relocatable: usize,
    /// Number of blocks of any kind
    pub blocks: usize,
    /// Number of free blocks
    pub free_blocks: usize,
    /// Largest free block, header included
    pub largest_free: usize,
}

impl HeapStats {
    /// Fraction of free bytes outside the largest free block (0.0 = none)
    pub fn fragmentation(&self) -> f64 {
        if self.free == 0 {
            0.0
        } else {
            1.0 - self.largest_free as f64 / self.free as f64
        }
    }
}
