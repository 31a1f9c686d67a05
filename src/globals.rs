use std::mem::size_of;

/// Allocation granularity. Every header, chunk size and payload offset is a
/// multiple of one machine word.
pub const WORD: usize = size_of::<usize>();

/// Sub-unit of a region used for the conservative-scan bitmaps. Small objects
/// never straddle a block boundary.
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Granularity of requests to the OS. Region sizes are always a multiple of this.
pub const REGION_SIZE: usize = 2 * 1024 * 1024;

/// The region table is sized at compile time; running out of entries is a
/// configuration error and aborts the process.
pub const MAX_REGIONS: usize = 1024;

/// Requests up to this many bytes are served by the small object area,
/// everything above goes to the large object area.
pub const LARGE_CUTOFF: usize = 1024;

/// Smallest chunk the manual memory manager will carve: header plus enough
/// payload for the free-list links and the boundary footer.
pub const MIN_CHUNK: usize = 4 * WORD;

/// Free lumps at or below this total size live in one size class per
/// `2 * WORD` step; larger lumps are bucketed by power of two.
pub const LINEAR_CUTOFF: usize = 1024;

pub const LINEAR_SHIFT: usize = 4; // log2(2 * WORD) on 64-bit
pub const LINEAR_CLASSES: usize = (LINEAR_CUTOFF >> LINEAR_SHIFT) - 1; // sizes 32..=1024

/// log2 of the largest dedicated power-of-two class; bigger lumps all share
/// the top class.
pub const MAX_CLASS_LOG: usize = 21;
pub const LINEAR_LOG: usize = 10; // log2(LINEAR_CUTOFF)

pub const NUM_SIZE_CLASSES: usize = LINEAR_CLASSES + (MAX_CLASS_LOG - LINEAR_LOG) + 1;

/// Capacity of the mark stack in entries. Exceeding it is not an error, the
/// mark phase falls back to a linear overflow walk.
pub const MARK_STACK_CAPACITY: usize = 16 * 1024;

/// Entries per root bundle. Bundles are chained as the root set grows.
pub const ROOT_BUNDLE_CAPACITY: usize = 32;

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
