use crate::fixed::FixedHeap;
use crate::globals::{align_up, BLOCK_SIZE, REGION_SIZE, WORD};
use crate::header::Preheader;
use crate::region::{Region, RegionKind, RegionTable};
use std::ptr::null_mut;

/// A free chunk or free-block run as it sits in small-area memory: the
/// preheader (free bit set, size spanning the whole chunk) followed by a
/// single list link.
#[repr(C)]
pub(crate) struct FreeChunk {
    pub header: Preheader,
    pub next: *mut FreeChunk,
}

/// Per-region block bitmap, hung off `Region::aux`. One bit per 4KB block;
/// set while the block holds objects (or is the active bump block), clear
/// while the block sits in the free-blocks list. Conservative scans consult
/// it in O(1) before paying for a header walk.
pub(crate) unsafe fn block_bit_test(region: &Region, idx: usize) -> bool {
    let word = region.aux.cast::<usize>().add(idx / (WORD * 8)).read();
    word & (1 << (idx % (WORD * 8))) != 0
}

pub(crate) unsafe fn block_bit_set(region: &Region, idx: usize) {
    let slot = region.aux.cast::<usize>().add(idx / (WORD * 8));
    slot.write(slot.read() | 1 << (idx % (WORD * 8)));
}

pub(crate) unsafe fn block_bit_clear(region: &Region, idx: usize) {
    let slot = region.aux.cast::<usize>().add(idx / (WORD * 8));
    slot.write(slot.read() & !(1 << (idx % (WORD * 8))));
}

/// Allocator for short-lived, small, automatically managed objects: a fast
/// bump pointer over the current free range, backed by a slower free-chunk /
/// free-block search. Objects never straddle a 4KB block boundary, which is
/// what makes conservative scanning of this area cheap.
pub struct SmallObjectArea {
    cursor: *mut u8,
    bound: *mut u8,
    /// Free chunks sorted by descending size: the head satisfies any request
    /// up to its size.
    free_chunks: *mut FreeChunk,
    /// Runs of whole free blocks in address order.
    free_blocks: *mut FreeChunk,
    committed: usize,
}

impl SmallObjectArea {
    pub fn new() -> Self {
        Self {
            cursor: null_mut(),
            bound: null_mut(),
            free_chunks: null_mut(),
            free_blocks: null_mut(),
            committed: 0,
        }
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Allocates `total` bytes (header included, word aligned). Returns the
    /// header address with the header already written, or `None` when the
    /// area needs expansion or a collection.
    pub fn allocate(&mut self, regions: &RegionTable, total: usize) -> Option<*mut u8> {
        debug_assert!(total % WORD == 0 && total <= BLOCK_SIZE);
        loop {
            let cur = self.cursor as usize;
            if cur != 0 && cur + total <= self.bound as usize {
                unsafe {
                    (self.cursor as *mut Preheader).write(Preheader::new(total, false, true));
                }
                self.cursor = (cur + total) as *mut u8;
                return Some(cur as *mut u8);
            }
            if !self.refill(regions, total) {
                return None;
            }
        }
    }

    /// Slow path: retire the current range, then adopt the largest free
    /// chunk or carve a fresh block off the free-blocks list.
    fn refill(&mut self, regions: &RegionTable, total: usize) -> bool {
        self.retire_current_range();
        unsafe {
            if !self.free_chunks.is_null() && (*self.free_chunks).header.size() >= total {
                let chunk = self.free_chunks;
                self.free_chunks = (*chunk).next;
                self.cursor = chunk as *mut u8;
                self.bound = (chunk as usize + (*chunk).header.size()) as *mut u8;
                return true;
            }
            if !self.free_blocks.is_null() {
                let run = self.free_blocks;
                let run_size = (*run).header.size();
                let next = (*run).next;
                if run_size > BLOCK_SIZE {
                    let rest = (run as usize + BLOCK_SIZE) as *mut FreeChunk;
                    (*rest).header = Preheader::new(run_size - BLOCK_SIZE, true, true);
                    (*rest).next = next;
                    self.free_blocks = rest;
                } else {
                    self.free_blocks = next;
                }
                if let Some(region) = regions.find_region(run as usize) {
                    block_bit_set(region, region.block_index(run as usize));
                }
                self.cursor = run as *mut u8;
                self.bound = (run as usize + BLOCK_SIZE) as *mut u8;
                return true;
            }
        }
        false
    }

    /// Writes a free-chunk header over the unconsumed remainder of the bump
    /// range so the block stays linearly parseable. The remainder is not
    /// listed anywhere; the next sweep reclaims it.
    pub fn retire_current_range(&mut self) {
        let cur = self.cursor as usize;
        let bound = self.bound as usize;
        if cur != 0 && bound > cur {
            unsafe {
                (cur as *mut Preheader).write(Preheader::new(bound - cur, true, true));
            }
        }
        self.cursor = null_mut();
        self.bound = null_mut();
    }

    /// Grows the area by one region of at least `size` bytes; the whole
    /// region enters the free-blocks list as a single run. The per-block
    /// bitmap is allocated from the fixed heap.
    pub fn expand(
        &mut self,
        regions: &mut RegionTable,
        fixed: &mut FixedHeap,
        size: usize,
    ) -> bool {
        // Bitmap first: a region must never enter the table without one.
        let rounded = align_up(size, REGION_SIZE);
        let bitmap_bytes = align_up(rounded / BLOCK_SIZE, WORD * 8) / 8;
        let aux = match fixed.allocate(regions, bitmap_bytes) {
            Some(p) => p,
            None => return false,
        };
        let region = match regions.allocate_region(rounded, RegionKind::Small) {
            Some(r) => r,
            None => {
                fixed.free(aux);
                return false;
            }
        };
        unsafe {
            (*region).aux = aux;
            let len = (*region).len();
            self.committed += len;
            self.insert_block_run((*region).start, len);
        }
        true
    }

    /// Address-ordered insertion into the free-blocks list.
    pub(crate) unsafe fn insert_block_run(&mut self, start: *mut u8, len: usize) {
        debug_assert!(len % BLOCK_SIZE == 0);
        let run = start as *mut FreeChunk;
        (*run).header = Preheader::new(len, true, true);
        let mut prev: *mut FreeChunk = null_mut();
        let mut cur = self.free_blocks;
        while !cur.is_null() && (cur as usize) < run as usize {
            prev = cur;
            cur = (*cur).next;
        }
        (*run).next = cur;
        if prev.is_null() {
            self.free_blocks = run;
        } else {
            (*prev).next = run;
        }
    }

    /// Sweep rebuilds both lists from scratch.
    pub(crate) fn reset_free_lists(&mut self) {
        self.free_chunks = null_mut();
        self.free_blocks = null_mut();
    }

    /// Installs the free chunks found by a sweep, largest first. Every chunk
    /// gets a free header so its block stays parseable; chunks too small to
    /// hold the list link (a lone retired word) are left unlisted and merge
    /// into a neighboring gap at some later sweep.
    pub(crate) fn install_chunks(&mut self, mut chunks: Vec<(*mut u8, usize)>) {
        chunks.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        let mut head: *mut FreeChunk = null_mut();
        for &(addr, size) in chunks.iter().rev() {
            unsafe {
                (addr as *mut Preheader).write(Preheader::new(size, true, true));
                if size >= core::mem::size_of::<FreeChunk>() {
                    let chunk = addr as *mut FreeChunk;
                    (*chunk).next = head;
                    head = chunk;
                }
            }
        }
        self.free_chunks = head;
    }

    /// Confirms that `addr` is the payload address of a live small object:
    /// O(1) bitmap rejection first, then a linear header walk of the block.
    /// Safe to call only while no bump range is open.
    pub(crate) unsafe fn exact_object_start(
        &self,
        region: &Region,
        addr: usize,
    ) -> Option<*mut Preheader> {
        debug_assert!(self.cursor.is_null());
        let idx = region.block_index(addr);
        if !block_bit_test(region, idx) {
            return None;
        }
        let mut pos = region.start as usize + idx * BLOCK_SIZE;
        let end = pos + BLOCK_SIZE;
        while pos < end {
            let h = pos as *mut Preheader;
            let size = (*h).size();
            if size == 0 {
                break;
            }
            if pos + WORD == addr {
                return if (*h).is_free() { None } else { Some(h) };
            }
            if pos + WORD > addr {
                return None;
            }
            pos += size;
        }
        None
    }
}
