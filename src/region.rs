use crate::globals::{align_up, BLOCK_SIZE, MAX_REGIONS, REGION_SIZE};
use crate::mmap::Mmap;
use std::ptr::null_mut;

/// Which area owns a region. The kind decides how conservative pointers into
/// the region are validated during Mark and whether the region is swept.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    Small,
    Large,
    /// Never scanned and never collected.
    Fixed,
}

/// A large, block-aligned chunk of address space obtained from the OS.
///
/// Regions live for the rest of the process: they are never unmapped, never
/// merged with a neighbor and never handed back between areas. Adjacent
/// free space in two regions therefore stays split, a known fragmentation
/// limitation of this design.
pub struct Region {
    pub start: *mut u8,
    pub end: *mut u8,
    pub kind: RegionKind,
    /// Address-order neighbors in the region table.
    pub prev: *mut Region,
    pub next: *mut Region,
    /// Area-specific side data; the small object area hangs its per-block
    /// bitmap here. Allocated from the fixed heap.
    pub aux: *mut u8,
    mmap: Mmap,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end as usize - self.start as usize
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start as usize && addr < self.end as usize
    }

    /// Index of the 4KB block containing `addr`.
    pub fn block_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.start as usize) / BLOCK_SIZE
    }

    pub fn block_count(&self) -> usize {
        self.len() / BLOCK_SIZE
    }
}

/// Sorted table mapping address ranges to region metadata. All layers obtain
/// memory through this table rather than calling the OS directly.
pub struct RegionTable {
    entries: Vec<Box<Region>>,
    committed: usize,
    max_memory: usize,
}

impl RegionTable {
    pub fn new(max_memory: usize) -> Self {
        Self {
            entries: Vec::new(),
            committed: 0,
            max_memory,
        }
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Obtains a new region of at least `size` bytes from the OS. The request
    /// is rounded up to the region granularity and refused once the
    /// configured memory ceiling would be exceeded.
    pub fn allocate_region(&mut self, size: usize, kind: RegionKind) -> Option<*mut Region> {
        let size = align_up(size, REGION_SIZE);
        if self.committed + size > self.max_memory {
            return None;
        }
        if self.entries.len() == MAX_REGIONS {
            // Fixed-capacity table; exhausting it is a configuration error.
            panic!("region table exhausted ({} entries)", MAX_REGIONS);
        }
        // Over-allocate by one block so the usable range can be block-aligned.
        let mmap = Mmap::new(size + BLOCK_SIZE);
        let start = mmap.aligned();
        let mut region = Box::new(Region {
            start,
            end: (start as usize + size) as *mut u8,
            kind,
            prev: null_mut(),
            next: null_mut(),
            aux: null_mut(),
            mmap,
        });
        let raw = &mut *region as *mut Region;
        let idx = self
            .entries
            .partition_point(|r| (r.start as usize) < start as usize);
        self.entries.insert(idx, region);
        self.committed += size;

        // Relink address-order neighbors around the insertion point.
        unsafe {
            if idx > 0 {
                let prev = &mut *self.entries[idx - 1] as *mut Region;
                (*raw).prev = prev;
                (*prev).next = raw;
            }
            if idx + 1 < self.entries.len() {
                let next = &mut *self.entries[idx + 1] as *mut Region;
                (*raw).next = next;
                (*next).prev = raw;
            }
        }
        Some(raw)
    }

    /// Binary search for the region containing `addr`. Used only during
    /// collection for conservative-pointer validation, never on the fast
    /// allocation path.
    pub fn find_region(&self, addr: usize) -> Option<&Region> {
        let idx = self
            .entries
            .partition_point(|r| (r.start as usize) <= addr);
        if idx == 0 {
            return None;
        }
        let region = &self.entries[idx - 1];
        if region.contains(addr) {
            Some(region)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.entries.iter().map(|b| &**b)
    }
}
