use crate::manual::ManualHeap;
use crate::region::{RegionKind, RegionTable};

/// Explicitly managed memory that is never scanned and never collected: type
/// metadata, root bundles, finalize nodes and other VM bookkeeping. A thin
/// wrapper over the manual memory manager.
pub struct FixedHeap {
    heap: ManualHeap,
}

impl FixedHeap {
    pub fn new() -> Self {
        Self {
            heap: ManualHeap::new(RegionKind::Fixed),
        }
    }

    pub fn committed(&self) -> usize {
        self.heap.committed()
    }

    /// Allocates zero-filled fixed memory, expanding with a fresh region when
    /// the free lists are empty. Fails only at the memory ceiling.
    pub fn allocate(&mut self, regions: &mut RegionTable, size: usize) -> Option<*mut u8> {
        let p = match self.heap.allocate(size) {
            Some(p) => Some(p),
            None => {
                if !self.heap.expand(regions, size) {
                    return None;
                }
                self.heap.allocate(size)
            }
        }?;
        unsafe {
            core::ptr::write_bytes(p, 0, size);
        }
        Some(p)
    }

    pub fn resize(
        &mut self,
        regions: &mut RegionTable,
        ptr: *mut u8,
        size: usize,
    ) -> Option<*mut u8> {
        self.heap.resize(regions, ptr, size)
    }

    pub fn free(&mut self, ptr: *mut u8) {
        self.heap.free(ptr);
    }
}
