use crate::globals::{
    align_up, LINEAR_CLASSES, LINEAR_CUTOFF, LINEAR_LOG, LINEAR_SHIFT, MAX_CLASS_LOG, MIN_CHUNK,
    NUM_SIZE_CLASSES, REGION_SIZE, WORD,
};
use crate::header::Preheader;
use crate::region::{RegionKind, RegionTable};
use std::ptr::null_mut;

/// A free lump as it sits in memory: the preheader word followed by the
/// doubly-linked free-list links. The lump size is repeated in a footer word
/// at the very end of the lump so `free` can coalesce backwards in O(1).
#[repr(C)]
pub(crate) struct FreeLump {
    pub header: Preheader,
    pub next: *mut FreeLump,
    pub prev: *mut FreeLump,
}

/// Size class of a lump or request. Linear classes hold exactly one size
/// each (one class per `2 * WORD` step up to 1KB); above that classes grow by
/// powers of two, and everything beyond the top exponent shares the top
/// class.
pub(crate) fn size_class_of(total: usize) -> usize {
    debug_assert!(total >= MIN_CHUNK && total % WORD == 0);
    if total <= LINEAR_CUTOFF {
        (total >> LINEAR_SHIFT) - 2
    } else {
        let log = 64 - (total - 1).leading_zeros() as usize;
        LINEAR_CLASSES + (log - LINEAR_LOG - 1).min(MAX_CLASS_LOG - LINEAR_LOG)
    }
}

/// Generic best-fit manual memory manager over segregated free lists,
/// parameterized by the region kind it expands into. Backs both the fixed
/// heap and the large object area.
pub struct ManualHeap {
    classes: [*mut FreeLump; NUM_SIZE_CLASSES],
    kind: RegionKind,
    committed: usize,
    in_use: usize,
}

impl ManualHeap {
    pub fn new(kind: RegionKind) -> Self {
        Self {
            classes: [null_mut(); NUM_SIZE_CLASSES],
            kind,
            committed: 0,
            in_use: 0,
        }
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn free_bytes(&self) -> usize {
        self.committed - self.in_use
    }

    /// Total chunk size for a payload request.
    pub(crate) fn chunk_size(request: usize) -> usize {
        // Twice the pointer alignment guarantees room for the free-list
        // links once the chunk is freed again.
        align_up(request + WORD, 2 * WORD).max(MIN_CHUNK)
    }

    unsafe fn write_footer(h: *mut Preheader, size: usize) {
        ((h as usize + size - WORD) as *mut usize).write(size);
    }

    unsafe fn read_prev_footer(h: *mut Preheader) -> usize {
        ((h as usize - WORD) as *const usize).read()
    }

    unsafe fn insert(&mut self, h: *mut Preheader, size: usize) {
        let lump = h as *mut FreeLump;
        let class = size_class_of(size);
        (*lump).next = self.classes[class];
        (*lump).prev = null_mut();
        if !self.classes[class].is_null() {
            (*self.classes[class]).prev = lump;
        }
        self.classes[class] = lump;
    }

    unsafe fn unlink(&mut self, lump: *mut FreeLump) {
        let class = size_class_of((*lump).header.size());
        if (*lump).prev.is_null() {
            self.classes[class] = (*lump).next;
        } else {
            (*(*lump).prev).next = (*lump).next;
        }
        if !(*lump).next.is_null() {
            (*(*lump).next).prev = (*lump).prev;
        }
    }

    /// Best-fit allocation: first fit within the request's own class, head of
    /// the next non-empty larger class otherwise. Returns the payload
    /// pointer, or `None` when no lump fits (the caller expands or collects).
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        unsafe {
            let mut total = Self::chunk_size(size);
            let class = size_class_of(total);

            let mut lump = {
                let mut cur = self.classes[class];
                while !cur.is_null() && (*cur).header.size() < total {
                    cur = (*cur).next;
                }
                cur
            };
            if lump.is_null() {
                // Any lump in a larger class satisfies the request.
                for c in class + 1..NUM_SIZE_CLASSES {
                    if !self.classes[c].is_null() {
                        lump = self.classes[c];
                        break;
                    }
                }
            }
            if lump.is_null() {
                return None;
            }

            self.unlink(lump);
            let h = lump as *mut Preheader;
            let lump_size = (*h).size();
            if lump_size - total >= MIN_CHUNK {
                // Split; the remainder goes back to its own class. The chunk
                // after the remainder keeps prev-in-use clear.
                let rem = lump_size - total;
                let rem_h = (h as usize + total) as *mut Preheader;
                rem_h.write(Preheader::new(rem, true, true));
                Self::write_footer(rem_h, rem);
                self.insert(rem_h, rem);
                (*h).set_size(total);
            } else {
                total = lump_size;
                (*Preheader::next_header(h)).set_prev_in_use(true);
            }
            (*h).set_free(false);
            (*h).clear_mark();
            self.in_use += total;
            Some(Preheader::payload(h))
        }
    }

    /// Returns a chunk to the free lists, unconditionally coalescing with the
    /// preceding and following lumps first.
    pub fn free(&mut self, payload: *mut u8) {
        unsafe {
            let mut h = Preheader::of_payload(payload);
            debug_assert!(!(*h).is_free());
            let mut total = (*h).size();
            self.in_use -= total;

            let next = Preheader::next_header(h);
            if (*next).is_free() {
                self.unlink(next as *mut FreeLump);
                total += (*next).size();
            }
            if !(*h).prev_in_use() {
                let prev_size = Self::read_prev_footer(h);
                let prev = (h as usize - prev_size) as *mut Preheader;
                debug_assert!((*prev).is_free());
                self.unlink(prev as *mut FreeLump);
                total += prev_size;
                h = prev;
            }

            // A free lump always follows an allocated chunk or the region
            // start, so its own prev-in-use bit is set.
            h.write(Preheader::new(total, true, true));
            Self::write_footer(h, total);
            (*Preheader::next_header(h)).set_prev_in_use(false);
            self.insert(h, total);
        }
    }

    /// Allocate-copy-free; there is no in-place growth.
    pub fn resize(&mut self, regions: &mut RegionTable, payload: *mut u8, size: usize) -> Option<*mut u8> {
        unsafe {
            let h = Preheader::of_payload(payload);
            let old_payload = (*h).size() - WORD;
            let new = match self.allocate(size) {
                Some(p) => p,
                None => {
                    if !self.expand(regions, size) {
                        return None;
                    }
                    self.allocate(size)?
                }
            };
            core::ptr::copy_nonoverlapping(payload, new, old_payload.min(size));
            self.free(payload);
            Some(new)
        }
    }

    /// Requests a new region and formats it as one giant free lump bounded by
    /// sentinel headers: the lump itself starts the region with prev-in-use
    /// set, and an epilogue header of size zero terminates every forward walk.
    pub fn expand(&mut self, regions: &mut RegionTable, size: usize) -> bool {
        let needed = Self::chunk_size(size) + WORD;
        let region = match regions.allocate_region(needed.max(REGION_SIZE), self.kind) {
            Some(r) => r,
            None => return false,
        };
        unsafe {
            let start = (*region).start;
            let len = (*region).len();
            let lump = len - WORD;
            let h = start.cast::<Preheader>();
            h.write(Preheader::new(lump, true, true));
            Self::write_footer(h, lump);
            let epilogue = (start as usize + lump) as *mut Preheader;
            epilogue.write(Preheader::new(0, false, false));
            self.insert(h, lump);
            self.committed += len;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with_region() -> (ManualHeap, RegionTable) {
        let mut regions = RegionTable::new(64 * REGION_SIZE);
        let mut heap = ManualHeap::new(RegionKind::Fixed);
        assert!(heap.expand(&mut regions, 1));
        (heap, regions)
    }

    #[test]
    fn size_classes() {
        assert_eq!(size_class_of(32), 0);
        assert_eq!(size_class_of(48), 1);
        assert_eq!(size_class_of(1024), 62);
        assert_eq!(size_class_of(1040), LINEAR_CLASSES);
        assert_eq!(size_class_of(2048), LINEAR_CLASSES);
        assert_eq!(size_class_of(2056), LINEAR_CLASSES + 1);
        assert_eq!(size_class_of(2 * 1024 * 1024), NUM_SIZE_CLASSES - 2);
        assert_eq!(size_class_of(64 * 1024 * 1024), NUM_SIZE_CLASSES - 1);
    }

    #[test]
    fn allocate_aligns_and_headers_chain() {
        let (mut heap, _regions) = heap_with_region();
        let a = heap.allocate(24).unwrap();
        let b = heap.allocate(100).unwrap();
        assert_eq!(a as usize % WORD, 0);
        assert_eq!(b as usize % WORD, 0);
        unsafe {
            let ha = Preheader::of_payload(a);
            assert!((*ha).size() >= 24 + WORD);
            // The size field is the exact distance to the next header.
            let hb = Preheader::of_payload(b);
            assert_eq!(Preheader::next_header(ha), hb);
        }
    }

    #[test]
    fn coalescing_is_order_independent() {
        for order in 0..2 {
            let (mut heap, _regions) = heap_with_region();
            let baseline = heap.free_bytes();
            let a = heap.allocate(40).unwrap();
            let b = heap.allocate(40).unwrap();
            // Freeing adjacent chunks in either order must merge back into
            // one lump with nothing lost.
            if order == 0 {
                heap.free(a);
                heap.free(b);
            } else {
                heap.free(b);
                heap.free(a);
            }
            assert_eq!(heap.free_bytes(), baseline);
            let c = heap.allocate(96).unwrap();
            unsafe {
                // Merged space is reused from the same address.
                assert_eq!(c, a);
                assert!((*Preheader::of_payload(c)).size() >= 96);
            }
        }
    }

    #[test]
    fn alloc_free_loop_does_not_leak() {
        let (mut heap, _regions) = heap_with_region();
        let committed = heap.committed();
        let free = heap.free_bytes();
        for _ in 0..10_000 {
            let p = heap.allocate(120).unwrap();
            heap.free(p);
        }
        assert_eq!(heap.committed(), committed);
        assert_eq!(heap.free_bytes(), free);
    }

    #[test]
    fn resize_preserves_contents() {
        let (mut heap, mut regions) = heap_with_region();
        let p = heap.allocate(32).unwrap();
        unsafe {
            p.cast::<u64>().write(0xfeed_beef);
            let q = heap.resize(&mut regions, p, 128).unwrap();
            assert_eq!(q.cast::<u64>().read(), 0xfeed_beef);
            heap.free(q);
        }
    }

    #[test]
    fn exhaustion_reports_failure() {
        let mut regions = RegionTable::new(REGION_SIZE);
        let mut heap = ManualHeap::new(RegionKind::Large);
        assert!(heap.expand(&mut regions, 1));
        // Ceiling reached: further expansion must fail, not abort.
        assert!(!heap.expand(&mut regions, REGION_SIZE));
        assert!(heap.allocate(4 * REGION_SIZE).is_none());
    }
}
