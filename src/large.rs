use crate::globals::{align_up, WORD};
use crate::header::Preheader;
use crate::manual::ManualHeap;
use crate::region::{RegionKind, RegionTable};
use std::mem::size_of;
use std::ptr::null_mut;

/// Hash-set node appended after a large object's user-visible bytes. Exists
/// only to answer "is this address a live large-object start" during
/// conservative marking.
#[repr(C)]
pub(crate) struct LargeEntry {
    pub object: *mut u8,
    pub next: *mut LargeEntry,
}

const LARGE_SET_BUCKETS: usize = 1024;

/// Automatically managed objects above the small-object threshold,
/// implemented on top of the manual memory manager plus a chained hash set
/// of live starting addresses.
pub struct LargeObjectArea {
    pub(crate) heap: ManualHeap,
    buckets: Vec<*mut LargeEntry>,
    count: usize,
}

impl LargeObjectArea {
    pub fn new() -> Self {
        Self {
            heap: ManualHeap::new(RegionKind::Large),
            buckets: vec![null_mut(); LARGE_SET_BUCKETS],
            count: 0,
        }
    }

    pub fn committed(&self) -> usize {
        self.heap.committed()
    }

    pub fn free_bytes(&self) -> usize {
        self.heap.free_bytes()
    }

    pub fn object_count(&self) -> usize {
        self.count
    }

    #[inline]
    fn bucket_of(addr: usize) -> usize {
        (addr >> 3) & (LARGE_SET_BUCKETS - 1)
    }

    /// Allocates a large object with trailing space for its set entry and
    /// records the start address. `None` means the caller must expand or
    /// collect.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        let body = align_up(size, WORD);
        let payload = self.heap.allocate(body + size_of::<LargeEntry>())?;
        unsafe {
            let entry = payload.add(body).cast::<LargeEntry>();
            (*entry).object = payload;
            let bucket = Self::bucket_of(payload as usize);
            (*entry).next = self.buckets[bucket];
            self.buckets[bucket] = entry;
        }
        self.count += 1;
        Some(payload)
    }

    pub fn expand(&mut self, regions: &mut RegionTable, size: usize) -> bool {
        self.heap
            .expand(regions, align_up(size, WORD) + size_of::<LargeEntry>())
    }

    /// Is `addr` the start of a live large object?
    pub(crate) fn contains(&self, addr: usize) -> Option<*mut Preheader> {
        unsafe {
            let mut entry = self.buckets[Self::bucket_of(addr)];
            while !entry.is_null() {
                if (*entry).object as usize == addr {
                    return Some(Preheader::of_payload((*entry).object));
                }
                entry = (*entry).next;
            }
        }
        None
    }

    pub(crate) fn for_each_object(&self, mut f: impl FnMut(*mut Preheader)) {
        for &head in self.buckets.iter() {
            let mut entry = head;
            while !entry.is_null() {
                unsafe {
                    f(Preheader::of_payload((*entry).object));
                    entry = (*entry).next;
                }
            }
        }
    }

    /// Full linear scan of the set: unmarked entries are unlinked and their
    /// memory returned to the manual manager; marked entries survive with
    /// the mark bit cleared. Returns (marked bytes, freed bytes).
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut marked = 0;
        let mut freed = 0;
        for bucket in 0..LARGE_SET_BUCKETS {
            let mut prev: *mut LargeEntry = null_mut();
            let mut entry = self.buckets[bucket];
            while !entry.is_null() {
                unsafe {
                    let next = (*entry).next;
                    let object = (*entry).object;
                    let h = Preheader::of_payload(object);
                    if (*h).is_marked() {
                        (*h).clear_mark();
                        marked += (*h).size();
                        prev = entry;
                    } else {
                        if prev.is_null() {
                            self.buckets[bucket] = next;
                        } else {
                            (*prev).next = next;
                        }
                        freed += (*h).size();
                        self.count -= 1;
                        self.heap.free(object);
                    }
                    entry = next;
                }
            }
        }
        (marked, freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::REGION_SIZE;

    fn area_with_region() -> (LargeObjectArea, RegionTable) {
        let mut regions = RegionTable::new(16 * REGION_SIZE);
        let mut area = LargeObjectArea::new();
        assert!(area.expand(&mut regions, 4096));
        (area, regions)
    }

    #[test]
    fn set_tracks_exact_starts_only() {
        let (mut area, _regions) = area_with_region();
        let a = area.allocate(8 * 1024).unwrap();
        assert!(area.contains(a as usize).is_some());
        assert!(area.contains(a as usize + 8).is_none());
        assert!(area.contains(a as usize - 8).is_none());
        assert_eq!(area.object_count(), 1);
    }

    #[test]
    fn sweep_reclaims_unmarked_objects() {
        let (mut area, _regions) = area_with_region();
        let a = area.allocate(8 * 1024).unwrap();
        let b = area.allocate(8 * 1024).unwrap();
        unsafe {
            (*Preheader::of_payload(a)).try_mark();
        }
        let (marked, freed) = area.sweep();
        assert!(marked >= 8 * 1024);
        assert!(freed >= 8 * 1024);
        assert!(area.contains(a as usize).is_some());
        assert!(area.contains(b as usize).is_none());
        unsafe {
            // Survivors come out of a sweep unmarked.
            assert!(!(*Preheader::of_payload(a)).is_marked());
        }
        // The reclaimed chunk is reusable for an equal-sized object.
        let c = area.allocate(8 * 1024).unwrap();
        assert_eq!(c, b);
    }
}
