use crate::fixed::FixedHeap;
use crate::globals::ROOT_BUNDLE_CAPACITY;
use crate::object::TypeDescriptor;
use crate::region::RegionTable;
use std::mem::size_of;
use std::ptr::null_mut;

#[repr(C)]
pub(crate) struct RootEntry {
    pub object: *mut u8,
    pub descriptor: *const TypeDescriptor,
}

/// Fixed-capacity array of root entries; bundles are chained as the root set
/// grows, each one allocated from the fixed heap.
#[repr(C)]
pub(crate) struct RootBundle {
    pub count: usize,
    pub next: *mut RootBundle,
    pub entries: [RootEntry; ROOT_BUNDLE_CAPACITY],
}

/// The process-wide list of registered roots. Roots are permanent: there is
/// no way to deregister one.
pub struct RootList {
    head: *mut RootBundle,
    len: usize,
}

impl RootList {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Registers a permanent root. Fails only when the fixed heap cannot
    /// grow a new bundle.
    pub fn attach(
        &mut self,
        regions: &mut RegionTable,
        fixed: &mut FixedHeap,
        object: *mut u8,
        descriptor: *const TypeDescriptor,
    ) -> bool {
        unsafe {
            if self.head.is_null() || (*self.head).count == ROOT_BUNDLE_CAPACITY {
                let bundle = match fixed.allocate(regions, size_of::<RootBundle>()) {
                    Some(p) => p.cast::<RootBundle>(),
                    None => return false,
                };
                (*bundle).count = 0;
                (*bundle).next = self.head;
                self.head = bundle;
            }
            let bundle = self.head;
            let idx = (*bundle).count;
            (*bundle).entries[idx] = RootEntry { object, descriptor };
            (*bundle).count = idx + 1;
            self.len += 1;
        }
        true
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(*mut u8, *const TypeDescriptor)) {
        let mut bundle = self.head;
        while !bundle.is_null() {
            unsafe {
                for entry in (&(*bundle).entries)[..(*bundle).count].iter() {
                    f(entry.object, entry.descriptor);
                }
                bundle = (*bundle).next;
            }
        }
    }
}
