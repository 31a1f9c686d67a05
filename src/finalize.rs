use crate::fixed::FixedHeap;
use crate::object::TypeDescriptor;
use crate::region::RegionTable;
use std::mem::size_of;
use std::ptr::null_mut;

/// Node on one of the two finalization lists, allocated from the fixed heap
/// and released back there once the finalizer has run.
#[repr(C)]
pub(crate) struct FinalizeNode {
    pub object: *mut u8,
    pub descriptor: *const TypeDescriptor,
    pub next: *mut FinalizeNode,
}

/// The two finalization lists: objects that declared a finalizer and are not
/// yet known dead, and dead objects awaiting their finalizer invocation.
/// Nodes move between the lists only during Mark.
pub struct FinalizeQueues {
    has_finalizers: *mut FinalizeNode,
    pending: *mut FinalizeNode,
    registered: usize,
    pending_count: usize,
}

impl FinalizeQueues {
    pub fn new() -> Self {
        Self {
            has_finalizers: null_mut(),
            pending: null_mut(),
            registered: 0,
            pending_count: 0,
        }
    }

    pub fn registered(&self) -> usize {
        self.registered
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    /// Registers a one-shot finalizer for `object`. The object must not have
    /// had a finalizer set before.
    pub fn register(
        &mut self,
        regions: &mut RegionTable,
        fixed: &mut FixedHeap,
        object: *mut u8,
        descriptor: *const TypeDescriptor,
    ) -> bool {
        debug_assert!(
            !self.is_registered(object),
            "finalizer registered twice for the same object"
        );
        let node = match fixed.allocate(regions, size_of::<FinalizeNode>()) {
            Some(p) => p.cast::<FinalizeNode>(),
            None => return false,
        };
        unsafe {
            (*node).object = object;
            (*node).descriptor = descriptor;
            (*node).next = self.has_finalizers;
        }
        self.has_finalizers = node;
        self.registered += 1;
        true
    }

    fn is_registered(&self, object: *mut u8) -> bool {
        let mut node = self.has_finalizers;
        while !node.is_null() {
            unsafe {
                if (*node).object == object {
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }

    /// Mark-time partition: every registered object that did not survive
    /// reachability moves to the pending list, and `newly_dead` is invoked
    /// for it so Mark can keep the object (and everything it references)
    /// alive until its finalizer has run.
    pub(crate) fn partition(
        &mut self,
        is_live: impl Fn(*mut u8) -> bool,
        mut newly_dead: impl FnMut(*mut u8),
    ) {
        let mut prev: *mut FinalizeNode = null_mut();
        let mut node = self.has_finalizers;
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                if is_live((*node).object) {
                    prev = node;
                } else {
                    if prev.is_null() {
                        self.has_finalizers = next;
                    } else {
                        (*prev).next = next;
                    }
                    (*node).next = self.pending;
                    self.pending = node;
                    self.registered -= 1;
                    self.pending_count += 1;
                    newly_dead((*node).object);
                }
                node = next;
            }
        }
    }

    /// Pops one dead object awaiting finalization.
    pub(crate) fn pop_pending(&mut self) -> Option<*mut FinalizeNode> {
        if self.pending.is_null() {
            return None;
        }
        let node = self.pending;
        unsafe {
            self.pending = (*node).next;
        }
        self.pending_count -= 1;
        Some(node)
    }

    pub(crate) fn release_node(fixed: &mut FixedHeap, node: *mut FinalizeNode) {
        fixed.free(node.cast());
    }

    /// Objects whose finalizer has not run yet. They must survive every
    /// collection between their death and the finalizer invocation.
    pub(crate) fn for_each_pending(&self, mut f: impl FnMut(*mut u8)) {
        let mut node = self.pending;
        while !node.is_null() {
            unsafe {
                f((*node).object);
                node = (*node).next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::REGION_SIZE;

    #[test]
    fn partition_moves_dead_objects_once() {
        let mut regions = RegionTable::new(8 * REGION_SIZE);
        let mut fixed = FixedHeap::new();
        let mut queues = FinalizeQueues::new();
        let live = 0x1000 as *mut u8;
        let dead = 0x2000 as *mut u8;
        assert!(queues.register(&mut regions, &mut fixed, live, null_mut()));
        assert!(queues.register(&mut regions, &mut fixed, dead, null_mut()));
        assert_eq!(queues.registered(), 2);

        let mut resurrected = Vec::new();
        queues.partition(|obj| obj == live, |obj| resurrected.push(obj));
        assert_eq!(resurrected, vec![dead]);
        assert_eq!(queues.registered(), 1);
        assert_eq!(queues.pending_count(), 1);

        let node = queues.pop_pending().unwrap();
        unsafe {
            assert_eq!((*node).object, dead);
        }
        FinalizeQueues::release_node(&mut fixed, node);
        assert!(queues.pop_pending().is_none());

        // A second partition with the same liveness must not move anything.
        queues.partition(|obj| obj == live, |_| panic!("moved twice"));
        assert_eq!(queues.registered(), 1);
    }
}
