use crate::manager::{Config, GcStats, MemoryManager};
use crate::mark::Visitor;
use crate::object::{ObjectRef, TypeDescriptor};
use crate::OutOfMemory;
use atomic::{Atomic, Ordering};
use parking_lot::{lock_api::RawMutex as _, Condvar, Mutex, RawMutex as Lock};
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Thread-safe front end over the memory manager. Every operation stops the
/// world: one global lock, held for the whole of any allocation or
/// collection. A dedicated worker thread runs finalizers outside the lock.
pub struct Heap {
    mm: UnsafeCell<MemoryManager>,
    lock: Lock,
    /// Completed-cycle counter, readable without the lock. Lets a thread
    /// that raced with another's collection skip a redundant one.
    gc_epoch: Atomic<usize>,
    finalizer_wakeup: Arc<(Mutex<bool>, Condvar)>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(config: Config) -> Arc<Heap> {
        let heap = Arc::new(Heap {
            mm: UnsafeCell::new(MemoryManager::new(config)),
            lock: Lock::INIT,
            gc_epoch: Atomic::new(0),
            finalizer_wakeup: Arc::new((Mutex::new(false), Condvar::new())),
        });
        let weak = Arc::downgrade(&heap);
        std::thread::spawn(move || finalizer_loop(weak));
        heap
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryManager) -> R) -> R {
        self.lock.lock();
        let mm = unsafe { &mut *self.mm.get() };
        let r = f(mm);
        self.gc_epoch.store(mm.stats().total_gcs, Ordering::Release);
        let pending = mm.pending_finalizers();
        unsafe {
            self.lock.unlock();
        }
        if pending > 0 {
            self.notify_finalizer();
        }
        r
    }

    /// See [`MemoryManager::allocate`]. May run a full collection cycle
    /// before returning.
    pub fn allocate(
        &self,
        size: usize,
        descriptor: &'static TypeDescriptor,
    ) -> Result<ObjectRef, OutOfMemory> {
        self.with(|mm| mm.allocate(size, descriptor))
    }

    pub fn allocate_fixed(&self, size: usize) -> Result<*mut u8, OutOfMemory> {
        self.with(|mm| mm.allocate_fixed(size))
    }

    pub fn resize_fixed(&self, p: *mut u8, new_size: usize) -> Result<*mut u8, OutOfMemory> {
        self.with(|mm| mm.resize_fixed(p, new_size))
    }

    pub fn free_fixed(&self, p: *mut u8) {
        self.with(|mm| mm.free_fixed(p));
    }

    pub fn attach_root(
        &self,
        object: *mut u8,
        descriptor: *const TypeDescriptor,
    ) -> Result<(), OutOfMemory> {
        self.with(|mm| mm.attach_root(object, descriptor))
    }

    pub fn set_finalizer(
        &self,
        object: ObjectRef,
        descriptor: &'static TypeDescriptor,
    ) -> Result<(), OutOfMemory> {
        self.with(|mm| mm.set_finalizer(object, descriptor))
    }

    pub fn add_constraint(&self, constraint: impl FnMut(&mut Visitor) + Send + 'static) {
        self.with(|mm| mm.add_constraint(constraint));
    }

    /// Runs a collection cycle unless another thread completed one while
    /// this caller was waiting for the lock; in that race the later request
    /// is satisfied by the earlier cycle.
    pub fn invoke_collection(&self, out_of_memory: bool) {
        let epoch = self.gc_epoch.load(Ordering::Acquire);
        self.with(|mm| {
            if mm.stats().total_gcs == epoch {
                mm.collect_garbage(out_of_memory);
            }
        });
    }

    pub fn stats(&self) -> GcStats {
        self.with(|mm| mm.stats())
    }

    pub fn pending_finalizers(&self) -> usize {
        self.with(|mm| mm.pending_finalizers())
    }

    /// Drains the pending-finalizer list, invoking each finalizer without
    /// holding the heap lock so finalizers may allocate or even trigger
    /// collections. Returns how many ran.
    pub fn run_finalizers(&self) -> usize {
        let mut ran = 0;
        loop {
            let node = self.with(|mm| mm.finalize.pop_pending());
            let node = match node {
                Some(n) => n,
                None => return ran,
            };
            unsafe {
                let object = (*node).object;
                let descriptor = (*node).descriptor;
                if !descriptor.is_null() {
                    let shape = (*descriptor).shape;
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        shape.finalize(ObjectRef::from_raw(object));
                    }));
                }
            }
            self.with(|mm| crate::finalize::FinalizeQueues::release_node(&mut mm.fixed, node));
            ran += 1;
        }
    }

    fn notify_finalizer(&self) {
        let (flag, condvar) = &*self.finalizer_wakeup;
        let mut pending = flag.lock();
        *pending = true;
        condvar.notify_one();
    }
}

/// Body of the finalizer worker thread. Holds only a weak reference so the
/// thread winds down once the heap is dropped.
fn finalizer_loop(weak: Weak<Heap>) {
    loop {
        let heap = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        heap.run_finalizers();
        let wakeup = heap.finalizer_wakeup.clone();
        drop(heap);
        let (flag, condvar) = &*wakeup;
        let mut pending = flag.lock();
        if !*pending {
            // Timed wait so the weak upgrade above is retried periodically
            // even if the last strong reference goes away silently.
            condvar.wait_for(&mut pending, Duration::from_millis(100));
        }
        *pending = false;
    }
}
