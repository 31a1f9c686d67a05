use crate::finalize::FinalizeQueues;
use crate::fixed::FixedHeap;
use crate::globals::{align_up, LARGE_CUTOFF, MARK_STACK_CAPACITY, REGION_SIZE, WORD};
use crate::header::Preheader;
use crate::large::LargeObjectArea;
use crate::mark::{Marker, Visitor};
use crate::object::{FinalizeKind, ObjectRef, TypeDescriptor};
use crate::region::RegionTable;
use crate::roots::RootList;
use crate::small::SmallObjectArea;
use crate::sweep;
use crate::OutOfMemory;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Tunables for one memory manager instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Small-area footprint the manager starts with and grows back to.
    pub initial_heap: usize,
    /// Ceiling over every area combined. Exceeding it is an allocation
    /// failure, never an abort.
    pub max_heap: usize,
    /// After a collection the small area keeps at least this much headroom.
    pub min_free: usize,
    /// And at most this much.
    pub max_free: usize,
    /// Post-collection target as a multiple of surviving bytes.
    pub growth_multiplier: f64,
    pub mark_stack_capacity: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_heap: 2 * 1024 * 1024,
            max_heap: 256 * 1024 * 1024,
            min_free: 512 * 1024,
            max_free: 4 * 1024 * 1024,
            growth_multiplier: 1.5,
            mark_stack_capacity: MARK_STACK_CAPACITY,
            verbose: false,
        }
    }
}

impl Config {
    /// Reads overrides from the environment: `CINDER_INITIAL_HEAP` and
    /// `CINDER_MAX_HEAP` accept byte counts with an optional k/m/g suffix,
    /// `CINDER_MARK_STACK` an entry count, `CINDER_VERBOSE` any non-empty
    /// value. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_size("CINDER_INITIAL_HEAP") {
            config.initial_heap = n;
        }
        if let Some(n) = env_size("CINDER_MAX_HEAP") {
            config.max_heap = n;
        }
        if let Ok(s) = std::env::var("CINDER_MARK_STACK") {
            if let Ok(n) = s.parse::<usize>() {
                config.mark_stack_capacity = n.max(64);
            }
        }
        if std::env::var("CINDER_VERBOSE").map_or(false, |s| !s.is_empty()) {
            config.verbose = true;
        }
        config
    }

    fn normalized(mut self) -> Self {
        self.initial_heap = align_up(self.initial_heap.max(REGION_SIZE), REGION_SIZE);
        self.max_heap = align_up(self.max_heap, REGION_SIZE).max(self.initial_heap);
        self.max_free = self.max_free.max(self.min_free);
        self.mark_stack_capacity = self.mark_stack_capacity.max(64);
        self
    }
}

fn env_size(name: &str) -> Option<usize> {
    let s = std::env::var(name).ok()?;
    parse_size(&s)
}

/// "4096", "64k", "16M", "1g".
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };
    let n: usize = digits.parse().ok()?;
    let scale = match unit.trim() {
        "" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(scale)
}

/// Snapshot of the collector's counters, updated at the end of every cycle.
#[derive(Clone, Copy, Default, Debug)]
pub struct GcStats {
    pub total_gcs: usize,
    /// Surviving bytes in the small area after the last cycle.
    pub small_marked: usize,
    pub small_free: usize,
    pub large_marked: usize,
    pub large_freed: usize,
    pub large_free: usize,
    pub small_committed: usize,
    pub large_committed: usize,
    pub fixed_committed: usize,
}

/// The process-wide memory manager: every area, the root and finalization
/// bookkeeping, and the collector driving them. Not synchronized; `Heap`
/// wraps it behind a lock.
pub struct MemoryManager {
    pub(crate) regions: RegionTable,
    pub(crate) small: SmallObjectArea,
    pub(crate) large: LargeObjectArea,
    pub(crate) fixed: FixedHeap,
    pub(crate) roots: RootList,
    pub(crate) finalize: FinalizeQueues,
    pub(crate) constraints: Vec<Box<dyn FnMut(&mut Visitor)>>,
    pub(crate) config: Config,
    /// When set, Mark tries to retain an explicit live set so Sweep can be
    /// selective. Cleared only by tests that exercise the normal sweep.
    pub(crate) capture_live_set: bool,
    small_target: usize,
    stats: GcStats,
}

impl MemoryManager {
    pub fn new(config: Config) -> Self {
        let config = config.normalized();
        let mut mm = Self {
            regions: RegionTable::new(config.max_heap),
            small: SmallObjectArea::new(),
            large: LargeObjectArea::new(),
            fixed: FixedHeap::new(),
            roots: RootList::new(),
            finalize: FinalizeQueues::new(),
            constraints: Vec::new(),
            small_target: config.initial_heap,
            capture_live_set: true,
            stats: GcStats::default(),
            config,
        };
        mm.small
            .expand(&mut mm.regions, &mut mm.fixed, mm.config.initial_heap);
        mm
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Allocates a zero-filled object of `size` payload bytes and installs
    /// `descriptor` in its first word. The descriptor's kind selects the
    /// area and any root or finalizer registration.
    pub fn allocate(
        &mut self,
        size: usize,
        descriptor: &'static TypeDescriptor,
    ) -> Result<ObjectRef, OutOfMemory> {
        let payload_size = align_up(size.max(WORD), WORD);
        if descriptor.kind == FinalizeKind::Fixed {
            let p = self
                .fixed
                .allocate(&mut self.regions, payload_size)
                .ok_or(OutOfMemory)?;
            unsafe {
                p.cast::<*const TypeDescriptor>().write(descriptor);
                return Ok(ObjectRef::from_raw(p));
            }
        }

        let h = if payload_size <= LARGE_CUTOFF {
            self.allocate_small(WORD + payload_size)?
        } else {
            self.allocate_large(payload_size)?
        };
        let object = unsafe {
            let payload = Preheader::payload(h);
            std::ptr::write_bytes(payload, 0, payload_size);
            payload.cast::<*const TypeDescriptor>().write(descriptor);
            ObjectRef::from_raw(payload)
        };
        match descriptor.kind {
            FinalizeKind::Root => {
                if !self
                    .roots
                    .attach(&mut self.regions, &mut self.fixed, object.as_ptr(), descriptor)
                {
                    return Err(OutOfMemory);
                }
            }
            FinalizeKind::HasFinalizer => {
                if !self.finalize.register(
                    &mut self.regions,
                    &mut self.fixed,
                    object.as_ptr(),
                    descriptor,
                ) {
                    return Err(OutOfMemory);
                }
            }
            _ => {}
        }
        Ok(object)
    }

    /// Small-area slow path around the bump allocator: grow while under
    /// target, then collect, then grow past target; only when all three fail
    /// is the request refused.
    fn allocate_small(&mut self, total: usize) -> Result<*mut Preheader, OutOfMemory> {
        let mut collected = false;
        loop {
            if let Some(p) = self.small.allocate(&self.regions, total) {
                return Ok(p.cast());
            }
            if self.small.committed() < self.small_target
                && self.small.expand(&mut self.regions, &mut self.fixed, REGION_SIZE)
            {
                continue;
            }
            if !collected {
                self.collect_garbage(true);
                collected = true;
                continue;
            }
            if self.small.expand(&mut self.regions, &mut self.fixed, REGION_SIZE) {
                continue;
            }
            return Err(OutOfMemory);
        }
    }

    fn allocate_large(&mut self, payload_size: usize) -> Result<*mut Preheader, OutOfMemory> {
        let mut collected = false;
        loop {
            if let Some(p) = self.large.allocate(payload_size) {
                unsafe {
                    return Ok(Preheader::of_payload(p));
                }
            }
            if !collected {
                self.collect_garbage(true);
                collected = true;
                continue;
            }
            if self.large.expand(&mut self.regions, payload_size) {
                continue;
            }
            return Err(OutOfMemory);
        }
    }

    pub fn allocate_fixed(&mut self, size: usize) -> Result<*mut u8, OutOfMemory> {
        self.fixed
            .allocate(&mut self.regions, size)
            .ok_or(OutOfMemory)
    }

    pub fn resize_fixed(&mut self, p: *mut u8, new_size: usize) -> Result<*mut u8, OutOfMemory> {
        self.fixed
            .resize(&mut self.regions, p, new_size)
            .ok_or(OutOfMemory)
    }

    pub fn free_fixed(&mut self, p: *mut u8) {
        self.fixed.free(p);
    }

    /// Registers a permanent root located anywhere, with an optional
    /// descriptor for exact tracing.
    pub fn attach_root(
        &mut self,
        object: *mut u8,
        descriptor: *const TypeDescriptor,
    ) -> Result<(), OutOfMemory> {
        if self
            .roots
            .attach(&mut self.regions, &mut self.fixed, object, descriptor)
        {
            Ok(())
        } else {
            Err(OutOfMemory)
        }
    }

    /// Arranges for `descriptor`'s finalizer to run once after `object`
    /// becomes unreachable.
    pub fn set_finalizer(
        &mut self,
        object: ObjectRef,
        descriptor: &'static TypeDescriptor,
    ) -> Result<(), OutOfMemory> {
        if self.finalize.register(
            &mut self.regions,
            &mut self.fixed,
            object.as_ptr(),
            descriptor,
        ) {
            Ok(())
        } else {
            Err(OutOfMemory)
        }
    }

    /// Invoked during Mark; the closure reports additional roots through the
    /// visitor, every cycle.
    pub fn add_constraint(&mut self, constraint: impl FnMut(&mut Visitor) + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    /// One full stop-the-world cycle: retire the bump range, mark, sweep
    /// both automatic areas, then retune the small-area growth target.
    /// Returns the number of finalizers made pending by this cycle's deaths.
    pub fn collect_garbage(&mut self, out_of_memory: bool) -> usize {
        self.small.retire_current_range();
        let outcome = Marker::run(self);
        let small_stats = sweep::sweep_small(self, outcome.live_set);
        let (large_marked, large_freed) = self.large.sweep();

        let marked = small_stats.marked;
        let mut target = (marked as f64 * self.config.growth_multiplier) as usize;
        target = target
            .max(marked + self.config.min_free)
            .min(marked + self.config.max_free);
        if out_of_memory {
            // The failed request must be able to grow past what survived.
            target = target.max(self.small.committed() + self.config.min_free);
        }
        self.small_target = align_up(target, REGION_SIZE).min(self.config.max_heap);

        self.stats.total_gcs += 1;
        self.stats.small_marked = small_stats.marked;
        self.stats.small_free = small_stats.free;
        self.stats.large_marked = large_marked;
        self.stats.large_freed = large_freed;
        self.stats.large_free = self.large.free_bytes();
        self.stats.small_committed = self.small.committed();
        self.stats.large_committed = self.large.committed();
        self.stats.fixed_committed = self.fixed.committed();
        crate::logln_if!(
            self.config.verbose,
            "gc #{}: small {}K marked / {}K free, large {}K marked / {}K freed, {} finalizable",
            self.stats.total_gcs,
            small_stats.marked / 1024,
            small_stats.free / 1024,
            large_marked / 1024,
            large_freed / 1024,
            self.finalize.pending_count()
        );
        self.finalize.pending_count()
    }

    /// Runs every pending finalizer inline, each under `catch_unwind` so a
    /// panicking finalizer cannot take the caller down. Returns how many ran.
    pub fn run_finalizers(&mut self) -> usize {
        let mut ran = 0;
        while let Some(node) = self.finalize.pop_pending() {
            unsafe {
                let object = (*node).object;
                let descriptor = (*node).descriptor;
                if !descriptor.is_null() {
                    let shape = (*descriptor).shape;
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        shape.finalize(ObjectRef::from_raw(object));
                    }));
                    if result.is_err() {
                        crate::logln_if!(self.config.verbose, "finalizer panicked; discarded");
                    }
                }
            }
            FinalizeQueues::release_node(&mut self.fixed, node);
            ran += 1;
        }
        ran
    }

    pub fn pending_finalizers(&self) -> usize {
        self.finalize.pending_count()
    }
}
