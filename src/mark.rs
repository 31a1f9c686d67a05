use crate::globals::{BLOCK_SIZE, WORD};
use crate::header::Preheader;
use crate::manager::MemoryManager;
use crate::object::{ObjectRef, TypeDescriptor};
use crate::region::RegionKind;
use crate::small::block_bit_test;

/// State of the mark stack, entered strictly in this order as pressure
/// grows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MarkMode {
    /// The stack doubles as an explicit live set for the small object area;
    /// everything marked so far is retained and a scan cursor replaces
    /// popping. Enables the selective sweep.
    Collecting,
    /// Plain depth-first worklist; the live set has been discarded.
    Normal,
    /// The worklist itself overflowed; recovery degrades to full linear
    /// walks of the heap.
    Overflow,
}

pub(crate) struct MarkOutcome {
    /// Every marked object, verbatim, when Mark finished in Collecting
    /// state.
    pub live_set: Option<Vec<*mut Preheader>>,
}

/// Handed to `ObjectShape::trace` implementations and marking constraints so
/// they can report the references they hold.
pub struct Visitor<'a> {
    pub(crate) marker: &'a mut Marker,
}

impl<'a> Visitor<'a> {
    /// Marks `object` reachable and queues it for tracing. Idempotent.
    pub fn visit(&mut self, object: ObjectRef) {
        self.marker.mark_header(object.header());
    }

    /// Conservative scan of `len` bytes starting at `base`: every aligned
    /// word is treated as a potential pointer and validated against the
    /// region table plus area-specific exactness checks before being marked.
    /// This is how live thread stacks are fed into Mark.
    ///
    /// This is the collector's sole trust boundary: `base..base+len` must be
    /// readable memory, but the words found there may be arbitrary garbage.
    pub fn walk_conservative(&mut self, base: *const u8, len: usize) {
        let start = crate::globals::align_up(base as usize, WORD);
        let end = base as usize + len;
        let mut scan = start;
        while scan + WORD <= end {
            let word = unsafe { (scan as *const usize).read() };
            self.marker.mark_conservative(word);
            scan += WORD;
        }
    }
}

pub(crate) struct Marker {
    mm: *mut MemoryManager,
    items: Vec<*mut Preheader>,
    capacity: usize,
    threshold: usize,
    scan: usize,
    mode: MarkMode,
    /// A push was dropped since the last recovery pass.
    overflowed: bool,
}

impl Marker {
    fn new(mm: &mut MemoryManager) -> Self {
        let capacity = mm.config.mark_stack_capacity;
        let committed = mm.small.committed() + mm.large.committed();
        // A fraction of the heap, capped at half the stack: beyond that the
        // explicit live set is unlikely to pay for itself.
        let threshold = (committed / 256).min(capacity / 2).max(1);
        let mode = if mm.capture_live_set {
            MarkMode::Collecting
        } else {
            MarkMode::Normal
        };
        Self {
            mm: mm as *mut MemoryManager,
            items: Vec::with_capacity(capacity),
            capacity,
            threshold,
            scan: 0,
            mode,
            overflowed: false,
        }
    }

    /// Runs the whole mark phase: roots, constraints, transitive closure,
    /// overflow recovery and finalization reachability.
    pub(crate) fn run(mm: &mut MemoryManager) -> MarkOutcome {
        let mut marker = Marker::new(mm);
        let mm = marker.mm;
        unsafe {
            (*mm).roots.for_each(|object, descriptor| {
                marker.mark_root(object, descriptor);
            });
            let mut constraints = std::mem::take(&mut (*mm).constraints);
            for constraint in constraints.iter_mut() {
                constraint(&mut Visitor {
                    marker: &mut marker,
                });
            }
            (*mm).constraints = constraints;
            // Objects still awaiting an earlier cycle's finalizer are not
            // reclaimable yet.
            (*mm).finalize.for_each_pending(|object| {
                marker.mark_header(Preheader::of_payload(object));
            });
        }
        marker.drain();
        marker.recover_if_overflowed();

        // Objects awaiting a finalizer must survive the collection that will
        // run it, together with everything they reference.
        unsafe {
            let finalize = &mut (*mm).finalize;
            finalize.partition(
                |object| (*Preheader::of_payload(object)).is_marked(),
                |object| marker.mark_header(Preheader::of_payload(object)),
            );
        }
        marker.drain();
        marker.recover_if_overflowed();

        MarkOutcome {
            live_set: if marker.mode == MarkMode::Collecting {
                Some(marker.items)
            } else {
                None
            },
        }
    }

    fn mark_header(&mut self, h: *mut Preheader) {
        unsafe {
            if !(*h).try_mark() {
                return;
            }
        }
        if self.items.len() == self.capacity {
            // The object stays marked; its children are picked up by the
            // recovery walk.
            self.mode = MarkMode::Overflow;
            self.overflowed = true;
            return;
        }
        self.items.push(h);
        if self.mode == MarkMode::Collecting && self.items.len() > self.threshold {
            // Too many live objects for an explicit live set: drop the
            // already-scanned prefix and continue as an ordinary worklist.
            self.items.drain(..self.scan);
            self.scan = 0;
            self.mode = MarkMode::Normal;
        }
    }

    /// Registered roots may live in any area. Objects in the automatic areas
    /// go through the ordinary worklist; fixed-heap or foreign roots are
    /// traced through the descriptor recorded at registration, every cycle,
    /// without being queued.
    fn mark_root(&mut self, object: *mut u8, descriptor: *const TypeDescriptor) {
        unsafe {
            let kind = (*self.mm)
                .regions
                .find_region(object as usize)
                .map(|r| r.kind);
            match kind {
                Some(RegionKind::Small) | Some(RegionKind::Large) => {
                    self.mark_header(Preheader::of_payload(object));
                }
                _ => {
                    if !descriptor.is_null() {
                        let desc = &*descriptor;
                        desc.shape.trace(
                            ObjectRef::from_raw(object),
                            &mut Visitor { marker: self },
                        );
                    }
                }
            }
        }
    }

    /// Validates a potential pointer found by conservative scanning. Only
    /// exact payload addresses of live small or large objects are marked;
    /// everything else is ignored.
    fn mark_conservative(&mut self, addr: usize) {
        if addr & (WORD - 1) != 0 || addr < BLOCK_SIZE {
            return;
        }
        unsafe {
            let mm = &mut *self.mm;
            let region = match mm.regions.find_region(addr) {
                Some(r) => r,
                None => return,
            };
            match region.kind {
                RegionKind::Small => {
                    if let Some(h) = mm.small.exact_object_start(region, addr) {
                        self.mark_header(h);
                    }
                }
                RegionKind::Large => {
                    if let Some(h) = mm.large.contains(addr) {
                        self.mark_header(h);
                    }
                }
                RegionKind::Fixed => {}
            }
        }
    }

    /// Processes the worklist to exhaustion. In Collecting mode entries are
    /// retained and a cursor advances instead of popping.
    fn drain(&mut self) {
        loop {
            let h = match self.mode {
                MarkMode::Collecting => {
                    if self.scan < self.items.len() {
                        let h = self.items[self.scan];
                        self.scan += 1;
                        h
                    } else {
                        break;
                    }
                }
                _ => match self.items.pop() {
                    Some(h) => h,
                    None => break,
                },
            };
            self.trace_object(h);
        }
    }

    /// Traces one object's fields through its descriptor word. A null
    /// descriptor means the VM has not initialized the object yet; it has no
    /// traceable fields.
    fn trace_object(&mut self, h: *mut Preheader) {
        unsafe {
            let payload = Preheader::payload(h);
            let descriptor = payload.cast::<*const TypeDescriptor>().read();
            if descriptor.is_null() {
                return;
            }
            let object = ObjectRef::from_raw(payload);
            (*descriptor)
                .shape
                .trace(object, &mut Visitor { marker: self });
        }
    }

    fn recover_if_overflowed(&mut self) {
        // Worklist overflow recovery: abandon the stack and walk every
        // in-use block and every large-object entry, re-tracing the fields
        // of already-marked objects, until a full pass completes without
        // overflowing again. Each pass can only mark objects that were
        // unmarked before it, so the walk terminates.
        while self.overflowed {
            self.overflowed = false;
            self.mode = MarkMode::Normal;
            unsafe {
                let mm = self.mm;
                for region in (*mm).regions.iter() {
                    if region.kind != RegionKind::Small {
                        continue;
                    }
                    for idx in 0..region.block_count() {
                        if !block_bit_test(region, idx) {
                            continue;
                        }
                        let mut pos = region.start as usize + idx * BLOCK_SIZE;
                        let end = pos + BLOCK_SIZE;
                        while pos < end {
                            let h = pos as *mut Preheader;
                            let size = (*h).size();
                            if size == 0 {
                                break;
                            }
                            if !(*h).is_free() && (*h).is_marked() {
                                self.trace_object(h);
                                self.drain();
                            }
                            pos += size;
                        }
                    }
                }
                let mut marked_large = Vec::new();
                (*mm).large.for_each_object(|h| {
                    if (*h).is_marked() {
                        marked_large.push(h);
                    }
                });
                for h in marked_large {
                    self.trace_object(h);
                    self.drain();
                }
            }
        }
    }
}
