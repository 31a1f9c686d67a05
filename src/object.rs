use crate::globals::WORD;
use crate::header::Preheader;
use crate::mark::Visitor;
use std::ptr::NonNull;

/// How an object participates in collection, decided by its type descriptor
/// at allocation time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FinalizeKind {
    /// Ordinary automatically managed object.
    Normal,
    /// Automatically managed, registered as a permanent root on allocation.
    Root,
    /// Allocated from the fixed heap; never scanned, never collected.
    Fixed,
    /// Automatically managed with a one-shot finalizer to run before the
    /// memory is reused.
    HasFinalizer,
}

/// How the collector walks the reference fields of one object shape. One
/// implementation exists per distinct shape (per class plus a handful of
/// VM-internal layouts); it is supplied by the class/type system and is
/// read-only to the collector.
pub trait ObjectShape: Sync {
    /// Reports every reference held by `object` to the visitor.
    fn trace(&self, object: ObjectRef, vis: &mut Visitor);

    /// User-level cleanup, run exactly once after the object becomes
    /// unreachable and before its memory is reused. Panics are discarded at
    /// the invocation boundary.
    fn finalize(&self, object: ObjectRef) {
        let _ = object;
    }
}

/// Per-shape metadata shared by all instances of that shape.
pub struct TypeDescriptor {
    pub kind: FinalizeKind,
    pub shape: &'static dyn ObjectShape,
}

impl TypeDescriptor {
    pub const fn new(kind: FinalizeKind, shape: &'static dyn ObjectShape) -> Self {
        Self { kind, shape }
    }
}

/// Reference to an automatically managed object. Points at the payload; the
/// preheader sits one word below, and the first payload word holds the
/// object's `TypeDescriptor` (the VM's class word), written by `allocate`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct ObjectRef(pub(crate) NonNull<u8>);

impl ObjectRef {
    /// # Safety
    /// `ptr` must point at the payload of a live allocation from this
    /// subsystem.
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self(NonNull::new_unchecked(ptr))
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub(crate) fn header(self) -> *mut Preheader {
        Preheader::of_payload(self.0.as_ptr())
    }

    /// The object's descriptor word. Null while the VM has not initialized
    /// the object yet; such objects are treated as leaves by Mark.
    pub fn descriptor(self) -> *const TypeDescriptor {
        unsafe { self.0.as_ptr().cast::<*const TypeDescriptor>().read() }
    }

    /// Payload size in bytes, descriptor word included.
    pub fn size(self) -> usize {
        unsafe { (*self.header()).size() - WORD }
    }

    /// Reads a reference field at `offset` bytes into the payload.
    ///
    /// # Safety
    /// The field at `offset` must hold either null or a valid object payload
    /// address.
    pub unsafe fn read_field(self, offset: usize) -> Option<ObjectRef> {
        let word = self.0.as_ptr().add(offset).cast::<*mut u8>().read();
        NonNull::new(word).map(ObjectRef)
    }

    /// Stores a reference field at `offset` bytes into the payload.
    ///
    /// # Safety
    /// `offset` must lie within the payload and be word-aligned.
    pub unsafe fn write_field(self, offset: usize, value: Option<ObjectRef>) {
        let word = value.map_or(core::ptr::null_mut(), |o| o.as_ptr());
        self.0.as_ptr().add(offset).cast::<*mut u8>().write(word);
    }
}
