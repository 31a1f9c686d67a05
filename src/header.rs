use crate::globals::WORD;
use modular_bitfield::prelude::*;

// The preheader is the single word immediately preceding every small, large
// and fixed allocation.
//
// +--------------+------+----------------------------------------------+
// | name         | bits |                                              |
// +--------------+------+----------------------------------------------+
// | size         |   61 | In word granules; distance to the next       |
// |              |      | header, including this one.                  |
// | mark bit     |    1 | Set during Mark, cleared during Sweep.       |
// | free bit     |    1 | Small object area: chunk is free memory.     |
// | prev-in-use  |    1 | Manual manager: the chunk before this one is |
// |              |      | allocated, so there is no footer to read.    |
// +--------------+------+----------------------------------------------+
//
// The size field, once a chunk is carved, always equals the distance to the
// next header. That is what keeps every block and every manual region
// linearly parseable.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct EncodedWord {
    size: B61,
    marked: bool,
    free: bool,
    prev_in_use: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Preheader {
    encoded: EncodedWord,
}

impl Preheader {
    pub fn new(size: usize, free: bool, prev_in_use: bool) -> Self {
        debug_assert!(size % WORD == 0);
        Self {
            encoded: EncodedWord::new()
                .with_size((size / WORD) as u64)
                .with_marked(false)
                .with_free(free)
                .with_prev_in_use(prev_in_use),
        }
    }

    /// Distance in bytes to the next header. Zero marks a region epilogue.
    #[inline(always)]
    pub fn size(self) -> usize {
        self.encoded.size() as usize * WORD
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size % WORD == 0);
        self.encoded.set_size((size / WORD) as u64);
    }

    #[inline(always)]
    pub fn is_marked(self) -> bool {
        self.encoded.marked()
    }

    /// Sets the mark bit. Returns `false` when the object was already marked,
    /// which makes marking idempotent.
    #[inline(always)]
    pub fn try_mark(&mut self) -> bool {
        if self.is_marked() {
            return false;
        }
        self.encoded.set_marked(true);
        true
    }

    #[inline(always)]
    pub fn clear_mark(&mut self) {
        self.encoded.set_marked(false);
    }

    #[inline(always)]
    pub fn is_free(self) -> bool {
        self.encoded.free()
    }

    #[inline(always)]
    pub fn set_free(&mut self, free: bool) {
        self.encoded.set_free(free);
    }

    #[inline(always)]
    pub fn prev_in_use(self) -> bool {
        self.encoded.prev_in_use()
    }

    #[inline(always)]
    pub fn set_prev_in_use(&mut self, in_use: bool) {
        self.encoded.set_prev_in_use(in_use);
    }

    /// Payload address of the object owning this header.
    #[inline(always)]
    pub fn payload(this: *mut Preheader) -> *mut u8 {
        (this as usize + WORD) as *mut u8
    }

    /// Header of the chunk following this one.
    #[inline(always)]
    pub fn next_header(this: *mut Preheader) -> *mut Preheader {
        unsafe { (this as usize + (*this).size()) as *mut Preheader }
    }

    #[inline(always)]
    pub fn of_payload(payload: *mut u8) -> *mut Preheader {
        (payload as usize - WORD) as *mut Preheader
    }
}
