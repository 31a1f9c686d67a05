//! Process-wide memory management for a virtual machine: a region-backed
//! allocator split into small, large and fixed areas, collected by a
//! conservative, non-relocating, stop-the-world mark-and-sweep collector.
//!
//! The VM sees three things: [`Heap`] (the locked front end), [`ObjectRef`]
//! (a payload pointer with a one-word preheader below it) and
//! [`TypeDescriptor`] (the class word installed in every object's first
//! payload word, through which Mark traces references).

#[macro_export]
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            println!($($t)*);
        }
    };
}

pub mod globals;
mod header;
mod mmap;
mod region;

mod manual;

mod fixed;
mod large;
mod small;

mod finalize;
mod mark;
mod object;
mod roots;
mod sweep;

mod heap;
mod manager;

#[cfg(test)]
mod tests;

pub use heap::Heap;
pub use manager::{parse_size, Config, GcStats, MemoryManager};
pub use mark::Visitor;
pub use object::{FinalizeKind, ObjectRef, ObjectShape, TypeDescriptor};

use thiserror::Error;

/// Allocation failure: the memory ceiling was reached and a collection could
/// not free enough space. Never aborts the process; the VM turns this into
/// its own out-of-memory error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory: heap ceiling reached and collection freed too little")]
pub struct OutOfMemory;
