#[cfg(windows)]
pub mod _win {
    use crate::globals::BLOCK_SIZE;
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(
                    null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if mem.is_null() {
                    panic!("VirtualAlloc failed");
                }
                Self {
                    start: mem as *mut u8,
                }
            }
        }

        /// Return a `BLOCK_SIZE` aligned pointer into the mapping.
        pub fn aligned(&self) -> *mut u8 {
            let offset = (BLOCK_SIZE - (self.start as usize) % BLOCK_SIZE) % BLOCK_SIZE;
            unsafe { self.start.add(offset) }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::globals::BLOCK_SIZE;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                libc::madvise(map, size, libc::MADV_SEQUENTIAL);
                Self {
                    start: map as *mut u8,
                    size,
                }
            }
        }

        /// Return a `BLOCK_SIZE` aligned pointer into the mapping.
        pub fn aligned(&self) -> *mut u8 {
            let offset = (BLOCK_SIZE - (self.start as usize) % BLOCK_SIZE) % BLOCK_SIZE;
            unsafe { self.start.add(offset) }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
