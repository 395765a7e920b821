//! Boundary between the pool and the operating system.
//!
//! The pool never talks to syscalls directly; it asks a [`MemorySource`] for
//! more bytes and works with whatever comes back. This keeps the low level,
//! platform-dependant part of the allocator in one place and lets the test
//! suite run the whole engine against plain buffers.

use std::{mem, ptr::NonNull};

/// Where the pool's backing memory comes from.
///
/// The pool relies on every successful call returning an extent that begins
/// exactly where the previous one ended: growth is monotonic and extents are
/// never relocated. A source that hands back disjoint or moving regions will
/// corrupt the block chain, because merging assumes chain neighbours are
/// address neighbours.
pub trait MemorySource {
    /// Obtains `len` more bytes, or `None` when the source cannot extend.
    ///
    /// `len` is always a multiple of the word size, so the returned extents
    /// stay aligned as long as the first one is.
    fn extend(&mut self, len: usize) -> Option<NonNull<u8>>;
}

#[cfg(unix)]
mod unix {
    use std::ptr::NonNull;

    use libc::{c_void, intptr_t, sbrk};

    use super::MemorySource;

    /// Grows the process data segment through [`libc::sbrk`].
    ///
    /// The program break moves monotonically upwards, which is exactly the
    /// contract [`MemorySource`] asks for, as long as nothing else in the
    /// process moves the break between two calls. A process using this
    /// source as its allocator satisfies that by construction.
    pub struct SystemBreak;

    impl SystemBreak {
        pub const fn new() -> Self {
            Self
        }
    }

    impl MemorySource for SystemBreak {
        fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = sbrk(len as intptr_t);

                if addr == usize::MAX as *mut c_void {
                    return None;
                }

                NonNull::new(addr.cast::<u8>())
            }
        }
    }
}

#[cfg(unix)]
pub use unix::SystemBreak;

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, ptr::NonNull};

    use windows::Win32::System::Memory;

    use super::MemorySource;

    /// Address space reserved per source. Commits walk through it upwards,
    /// so this bounds how far a single pool can grow.
    const RESERVE_LIMIT: usize = 1 << 34;

    /// Program-break style growth on top of `VirtualAlloc`: one large
    /// reservation up front, committed chunk by chunk as the pool grows.
    /// Windows has no `sbrk`, but committing through a reservation gives the
    /// same monotonic, non-relocating extents.
    pub struct SystemBreak {
        base: *mut u8,
        committed: usize,
    }

    impl SystemBreak {
        pub const fn new() -> Self {
            Self {
                base: std::ptr::null_mut(),
                committed: 0,
            }
        }
    }

    impl MemorySource for SystemBreak {
        fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                if self.base.is_null() {
                    let reserved = Memory::VirtualAlloc(
                        None,
                        RESERVE_LIMIT,
                        Memory::MEM_RESERVE,
                        Memory::PAGE_NOACCESS,
                    );
                    if reserved.is_null() {
                        return None;
                    }
                    self.base = reserved.cast();
                }

                if self.committed + len > RESERVE_LIMIT {
                    return None;
                }

                let addr = self.base.add(self.committed);

                // Committing rounds to page boundaries on its own;
                // re-committing an already committed page is a no-op.
                let committed = Memory::VirtualAlloc(
                    Some(addr.cast::<c_void>().cast_const()),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );
                if committed.is_null() {
                    return None;
                }

                self.committed += len;
                NonNull::new(addr)
            }
        }
    }
}

#[cfg(windows)]
pub use windows::SystemBreak;

/// Serves extents out of an owned buffer.
///
/// The backbone of the test suite, and also the way to embed a pool inside
/// memory the process already owns. Word-sized storage keeps every extent
/// word-aligned.
pub struct ArenaSource {
    storage: Vec<u64>,
    /// Bytes handed out so far.
    used: usize,
}

impl ArenaSource {
    /// Creates a source able to serve up to `bytes` bytes in total, rounded
    /// up to the next word.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            storage: vec![0; bytes.div_ceil(mem::size_of::<u64>())],
            used: 0,
        }
    }

    /// Total number of bytes this source can ever hand out.
    pub fn capacity(&self) -> usize {
        self.storage.len() * mem::size_of::<u64>()
    }
}

impl MemorySource for ArenaSource {
    fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        debug_assert!(len % mem::size_of::<usize>() == 0);

        if self.used + len > self.capacity() {
            return None;
        }

        let addr = unsafe { self.storage.as_mut_ptr().cast::<u8>().add(self.used) };
        self.used += len;

        NonNull::new(addr)
    }
}
