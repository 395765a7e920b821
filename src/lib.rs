//! Pool-backed dynamic memory allocator.
//!
//! The allocator owns one contiguous memory region obtained from a
//! [`MemorySource`] and serves allocation, resizing and release requests
//! out of it. Every extent handed to a caller is preceded by a block header
//! with its metadata, therefore
//!
//! ```text
//! +--------------------------------+
//! | Header   | Actual memory block |
//! +--------------------------------+
//! ```
//!
//! The returned pointer is at the start of the memory block.
//!
//! Freed blocks are reused through a size-ordered index and merged with the
//! free blocks that follow them, so the pool only grows when nothing in it
//! fits a request.
//!
//! A single lock guards all of the allocator's bookkeeping, which makes the
//! operations safe to call from any number of threads. Payload work (the
//! zero-fill of fresh allocations, the copy performed by [`Allocator::resize`])
//! happens outside of that lock: once a block's header says it is used, no
//! other thread can reach it, and its content belongs to the caller alone.
//!
//! ```
//! use poolalloc::{Allocator, ArenaSource};
//!
//! let allocator = Allocator::with_source(64 * 1024, ArenaSource::with_capacity(128 * 1024));
//!
//! let ptr = allocator.allocate(256).expect("no memory");
//! unsafe {
//!     ptr.as_ptr().write(42);
//!     assert_eq!(ptr.as_ptr().read(), 42);
//!     allocator.release(ptr.as_ptr());
//! }
//! ```

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

mod block;
mod freeheap;
mod pool;
pub mod source;
mod utils;

use crate::{
    block::Block,
    pool::Pool,
    utils::{ALIGNMENT, align},
};

pub use crate::source::{ArenaSource, MemorySource, SystemBreak};

/// Failures the pool can report.
///
/// Callers of [`Allocator::allocate`] and [`Allocator::resize`] only ever
/// see these as a `None` result; the error type itself surfaces from
/// [`Allocator::try_with_source`], where the distinction matters.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The memory source could not supply the requested extent.
    #[error("memory source exhausted")]
    SourceExhausted,
    /// The requested pool cannot hold a block header plus one aligned word
    /// of payload.
    #[error("a pool of {requested} bytes cannot hold a single block")]
    PoolTooSmall {
        /// The size the pool was asked to start with.
        requested: usize,
    },
}

/// The allocator: a memory pool behind a lock, plus the logging toggle.
///
/// All operations take `&self`; share the allocator between threads with an
/// `Arc` (or a `'static` borrow) and call it from all of them. Dropping it
/// tears the pool down and invalidates every outstanding pointer, which is
/// why drop requires exclusive access.
pub struct Allocator<S: MemorySource = SystemBreak> {
    pool: Mutex<Pool<S>>,
    logging: AtomicBool,
}

impl Allocator<SystemBreak> {
    /// Creates an allocator drawing from the platform's program break.
    ///
    /// `total_size` bytes are obtained up front; the pool grows past them
    /// only when a request cannot be served from freed space. Aborts the
    /// process when the initial region cannot be obtained, see
    /// [`Allocator::with_source`].
    pub fn new(total_size: usize) -> Self {
        Self::with_source(total_size, SystemBreak::new())
    }
}

impl<S: MemorySource> Allocator<S> {
    /// Creates an allocator drawing from `source`.
    ///
    /// Aborts the process when the initial region cannot be obtained:
    /// without a pool nothing else can function, so this failure is not
    /// recoverable. The diagnostic is printed whether logging is enabled or
    /// not. Use [`Allocator::try_with_source`] to handle the failure
    /// instead.
    pub fn with_source(total_size: usize, source: S) -> Self {
        match Self::try_with_source(total_size, source) {
            Ok(allocator) => allocator,
            Err(err) => {
                eprintln!("failed to initialize memory pool: {err}");
                std::process::abort();
            }
        }
    }

    /// Creates an allocator drawing from `source`, reporting failure to the
    /// caller instead of aborting.
    pub fn try_with_source(total_size: usize, source: S) -> Result<Self, AllocError> {
        let pool = Pool::bootstrap(source, total_size)?;
        trace!(total = pool.total_size(), "pool initialized");

        Ok(Self {
            pool: Mutex::new(pool),
            logging: AtomicBool::new(false),
        })
    }

    /// Turns the per-operation trace lines on or off.
    ///
    /// Purely observational: the lines are emitted after an operation has
    /// finished its state changes and never affect results.
    pub fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    fn logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    /// Allocates `size` bytes and returns the address of the zero-filled
    /// payload.
    ///
    /// The size is rounded up to the word boundary; the block actually
    /// handed over can be somewhat larger when its excess was too small to
    /// split off. Returns `None` for zero-sized requests and when the pool
    /// cannot grow any further.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align(size, ALIGNMENT);

        let payload = {
            let mut pool = self.pool.lock();
            let block = pool.take(size).ok()?;
            pool.split(block, size);
            unsafe { Block::payload(block) }
        };

        // The header already says "used", so no other thread can select
        // this block; only caller-owned payload bytes are touched past the
        // lock.
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, size);
        }

        if self.logging() {
            trace!(size, addr = ?payload, "allocated");
        }

        Some(payload)
    }

    /// Releases a payload previously returned by [`Allocator::allocate`] or
    /// [`Allocator::resize`]. A null `ptr` is a no-op.
    ///
    /// The freed block absorbs any free blocks directly after it and goes
    /// back into the free index for reuse.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an address obtained from this allocator that
    /// has not been released since. Foreign and already-released pointers
    /// are not detected and lead to undefined behavior.
    pub unsafe fn release(&self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        {
            let mut pool = self.pool.lock();
            let block = unsafe { Block::from_payload(payload) };
            pool.release(block);
        }

        if self.logging() {
            trace!(addr = ?payload, "freed");
        }
    }

    /// Resizes the allocation at `ptr` to hold `new_size` bytes.
    ///
    /// A null `ptr` behaves like [`Allocator::allocate`]; `new_size == 0`
    /// behaves like [`Allocator::release`] and returns `None`. When the
    /// existing block already covers `new_size` the same address comes back
    /// untouched; there is no shrinking. Otherwise the content moves to a
    /// fresh allocation and the old block is released. Returns `None` with
    /// the original allocation intact when the fresh allocation fails.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::release`]: `ptr` must be null or a
    /// live address obtained from this allocator.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            unsafe {
                self.release(ptr);
            }
            return None;
        }

        let block = unsafe { Block::from_payload(payload) };
        let old_size = {
            let _pool = self.pool.lock();
            unsafe { block.as_ref().size }
        };
        if old_size >= new_size {
            return Some(payload);
        }

        let grown = self.allocate(new_size)?;

        // Both blocks are marked used, so neither can move or be reused
        // under us; the copy itself needs no lock.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), grown.as_ptr(), old_size);
            self.release(ptr);
        }

        if self.logging() {
            trace!(from = ?payload, to = ?grown, size = new_size, "resized");
        }

        Some(grown)
    }
}

impl<S: MemorySource> Drop for Allocator<S> {
    fn drop(&mut self) {
        if self.logging() {
            trace!(total = self.pool.get_mut().total_size(), "pool torn down");
        }
    }
}
