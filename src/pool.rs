use std::ptr::NonNull;

use crate::{
    AllocError,
    block::{BLOCK_HEADER_SIZE, Block, MIN_BLOCK_SIZE},
    freeheap::FreeHeap,
    source::MemorySource,
    utils::{ALIGNMENT, align},
};

/// The pool: one contiguous memory region holding every block the allocator
/// has ever created.
///
/// ```text
///              Pool (grows to the right, never shrinks)
/// +-------------+------------+--------------+------------------+
/// | Block(used) | Block(free)| Block(used)  |   Block(free)    |
/// +-------------+------------+--------------+------------------+
///  ^ head                                    ^ tail
/// ```
///
/// Blocks sit back to back; the chain of `next` links walks them in
/// ascending address order and spans the whole region with no gaps. Free
/// blocks are additionally tracked by the [`FreeHeap`] so allocation does
/// not have to walk the chain.
pub(crate) struct Pool<S> {
    /// Where new memory comes from when no free block fits.
    source: S,
    /// Total bytes obtained from the source so far.
    size: usize,
    /// First block of the chain, lowest address of the pool.
    head: NonNull<Block>,
    /// Last block of the chain; growth appends after it.
    tail: NonNull<Block>,
    /// Size-ordered index of the free blocks.
    free: FreeHeap,
}

// The pool exclusively owns every block header reachable from `head`, and
// the source owns the backing region, so moving it across threads is fine.
unsafe impl<S: Send> Send for Pool<S> {}

impl<S: MemorySource> Pool<S> {
    /// Obtains `total_size` bytes from `source` up front and installs the
    /// single resulting extent as one free block spanning the whole region
    /// minus its own header.
    pub fn bootstrap(mut source: S, total_size: usize) -> Result<Self, AllocError> {
        let total = align(total_size, ALIGNMENT);
        if total < BLOCK_HEADER_SIZE + ALIGNMENT {
            return Err(AllocError::PoolTooSmall {
                requested: total_size,
            });
        }

        let base = source.extend(total).ok_or(AllocError::SourceExhausted)?;

        let first = base.cast::<Block>();
        unsafe {
            first.as_ptr().write(Block {
                size: total - BLOCK_HEADER_SIZE,
                is_free: true,
                next: None,
            });
        }

        let mut free = FreeHeap::new();
        free.push(first);

        Ok(Self {
            source,
            size: total,
            head: first,
            tail: first,
            free,
        })
    }

    /// Total bytes obtained from the source so far, headers included.
    pub fn total_size(&self) -> usize {
        self.size
    }

    /// Picks a free block able to hold `size` bytes, growing the pool when
    /// the index has nothing fitting. The returned block is out of the
    /// index and already marked used.
    pub fn take(&mut self, size: usize) -> Result<NonNull<Block>, AllocError> {
        match self.free.take_fit(size) {
            Some(mut block) => {
                unsafe {
                    block.as_mut().is_free = false;
                }
                Ok(block)
            }
            None => self.grow(size),
        }
    }

    /// Appends a fresh used block of exactly `size` payload bytes to the
    /// chain tail. One-shot: no cushion beyond what was asked for.
    fn grow(&mut self, size: usize) -> Result<NonNull<Block>, AllocError> {
        let addr = self
            .source
            .extend(size + BLOCK_HEADER_SIZE)
            .ok_or(AllocError::SourceExhausted)?;

        let block = addr.cast::<Block>();
        unsafe {
            block.as_ptr().write(Block {
                size,
                is_free: false,
                next: None,
            });
            self.tail.as_mut().next = Some(block);
        }

        self.tail = block;
        self.size += size + BLOCK_HEADER_SIZE;

        Ok(block)
    }

    /// Carves the excess of `block` beyond `size` into a new free block
    /// placed right after it in the chain.
    ///
    /// Leftovers smaller than [`MIN_BLOCK_SIZE`] are not worth a header of
    /// their own; the whole block stays with the caller, excess included.
    pub fn split(&mut self, mut block: NonNull<Block>, size: usize) {
        unsafe {
            if block.as_ref().size < size + BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE {
                return;
            }

            let rest = NonNull::new_unchecked(
                Block::payload(block).as_ptr().add(size).cast::<Block>(),
            );
            rest.as_ptr().write(Block {
                size: block.as_ref().size - size - BLOCK_HEADER_SIZE,
                is_free: true,
                next: block.as_ref().next,
            });

            block.as_mut().size = size;
            block.as_mut().next = Some(rest);
            if self.tail == block {
                self.tail = rest;
            }

            self.free.push(rest);
        }
    }

    /// Marks `block` free, absorbs every free block that follows it in the
    /// chain, then reindexes the merged result.
    ///
    /// Merging is forward-only: a free predecessor stays a separate block
    /// until it is itself released again through a later allocation.
    pub fn release(&mut self, mut block: NonNull<Block>) {
        unsafe {
            block.as_mut().is_free = true;

            while let Some(next) = block.as_ref().next {
                if !next.as_ref().is_free {
                    break;
                }

                // The absorbed header stops existing as a block of its own;
                // its index entry goes with it.
                self.free.remove(next);

                block.as_mut().size += BLOCK_HEADER_SIZE + next.as_ref().size;
                block.as_mut().next = next.as_ref().next;
                if self.tail == next {
                    self.tail = block;
                }
            }

            self.free.push(block);
        }
    }
}

#[cfg(test)]
impl<S: MemorySource> Pool<S> {
    /// Walks the whole chain checking the structural invariants: blocks sit
    /// back to back with no gaps or overlaps, the chain covers the grown
    /// region exactly, and the free index agrees with the block flags.
    pub fn check_invariants(&self) {
        unsafe {
            let mut spanned = 0;
            let mut free_blocks = Vec::new();
            let mut last = self.head;
            let mut cursor = Some(self.head);

            while let Some(block) = cursor {
                if let Some(next) = block.as_ref().next {
                    let end = Block::payload(block).as_ptr().add(block.as_ref().size);
                    assert_eq!(
                        end,
                        next.as_ptr().cast::<u8>(),
                        "chain has a gap or an overlap"
                    );
                }

                spanned += BLOCK_HEADER_SIZE + block.as_ref().size;
                if block.as_ref().is_free {
                    free_blocks.push(block);
                }

                last = block;
                cursor = block.as_ref().next;
            }

            assert_eq!(last, self.tail, "tail does not close the chain");
            assert_eq!(spanned, self.size, "chain does not cover the pool");

            for &block in &free_blocks {
                assert_eq!(self.free.count_of(block), 1, "free block indexed wrongly");
            }
            assert_eq!(self.free.len(), free_blocks.len(), "stale index entries");
            self.free.assert_heap_order();
        }
    }

    /// Sum of the free block sizes, headers excluded.
    pub fn free_capacity(&self) -> usize {
        let mut capacity = 0;
        let mut cursor = Some(self.head);

        while let Some(block) = cursor {
            unsafe {
                if block.as_ref().is_free {
                    capacity += block.as_ref().size;
                }
                cursor = block.as_ref().next;
            }
        }

        capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ArenaSource;

    fn pool(total: usize) -> Pool<ArenaSource> {
        Pool::bootstrap(ArenaSource::with_capacity(total * 2), total).unwrap()
    }

    #[test]
    fn bootstrap_installs_single_free_block() {
        let pool = pool(4096);

        assert_eq!(pool.head, pool.tail);
        assert_eq!(pool.total_size(), 4096);
        unsafe {
            assert!(pool.head.as_ref().is_free);
            assert_eq!(pool.head.as_ref().size, 4096 - BLOCK_HEADER_SIZE);
        }
        pool.check_invariants();
    }

    #[test]
    fn bootstrap_rejects_tiny_pools() {
        let result = Pool::bootstrap(ArenaSource::with_capacity(64), 8);
        assert!(matches!(result, Err(AllocError::PoolTooSmall { .. })));
    }

    #[test]
    fn bootstrap_propagates_source_exhaustion() {
        let result = Pool::bootstrap(ArenaSource::with_capacity(0), 4096);
        assert!(matches!(result, Err(AllocError::SourceExhausted)));
    }

    #[test]
    fn take_prefers_the_index_over_growth() {
        let mut pool = pool(4096);
        let before = pool.total_size();

        let block = pool.take(64).unwrap();

        assert_eq!(block, pool.head);
        assert_eq!(pool.total_size(), before);
        unsafe {
            assert!(!block.as_ref().is_free);
        }
    }

    #[test]
    fn take_grows_when_nothing_fits() {
        let mut pool =
            Pool::bootstrap(ArenaSource::with_capacity(8192), 256).unwrap();
        let before = pool.total_size();

        let block = pool.take(1024).unwrap();

        assert_eq!(pool.tail, block);
        assert_eq!(pool.total_size(), before + 1024 + BLOCK_HEADER_SIZE);
        pool.check_invariants();
    }

    #[test]
    fn take_reports_out_of_memory() {
        let mut pool =
            Pool::bootstrap(ArenaSource::with_capacity(256), 256).unwrap();

        let result = pool.take(4096);

        assert!(matches!(result, Err(AllocError::SourceExhausted)));
        pool.check_invariants();
    }

    #[test]
    fn split_carves_the_leftover_into_a_free_block() {
        let mut pool = pool(4096);

        let block = pool.take(64).unwrap();
        pool.split(block, 64);

        unsafe {
            assert_eq!(block.as_ref().size, 64);
            let rest = block.as_ref().next.expect("split linked a new block");
            assert!(rest.as_ref().is_free);
            assert_eq!(
                rest.as_ref().size,
                4096 - 2 * BLOCK_HEADER_SIZE - 64
            );
            assert_eq!(pool.tail, rest);
        }
        pool.check_invariants();
    }

    #[test]
    fn split_skips_leftovers_below_the_threshold() {
        let total = BLOCK_HEADER_SIZE + 128;
        let mut pool = pool(total);

        let block = pool.take(112).unwrap();
        pool.split(block, 112);

        // 128 - 112 leaves no room for a header plus MIN_BLOCK_SIZE, so the
        // caller keeps the whole 128 bytes.
        unsafe {
            assert_eq!(block.as_ref().size, 128);
            assert!(block.as_ref().next.is_none());
        }
        pool.check_invariants();
    }

    #[test]
    fn release_coalesces_forward() {
        let mut pool = pool(4096);

        let first = pool.take(64).unwrap();
        pool.split(first, 64);
        let second = pool.take(64).unwrap();
        pool.split(second, 64);
        let third = pool.take(64).unwrap();
        pool.split(third, 64);

        pool.release(second);
        pool.release(first);

        // `first` absorbed `second` and its header, `third` kept it from
        // reaching the trailing free block.
        unsafe {
            assert_eq!(first.as_ref().size, 64 + BLOCK_HEADER_SIZE + 64);
            assert_eq!(first.as_ref().next, Some(third));
        }
        pool.check_invariants();
    }

    #[test]
    fn release_does_not_merge_backward() {
        let mut pool = pool(4096);

        let first = pool.take(64).unwrap();
        pool.split(first, 64);
        let second = pool.take(64).unwrap();
        pool.split(second, 64);

        pool.release(first);
        pool.release(second);

        // `second` merged with the trailing free block, but `first` stayed
        // a block of its own: merging never looks backward.
        unsafe {
            assert_eq!(first.as_ref().size, 64);
            assert_eq!(first.as_ref().next, Some(second));
            assert_eq!(pool.tail, second);
        }
        pool.check_invariants();
    }

    #[test]
    fn release_absorbs_up_to_the_tail() {
        let mut pool = pool(4096);

        let block = pool.take(64).unwrap();
        pool.split(block, 64);

        pool.release(block);

        // The whole pool is one free block again.
        assert_eq!(pool.head, pool.tail);
        unsafe {
            assert_eq!(block.as_ref().size, 4096 - BLOCK_HEADER_SIZE);
        }
        pool.check_invariants();
    }
}
