use std::{mem, ptr::NonNull};

/// Header size of a block. Every extent handed to a caller is preceded by
/// exactly this many bytes of metadata.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Smallest leftover worth carving into a block of its own. Splitting below
/// this would produce blocks unable to satisfy even the smallest request
/// once their own header is paid for.
pub(crate) const MIN_BLOCK_SIZE: usize = 16;

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |    is_free (1b)     |        | -> Header
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        |
/// |         ...         |        | -> Addressable content
/// |         ...         |        |
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// Blocks live inside the pool's backing memory, back to back: the `next`
/// link of every block points exactly `BLOCK_HEADER_SIZE + size` bytes past
/// the block's own address, so the chain doubles as the adjacency map used
/// when merging. The link is forward-only; there is no way back.
///
/// As always, we need to take into account that every memory address has to
/// be aligned for CPU efficiency. The pool keeps block addresses aligned by
/// rounding every payload size and every extent length up to the word size,
/// see [`crate::utils::align`].
pub(crate) struct Block {
    /// Size of the addressable content, header excluded.
    pub size: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
    /// Next block by ascending address, `None` at the chain tail.
    pub next: Option<NonNull<Block>>,
}

impl Block {
    /// Address of the first content byte, right past the header.
    pub(crate) unsafe fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)) }
    }

    /// Recovers the header that owns `payload`.
    ///
    /// **SAFETY**: `payload` must have been produced by [`Block::payload`] on
    /// a block that is still part of the chain.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Block> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(BLOCK_HEADER_SIZE)).cast() }
    }
}
