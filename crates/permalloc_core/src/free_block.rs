//! Link header threaded through free small blocks.
//!
//! A free block starts with two words:
//!
//! ```text
//! +0  tag   FREE_TAG ^ offset   marks the block as free
//! +8  next  offset of the next free block, or NIL
//! ```
//!
//! Allocated blocks carry client data in those bytes. The tag lets
//! deallocation detect most double frees; a client that happens to store
//! the exact tag value at the start of a live block defeats the check.
//!
//! This is the only module that reinterprets heap memory.

use std::ptr::NonNull;

/// Marker for "no next block".
pub(crate) const NIL: u64 = u64::MAX;

/// Bytes a free block needs for its header.
pub(crate) const HEADER_LEN: u64 = 16;

const FREE_TAG: u64 = 0x7065_726d_6672_6565;

/// A view of the header of the block at `offset`.
#[derive(Debug)]
pub(crate) struct FreeBlock {
    words: NonNull<u64>,
    offset: u64,
}

impl FreeBlock {
    /// Creates a view of the block header at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be 8-byte aligned and point to at least [`HEADER_LEN`]
    /// mapped bytes for as long as the view is used, writable if the view
    /// is written. The caller
    /// must hold the lock of the bin that owns the block.
    pub(crate) unsafe fn at(addr: NonNull<u8>, offset: u64) -> Self {
        debug_assert_eq!(addr.as_ptr() as usize % 8, 0);
        Self {
            words: addr.cast::<u64>(),
            offset,
        }
    }

    fn tag(&self) -> u64 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { self.words.as_ptr().read_volatile() }
    }

    /// Returns true if the header carries this block's free tag.
    pub(crate) fn is_free(&self) -> bool {
        self.tag() == FREE_TAG ^ self.offset
    }

    /// Returns the next link.
    pub(crate) fn next(&self) -> u64 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { self.words.as_ptr().add(1).read_volatile() }
    }

    /// Writes the free tag and the next link.
    pub(crate) fn mark_free(&self, next: u64) {
        // SAFETY: guaranteed by the constructor contract.
        unsafe {
            self.words.as_ptr().add(1).write_volatile(next);
            self.words.as_ptr().write_volatile(FREE_TAG ^ self.offset);
        }
    }

    /// Clears the header before the block is handed out.
    pub(crate) fn mark_allocated(&self) {
        // SAFETY: guaranteed by the constructor contract.
        unsafe {
            self.words.as_ptr().write_volatile(0);
            self.words.as_ptr().add(1).write_volatile(0);
        }
    }
}
