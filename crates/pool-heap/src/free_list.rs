//! Intrusive singly-linked list of free blocks.
//!
//! A free block stores the address of the next free block of the same pool
//! in its first word; the last free block stores null. The list costs no
//! memory beyond the blocks themselves.
//!
//! ```text
//! head ──▶ ┌──────┬────────┐   ┌──────┬────────┐   ┌──────┬────────┐
//!          │ next │ unused │──▶│ next │ unused │──▶│ null │ unused │
//!          └──────┴────────┘   └──────┴────────┘   └──────┴────────┘
//! ```
//!
//! Links are read and written unaligned, so a class may use any block size
//! that can hold a link (not only multiples of the word alignment).

use core::ptr::NonNull;

/// Head of the free list of one pool.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
}

/// Reads the link stored in a free block.
///
/// # Safety
///
/// `block` must be valid for reading a link.
pub(crate) unsafe fn read_link(block: NonNull<u8>) -> Option<NonNull<u8>> {
    unsafe { block.cast::<Option<NonNull<u8>>>().read_unaligned() }
}

unsafe fn write_link(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    unsafe { block.cast::<Option<NonNull<u8>>>().write_unaligned(next) }
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    /// Threads a list through `count` consecutive blocks of `block_size`
    /// bytes starting at `start`, in ascending address order.
    ///
    /// The list is built from the last block backwards, so stack usage does
    /// not depend on `count`. Only the first word of each block is written.
    ///
    /// # Safety
    ///
    /// - `start..start + block_size * count` must be valid for writes.
    /// - `block_size` must be at least the size of a link.
    pub(crate) unsafe fn build(start: NonNull<u8>, block_size: usize, count: usize) -> Self {
        let mut head = None;
        for index in (0..count).rev() {
            unsafe {
                let block = start.add(index * block_size);
                write_link(block, head);
                head = Some(block);
            }
        }
        Self { head }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<NonNull<u8>> {
        self.head
    }

    /// Unlinks and returns the first free block.
    ///
    /// # Safety
    ///
    /// Every block on the list must still hold a valid link.
    pub(crate) unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        self.head = unsafe { read_link(block) };
        Some(block)
    }

    /// Unlinks and returns the first free block accepted by `accept`.
    ///
    /// Walks the list from the head, so it takes time proportional to the
    /// number of blocks skipped.
    ///
    /// # Safety
    ///
    /// Every block on the list must still hold a valid link.
    pub(crate) unsafe fn take_first<F>(&mut self, mut accept: F) -> Option<NonNull<u8>>
    where
        F: FnMut(NonNull<u8>) -> bool,
    {
        let mut prev: Option<NonNull<u8>> = None;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let next = unsafe { read_link(block) };
            if accept(block) {
                match prev {
                    Some(prev) => unsafe { write_link(prev, next) },
                    None => self.head = next,
                }
                return Some(block);
            }
            prev = Some(block);
            cursor = next;
        }
        None
    }

    /// Makes `block` the new head of the list.
    ///
    /// # Safety
    ///
    /// - `block` must be valid for writing a link.
    /// - `block` must not already be on any free list.
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        unsafe { write_link(block, self.head) };
        self.head = Some(block);
    }
}
