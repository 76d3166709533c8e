//! The flight computer's heap layout.
//!
//! Seven classes from 16 to 1028 bytes, 628 blocks in 63 988 bytes. The
//! linker script reserves exactly [`REFERENCE_LAYOUT`]`.total_size()` bytes
//! for the heap section.

use crate::{
    heap::PoolHeap,
    layout::{self, PoolLayout, SizeClass},
    locked::LockedHeap,
};

pub const REFERENCE_POOLS: usize = 7;

const REFERENCE_CLASSES: [SizeClass; REFERENCE_POOLS] = [
    SizeClass::new(16, 118),
    SizeClass::new(32, 100),
    SizeClass::new(64, 200),
    SizeClass::new(128, 100),
    SizeClass::new(256, 100),
    SizeClass::new(512, 5),
    SizeClass::new(1028, 5),
];

pub const REFERENCE_LAYOUT: PoolLayout<REFERENCE_POOLS> =
    PoolLayout::new(REFERENCE_CLASSES, 63_988);

/// Bitmap storage bytes for [`REFERENCE_LAYOUT`].
pub const REFERENCE_BITMAP_LEN: usize = layout::bitmap_len(&REFERENCE_CLASSES);

pub type ReferenceHeap = PoolHeap<REFERENCE_POOLS, REFERENCE_BITMAP_LEN>;
pub type LockedReferenceHeap = LockedHeap<REFERENCE_POOLS, REFERENCE_BITMAP_LEN>;
