//! A segregated fixed-size-class pool heap for `no_std` firmware.
//!
//! The heap is one contiguous region split into pools, one per size class,
//! each holding blocks of a single size. Allocation picks the smallest class
//! that fits (escalating to larger classes when a pool is exhausted), release
//! returns the block to its own pool, and a free bitmap records the state of
//! every block so double frees are caught and queries are O(log N).
//!
//! Nothing is ever coalesced or split, so fragmentation and worst-case
//! latency are fixed when the layout is chosen.
//!
//! # Examples
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use pool_heap::{PoolHeap, PoolLayout, SizeClass};
//!
//! const LAYOUT: PoolLayout<2> =
//!     PoolLayout::new([SizeClass::new(16, 2), SizeClass::new(32, 2)], 96);
//!
//! let mut region = vec![0_u64; 12];
//! let base = NonNull::new(region.as_mut_ptr().cast::<u8>()).unwrap();
//!
//! let mut heap = PoolHeap::<2, { LAYOUT.bitmap_len() }>::new(LAYOUT);
//! unsafe { heap.init(base) }.unwrap();
//!
//! let block = heap.allocate(10).unwrap();
//! assert!(!heap.is_free(block.as_ptr()));
//!
//! unsafe { heap.release(block.as_ptr()) }.unwrap();
//! assert!(heap.is_free(block.as_ptr()));
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
pub mod log;

pub mod classify;
pub mod config;
pub mod error;
pub mod layout;
pub mod stats;

mod free_list;
mod heap;
mod locked;

pub use self::{
    classify::BlockLocation,
    error::{AllocError, ClassifyError, ConfigError, ReleaseError},
    heap::{BlockState, PoolHeap},
    layout::{PoolLayout, SizeClass},
    locked::LockedHeap,
    stats::{HeapStats, PoolUsage},
};
