//! Compile-time description of the heap's size classes.
//!
//! A [`PoolLayout`] lists the size classes in ascending block-size order
//! together with the total heap length the linker reserves for them. The
//! heap region is carved into one pool per class, back to back:
//!
//! ```text
//! base                                                       base + total_size
//! ┌───────────────────┬──────────────────────┬─────┬─────────────────────────┐
//! │ pool 0            │ pool 1               │ ... │ pool N-1                │
//! │ size[0] * count[0]│ size[1] * count[1]   │     │ size[N-1] * count[N-1]  │
//! └───────────────────┴──────────────────────┴─────┴─────────────────────────┘
//! ```

use snafu::ensure;

use crate::error::{
    BlockTooSmallSnafu, ConfigError, EmptyPoolSnafu, NoPoolsSnafu, RegionOverflowSnafu,
    SizeMismatchSnafu, UnorderedClassesSnafu,
};

/// Size of a free-list link. Every block must be able to hold one.
pub const LINK_SIZE: usize = size_of::<usize>();

/// One size class: `block_count` blocks of `block_size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    block_size: usize,
    block_count: usize,
}

impl SizeClass {
    #[must_use]
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    /// Bytes occupied by the pool of this class, or `None` on overflow.
    #[must_use]
    pub const fn bytes(&self) -> Option<usize> {
        self.block_size.checked_mul(self.block_count)
    }
}

/// Number of bitmap storage bytes needed to track every block of `classes`.
///
/// Intended for sizing the bitmap parameter of
/// [`PoolHeap`](crate::PoolHeap) in a constant:
///
/// ```
/// use pool_heap::{PoolHeap, PoolLayout, SizeClass, layout};
///
/// const CLASSES: [SizeClass; 2] = [SizeClass::new(16, 10), SizeClass::new(64, 3)];
/// const BITMAP_LEN: usize = layout::bitmap_len(&CLASSES);
/// static LAYOUT: PoolLayout<2> = PoolLayout::new(CLASSES, 352);
///
/// assert_eq!(BITMAP_LEN, 2);
/// let heap = PoolHeap::<2, BITMAP_LEN>::new(LAYOUT);
/// assert!(!heap.is_initialized());
/// ```
#[must_use]
pub const fn bitmap_len(classes: &[SizeClass]) -> usize {
    free_bitmap::bytes_for(total_blocks(classes))
}

const fn total_blocks(classes: &[SizeClass]) -> usize {
    let mut blocks = 0;
    let mut i = 0;
    while i < classes.len() {
        blocks += classes[i].block_count;
        i += 1;
    }
    blocks
}

/// The size classes of a heap and the heap length they must add up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout<const N: usize> {
    classes: [SizeClass; N],
    total_size: usize,
}

impl<const N: usize> PoolLayout<N> {
    /// Creates a layout. Nothing is checked until [`validate`](Self::validate)
    /// or heap initialization.
    #[must_use]
    pub const fn new(classes: [SizeClass; N], total_size: usize) -> Self {
        Self {
            classes,
            total_size,
        }
    }

    #[must_use]
    pub const fn classes(&self) -> &[SizeClass; N] {
        &self.classes
    }

    /// Declared heap length in bytes.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        total_blocks(&self.classes)
    }

    #[must_use]
    pub const fn bitmap_len(&self) -> usize {
        bitmap_len(&self.classes)
    }

    /// Block size of the largest class, or zero for an empty layout.
    #[must_use]
    pub const fn max_block_size(&self) -> usize {
        match self.classes.last() {
            Some(class) => class.block_size,
            None => 0,
        }
    }

    /// `Σ block_size * block_count`, or `None` on overflow.
    #[must_use]
    pub const fn computed_size(&self) -> Option<usize> {
        let mut total: usize = 0;
        let mut i = 0;
        while i < N {
            let Some(bytes) = self.classes[i].bytes() else {
                return None;
            };
            let Some(sum) = total.checked_add(bytes) else {
                return None;
            };
            total = sum;
            i += 1;
        }
        Some(total)
    }

    /// Index of the smallest class whose blocks can hold `size` bytes.
    ///
    /// Assumes the classes are sorted, which [`validate`](Self::validate)
    /// guarantees.
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<usize> {
        let index = self
            .classes
            .partition_point(|class| class.block_size < size);
        (index < N).then_some(index)
    }

    /// Checks that the layout describes a usable heap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(N > 0, NoPoolsSnafu);

        let mut previous: Option<usize> = None;
        for (pool, class) in self.classes.iter().enumerate() {
            ensure!(class.block_count > 0, EmptyPoolSnafu { pool });
            ensure!(
                class.block_size >= LINK_SIZE,
                BlockTooSmallSnafu {
                    pool,
                    block_size: class.block_size,
                    word: LINK_SIZE,
                }
            );
            if let Some(previous) = previous {
                ensure!(
                    class.block_size > previous,
                    UnorderedClassesSnafu {
                        pool,
                        block_size: class.block_size,
                        previous,
                    }
                );
            }
            previous = Some(class.block_size);
        }

        let Some(computed) = self.computed_size() else {
            return RegionOverflowSnafu.fail();
        };
        ensure!(
            computed == self.total_size,
            SizeMismatchSnafu {
                computed,
                declared: self.total_size,
            }
        );
        Ok(())
    }
}
