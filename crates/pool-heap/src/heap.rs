//! The pool heap: one context owning the pools, their free lists and the
//! free bitmap.
//!
//! # Algorithm
//!
//! - **Allocation**: pick the smallest class whose blocks hold the request;
//!   if its pool is exhausted, escalate to the next larger class (never to a
//!   smaller one). Pop the head of that pool's free list, mark the block
//!   allocated in the bitmap and zero it.
//! - **Release**: resolve the pointer to its pool and global block index,
//!   refuse it if the bitmap says the block is already free, otherwise push
//!   it onto its pool's free list and mark it free.
//! - **Query**: resolve the pointer and read its bitmap bit.
//!
//! Every operation is bounded by the number of pools, except the zero-fill
//! on allocation which is proportional to the chosen block size. Aligned
//! allocation from a pool whose blocks are not all suitably aligned also
//! walks that pool's free list.
//!
//! # Invariant
//!
//! Bit `k` of the bitmap is set if and only if block `k` is reachable from
//! its pool's free-list head. Each operation restores this before it
//! returns; [`PoolHeap::check_consistency`] verifies it.
//!
//! # Thread Safety
//!
//! `PoolHeap` is `Send` but not `Sync`, and none of its operations are
//! reentrant. Use [`LockedHeap`](crate::LockedHeap) or another critical
//! section when it is reachable from more than one execution context.

use core::{ops::Range, ptr::NonNull};

use free_bitmap::FreeBitmap;
use snafu::{ResultExt as _, ensure};

use crate::{
    classify::{BlockLocation, PoolMap},
    error::{
        AllocError, BitmapTooSmallSnafu, ClassifyError, ConfigError, DoubleFreeSnafu,
        InvalidAlignmentSnafu, InvalidArgumentSnafu, InvalidPointerSnafu, OutOfMemorySnafu,
        RegionOverflowSnafu, ReleaseError,
    },
    free_list::{self, FreeList},
    layout::PoolLayout,
    stats::{HeapStats, PoolUsage},
};

/// State of a block as recorded by the free bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// Something worth a log line, recorded while the heap is borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapEvent {
    Placed {
        base: usize,
        pools: usize,
        blocks: usize,
        bytes: usize,
    },
    Escalated {
        size: usize,
        from: usize,
        to: usize,
    },
    Exhausted {
        size: usize,
    },
    NullRelease,
    ForeignRelease {
        addr: usize,
    },
    MisalignedRelease {
        addr: usize,
        pool: usize,
    },
    DoubleFree {
        addr: usize,
    },
}

impl HeapEvent {
    fn emit(self) {
        match self {
            Self::Placed {
                base,
                pools,
                blocks,
                bytes,
            } => {
                info!("pool heap at {base:#x}: {pools} pools, {blocks} blocks, {bytes} bytes");
            }
            Self::Escalated { size, from, to } => {
                trace!("{size}-byte request escalated from pool {from} to pool {to}");
            }
            Self::Exhausted { size } => {
                debug!("no free block for a {size}-byte request");
            }
            Self::NullRelease => {
                warn!("ignored release of a null pointer");
            }
            Self::ForeignRelease { addr } => {
                warn!("ignored release of {addr:#x} outside the heap");
            }
            Self::MisalignedRelease { addr, pool } => {
                warn!("rejected release of {addr:#x}: not a block start in pool {pool}");
            }
            Self::DoubleFree { addr } => {
                warn!("rejected double free of {addr:#x}");
            }
        }
    }
}

/// The outcome of a heap operation and the event it wants logged.
///
/// The event is only logged by [`finish`](Self::finish), which lets
/// [`LockedHeap`](crate::LockedHeap) release its lock first so the log sink
/// may use the heap itself.
#[must_use]
#[derive(Debug)]
pub(crate) struct Logged<T> {
    value: T,
    event: Option<HeapEvent>,
}

impl<T> Logged<T> {
    fn quiet(value: T) -> Self {
        Self { value, event: None }
    }

    fn with(value: T, event: HeapEvent) -> Self {
        Self {
            value,
            event: Some(event),
        }
    }

    #[cfg(test)]
    pub(crate) fn event(&self) -> Option<HeapEvent> {
        self.event
    }

    pub(crate) fn finish(self) -> T {
        if let Some(event) = self.event {
            event.emit();
        }
        self.value
    }
}

/// A heap of `N` size classes whose free bitmap has `B` bytes of storage.
///
/// `B` must be at least [`PoolLayout::bitmap_len`]; initialization fails
/// otherwise.
#[derive(Debug)]
pub struct PoolHeap<const N: usize, const B: usize> {
    layout: PoolLayout<N>,
    base: Option<NonNull<u8>>,
    map: PoolMap<N>,
    free_lists: [FreeList; N],
    free_map: FreeBitmap<B>,
    stats: HeapStats,
}

unsafe impl<const N: usize, const B: usize> Send for PoolHeap<N, B> {}

impl<const N: usize, const B: usize> PoolHeap<N, B> {
    /// Creates a heap that owns no memory yet.
    ///
    /// Until [`init`](Self::init) succeeds every allocation fails and every
    /// pointer is out of range.
    #[must_use]
    pub const fn new(layout: PoolLayout<N>) -> Self {
        Self {
            layout,
            base: None,
            map: PoolMap::unplaced(),
            free_lists: [const { FreeList::new() }; N],
            free_map: FreeBitmap::new(),
            stats: HeapStats::new(),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &PoolLayout<N> {
        &self.layout
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    /// Address range of the heap, if initialized.
    #[must_use]
    pub fn heap_range(&self) -> Option<Range<usize>> {
        self.is_initialized().then(|| self.map.heap_range())
    }

    /// Address range of pool `pool`, if initialized.
    #[must_use]
    pub fn pool_range(&self, pool: usize) -> Option<Range<usize>> {
        if !self.is_initialized() {
            return None;
        }
        self.map.pool_range(pool)
    }

    /// Places the heap at `base` and marks every block free.
    ///
    /// The layout is validated first; on error nothing is modified. Calling
    /// `init` again discards every outstanding allocation.
    ///
    /// Only the first word of each block is written.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + layout.total_size()` is valid for reads and writes
    /// - the region is used by nothing but this heap for as long as the heap
    ///   hands out blocks from it
    pub unsafe fn init(&mut self, base: NonNull<u8>) -> Result<(), ConfigError> {
        unsafe { self.place(base) }.finish()
    }

    pub(crate) unsafe fn place(&mut self, base: NonNull<u8>) -> Logged<Result<(), ConfigError>> {
        if let Err(err) = self.check_placement(base) {
            return Logged::quiet(Err(err));
        }
        unsafe { self.format(base) };
        Logged::with(
            Ok(()),
            HeapEvent::Placed {
                base: base.addr().get(),
                pools: N,
                blocks: self.layout.total_blocks(),
                bytes: self.layout.total_size(),
            },
        )
    }

    fn check_placement(&self, base: NonNull<u8>) -> Result<(), ConfigError> {
        self.layout.validate()?;

        let blocks = self.layout.total_blocks();
        let capacity = FreeBitmap::<B>::CAPACITY;
        ensure!(blocks <= capacity, BitmapTooSmallSnafu { capacity, blocks });
        ensure!(
            base.addr().get().checked_add(self.layout.total_size()).is_some(),
            RegionOverflowSnafu
        );
        Ok(())
    }

    /// Returns every block to its pool, as if freshly initialized.
    ///
    /// Does nothing if the heap was never initialized.
    ///
    /// # Safety
    ///
    /// No block handed out before the reset may be used afterwards.
    pub unsafe fn reset(&mut self) {
        if let Some(base) = self.base {
            unsafe { self.format(base) };
        }
    }

    unsafe fn format(&mut self, base: NonNull<u8>) {
        let mut start = base;
        for (list, class) in self.free_lists.iter_mut().zip(self.layout.classes()) {
            unsafe {
                *list = FreeList::build(start, class.block_size(), class.block_count());
                start = start.add(class.block_size() * class.block_count());
            }
        }
        self.map = PoolMap::new(base.addr().get(), &self.layout);
        self.free_map.fill_free(self.layout.total_blocks());
        self.stats = HeapStats::new();
        self.base = Some(base);
    }

    /// Allocates a zeroed block of at least `size` bytes.
    ///
    /// Returns `None` if `size` is zero, larger than the largest class, or if
    /// no class large enough has a free block.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok()
    }

    /// Like [`allocate`](Self::allocate), but reports why no block was
    /// returned.
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.take(size, 1).finish()
    }

    /// Allocates a zeroed block of at least `size` bytes whose address is a
    /// multiple of `align`.
    ///
    /// Classes are tried from the smallest fitting one upwards. In a pool
    /// whose blocks are all aligned the head block is taken; otherwise the
    /// pool's free list is searched for an aligned block.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.try_allocate_aligned(size, align).ok()
    }

    /// Like [`allocate_aligned`](Self::allocate_aligned), but reports why no
    /// block was returned.
    pub fn try_allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.take(size, align).finish()
    }

    pub(crate) fn take(
        &mut self,
        size: usize,
        align: usize,
    ) -> Logged<Result<NonNull<u8>, AllocError>> {
        match self.take_block(size, align) {
            Ok((block, event)) => {
                HeapStats::bump(&mut self.stats.allocations);
                match event {
                    Some(event) => Logged::with(Ok(block), event),
                    None => Logged::quiet(Ok(block)),
                }
            }
            Err(err) => {
                HeapStats::bump(&mut self.stats.failed_allocations);
                match err {
                    AllocError::OutOfMemory { size, .. } => {
                        Logged::with(Err(err), HeapEvent::Exhausted { size })
                    }
                    _ => Logged::quiet(Err(err)),
                }
            }
        }
    }

    fn take_block(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<(NonNull<u8>, Option<HeapEvent>), AllocError> {
        ensure!(align.is_power_of_two(), InvalidAlignmentSnafu { align });
        let max = self.layout.max_block_size();
        ensure!(size > 0 && size <= max, InvalidArgumentSnafu { size, max });
        let Some(ideal) = self.layout.class_for(size) else {
            return InvalidArgumentSnafu { size, max }.fail();
        };

        let Some((pool, block)) = (ideal..N)
            .find_map(|pool| unsafe { self.take_aligned(pool, align) }.map(|block| (pool, block)))
        else {
            return OutOfMemorySnafu { size }.fail();
        };
        let event = (pool != ideal).then(|| {
            HeapStats::bump(&mut self.stats.escalations);
            HeapEvent::Escalated {
                size,
                from: ideal,
                to: pool,
            }
        });

        let global_index = self.map.global_index(pool, block.addr().get());
        let was_free = self.free_map.mark_allocated(global_index);
        debug_assert!(was_free, "block {block:p} on a free list is marked allocated");

        let block_size = self.layout.classes()[pool].block_size();
        unsafe { block.write_bytes(0, block_size) };
        Ok((block, event))
    }

    unsafe fn take_aligned(&mut self, pool: usize, align: usize) -> Option<NonNull<u8>> {
        let start = self.map.pool_range(pool)?.start;
        let block_size = self.layout.classes()[pool].block_size();
        let list = &mut self.free_lists[pool];
        if start.is_multiple_of(align) && block_size.is_multiple_of(align) {
            unsafe { list.pop() }
        } else {
            unsafe { list.take_first(|block| block.addr().get().is_multiple_of(align)) }
        }
    }

    /// Returns the block at `ptr` to its pool.
    ///
    /// A null pointer or a pointer outside the heap is ignored and `Ok(())`
    /// is returned; such calls are counted in [`stats`](Self::stats). A
    /// pointer inside the heap that is not the start of a block, or a block
    /// that is already free, is rejected without modifying the heap.
    ///
    /// # Safety
    ///
    /// If `ptr` is the start of an allocated block, the caller must ensure
    /// that the block is not used after this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
        unsafe { self.give_back(ptr) }.finish()
    }

    pub(crate) unsafe fn give_back(&mut self, ptr: *mut u8) -> Logged<Result<(), ReleaseError>> {
        let Some(block) = NonNull::new(ptr) else {
            HeapStats::bump(&mut self.stats.null_releases);
            return Logged::with(Ok(()), HeapEvent::NullRelease);
        };
        let addr = block.addr().get();

        let location = match self.map.classify(addr) {
            Ok(location) => location,
            Err(ClassifyError::OutOfRange { .. }) => {
                HeapStats::bump(&mut self.stats.out_of_range_releases);
                return Logged::with(Ok(()), HeapEvent::ForeignRelease { addr });
            }
            Err(err @ ClassifyError::Misaligned { pool, .. }) => {
                HeapStats::bump(&mut self.stats.misaligned_releases);
                return Logged::with(
                    Err(err).context(InvalidPointerSnafu { addr }),
                    HeapEvent::MisalignedRelease { addr, pool },
                );
            }
        };

        if self.free_map.is_free(location.global_index) == Some(true) {
            HeapStats::bump(&mut self.stats.double_frees);
            return Logged::with(
                DoubleFreeSnafu { addr }.fail(),
                HeapEvent::DoubleFree { addr },
            );
        }

        unsafe { self.free_lists[location.pool].push(block) };
        self.free_map.mark_free(location.global_index);
        HeapStats::bump(&mut self.stats.releases);
        Logged::quiet(Ok(()))
    }

    /// Resolves `ptr` to the block starting there.
    pub fn classify(&self, ptr: *const u8) -> Result<BlockLocation, ClassifyError> {
        self.map.classify(ptr.addr())
    }

    /// Reports whether the block at `ptr` is free or allocated.
    ///
    /// Unlike [`is_free`](Self::is_free), pointers that are not block starts
    /// of this heap are reported as errors.
    pub fn block_state(&self, ptr: *const u8) -> Result<BlockState, ClassifyError> {
        let location = self.classify(ptr)?;
        if self.free_map.is_free(location.global_index) == Some(true) {
            Ok(BlockState::Free)
        } else {
            Ok(BlockState::Allocated)
        }
    }

    /// Returns `true` if `ptr` is the start of a free block.
    ///
    /// Pointers outside the heap and pointers into the middle of a block
    /// report `false`, the same as allocated blocks. Use
    /// [`block_state`](Self::block_state) to tell them apart.
    #[must_use]
    pub fn is_free(&self, ptr: *const u8) -> bool {
        matches!(self.block_state(ptr), Ok(BlockState::Free))
    }

    /// Event counters since the last initialization.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Occupancy of pool `pool`, or `None` if there is no such pool.
    ///
    /// Every block counts as allocated before initialization.
    #[must_use]
    pub fn pool_usage(&self, pool: usize) -> Option<PoolUsage> {
        let class = self.layout.classes().get(pool)?;
        let free = if self.is_initialized() {
            self.free_map.count_free(self.map.index_range(pool))
        } else {
            0
        };
        Some(PoolUsage {
            block_size: class.block_size(),
            block_count: class.block_count(),
            free,
        })
    }

    /// Verifies that the free lists and the free bitmap agree.
    ///
    /// Walks every free list and checks that each block on it belongs to the
    /// list's pool, is marked free and appears only once, and that every
    /// block marked free was reached. Takes time proportional to the number
    /// of free blocks.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        let mut reached = FreeBitmap::<B>::new();
        reached.fill_allocated(self.free_map.len());

        for (pool, list) in self.free_lists.iter().enumerate() {
            let mut next = list.head();
            while let Some(block) = next {
                let Ok(location) = self.map.classify(block.addr().get()) else {
                    return false;
                };
                let marked_free = self.free_map.is_free(location.global_index) == Some(true);
                if location.pool != pool || !marked_free {
                    return false;
                }
                // a block seen twice means the list is cyclic
                if reached.mark_free(location.global_index) {
                    return false;
                }
                next = unsafe { free_list::read_link(block) };
            }
        }

        self.free_map
            .free_indices()
            .all(|index| reached.is_free(index) == Some(true))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::{alloc::Layout, ptr};

    use super::*;
    use crate::{
        config::{REFERENCE_BITMAP_LEN, REFERENCE_LAYOUT, REFERENCE_POOLS},
        layout::{LINK_SIZE, SizeClass},
    };

    const TWO_POOLS: PoolLayout<2> =
        PoolLayout::new([SizeClass::new(16, 2), SizeClass::new(32, 2)], 96);

    type TwoPoolHeap = PoolHeap<2, 1>;
    type ReferenceHeap = PoolHeap<REFERENCE_POOLS, REFERENCE_BITMAP_LEN>;

    const FILL: u8 = 0xa5;

    fn with_test_region<F>(size: usize, test_fn: F)
    where
        F: FnOnce(NonNull<u8>),
    {
        unsafe {
            let layout = Layout::from_size_align(size.max(1), 16).unwrap();
            let start = NonNull::new(std::alloc::alloc(layout)).unwrap();
            start.write_bytes(FILL, layout.size());
            test_fn(start);
            std::alloc::dealloc(start.as_ptr(), layout);
        }
    }

    fn with_test_heap<const N: usize, const B: usize, F>(layout: PoolLayout<N>, test_fn: F)
    where
        F: FnOnce(&mut PoolHeap<N, B>, NonNull<u8>),
    {
        with_test_region(layout.total_size(), |base| unsafe {
            let mut heap = PoolHeap::<N, B>::new(layout);
            heap.init(base).unwrap();
            test_fn(&mut heap, base);
        });
    }

    fn with_two_pool_heap<F>(test_fn: F)
    where
        F: FnOnce(&mut TwoPoolHeap, NonNull<u8>),
    {
        with_test_heap::<2, 1, F>(TWO_POOLS, test_fn);
    }

    fn with_reference_heap<F>(test_fn: F)
    where
        F: FnOnce(&mut ReferenceHeap, NonNull<u8>),
    {
        with_test_heap::<REFERENCE_POOLS, REFERENCE_BITMAP_LEN, F>(REFERENCE_LAYOUT, test_fn);
    }

    fn block_starts<const N: usize, const B: usize>(
        heap: &PoolHeap<N, B>,
        pool: usize,
    ) -> Vec<usize> {
        let range = heap.pool_range(pool).unwrap();
        let block_size = heap.layout().classes()[pool].block_size();
        range.step_by(block_size).collect()
    }

    fn addr_ptr(base: NonNull<u8>, addr: usize) -> *mut u8 {
        base.as_ptr().with_addr(addr)
    }

    #[test]
    fn test_init_rejects_size_mismatch() {
        let layout = PoolLayout::new([SizeClass::new(16, 2), SizeClass::new(32, 2)], 100);
        with_test_region(100, |base| unsafe {
            let mut heap = TwoPoolHeap::new(layout);
            let err = heap.init(base).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::SizeMismatch {
                    computed: 96,
                    declared: 100,
                    ..
                }
            ));
            assert!(!heap.is_initialized());
            assert_eq!(heap.allocate(16), None);
            // nothing was written
            for offset in 0..100 {
                assert_eq!(base.add(offset).read(), FILL);
            }
        });
    }

    #[test]
    fn test_init_rejects_small_bitmap() {
        with_test_region(96, |base| unsafe {
            let mut heap = PoolHeap::<2, 0>::new(TWO_POOLS);
            assert!(matches!(
                heap.init(base),
                Err(ConfigError::BitmapTooSmall {
                    capacity: 0,
                    blocks: 4,
                    ..
                })
            ));
        });
    }

    #[test]
    fn test_init_marks_every_block_free() {
        with_reference_heap(|heap, base| {
            let mut blocks = 0;
            for pool in 0..REFERENCE_POOLS {
                for addr in block_starts(heap, pool) {
                    assert!(heap.is_free(addr_ptr(base, addr)));
                    blocks += 1;
                }
                let usage = heap.pool_usage(pool).unwrap();
                assert_eq!(usage.free, usage.block_count);
            }
            assert_eq!(blocks, REFERENCE_LAYOUT.total_blocks());

            let end = base.addr().get() + REFERENCE_LAYOUT.total_size();
            assert!(!heap.is_free(addr_ptr(base, base.addr().get() - 1)));
            assert!(!heap.is_free(addr_ptr(base, end)));
            assert!(!heap.is_free(addr_ptr(base, end + 8)));
            assert!(!heap.is_free(ptr::null()));
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_init_writes_only_link_words() {
        with_two_pool_heap(|heap, base| unsafe {
            for pool in 0..2 {
                let block_size = heap.layout().classes()[pool].block_size();
                for addr in block_starts(heap, pool) {
                    for offset in LINK_SIZE..block_size {
                        assert_eq!(addr_ptr(base, addr + offset).read(), FILL);
                    }
                }
            }
        });
    }

    #[test]
    fn test_two_pool_escalation() {
        with_two_pool_heap(|heap, base| {
            let small = heap.pool_range(0).unwrap();
            let large = heap.pool_range(1).unwrap();
            assert_eq!(small, base.addr().get()..base.addr().get() + 32);

            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(16).unwrap();
            assert_ne!(a, b);
            assert!(small.contains(&a.addr().get()));
            assert!(small.contains(&b.addr().get()));

            let c = heap.allocate(16).unwrap();
            assert!(large.contains(&c.addr().get()));
            let d = heap.allocate(16).unwrap();
            assert!(large.contains(&d.addr().get()));
            assert_ne!(c, d);

            assert_eq!(heap.allocate(16), None);
            assert!(matches!(
                heap.try_allocate(16),
                Err(AllocError::OutOfMemory { size: 16, .. })
            ));

            let stats = heap.stats();
            assert_eq!(stats.allocations, 4);
            assert_eq!(stats.escalations, 2);
            assert_eq!(stats.failed_allocations, 2);
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_no_downward_escalation() {
        with_two_pool_heap(|heap, _base| {
            assert!(heap.allocate(32).is_some());
            assert!(heap.allocate(17).is_some());
            assert_eq!(heap.allocate(32), None);
            assert_eq!(heap.allocate(17), None);
            assert_eq!(heap.pool_usage(0).unwrap().free, 2);
        });
    }

    #[test]
    fn test_best_fit_by_class() {
        with_reference_heap(|heap, _base| {
            for (size, pool) in [(1, 0), (16, 0), (17, 1), (33, 2), (200, 4), (513, 6), (1028, 6)] {
                let block = heap.allocate(size).unwrap();
                let location = heap.classify(block.as_ptr()).unwrap();
                assert_eq!(location.pool, pool, "request of {size} bytes");
                assert!(!heap.is_free(block.as_ptr()));
            }
            assert_eq!(heap.stats().escalations, 0);
        });
    }

    #[test]
    fn test_invalid_sizes() {
        with_two_pool_heap(|heap, _base| {
            assert_eq!(heap.allocate(0), None);
            assert_eq!(heap.allocate(33), None);
            assert!(matches!(
                heap.try_allocate(0),
                Err(AllocError::InvalidArgument { size: 0, max: 32, .. })
            ));
            assert!(matches!(
                heap.try_allocate(usize::MAX),
                Err(AllocError::InvalidArgument { .. })
            ));
            assert_eq!(heap.stats().failed_allocations, 4);
            assert_eq!(heap.pool_usage(0).unwrap().free, 2);
            assert_eq!(heap.pool_usage(1).unwrap().free, 2);
        });
    }

    #[test]
    fn test_allocation_zeroes_exactly_one_block() {
        with_two_pool_heap(|heap, base| unsafe {
            let a = heap.allocate(16).unwrap();
            assert_eq!(a, base);
            for offset in 0..16 {
                assert_eq!(a.add(offset).read(), 0);
            }
            // the neighbouring free block keeps its contents past the link
            for offset in 16 + LINK_SIZE..32 {
                assert_eq!(base.add(offset).read(), FILL);
            }

            a.write_bytes(0x77, 16);
            heap.release(a.as_ptr()).unwrap();
            let b = heap.allocate(8).unwrap();
            assert_eq!(a, b);
            for offset in 0..16 {
                assert_eq!(b.add(offset).read(), 0);
            }
        });
    }

    #[test]
    fn test_release_then_query() {
        with_reference_heap(|heap, _base| unsafe {
            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(32).unwrap();
            let c = heap.allocate(64).unwrap();
            assert!(!heap.is_free(a.as_ptr()));
            assert!(!heap.is_free(b.as_ptr()));
            assert!(!heap.is_free(c.as_ptr()));

            heap.release(b.as_ptr()).unwrap();
            assert!(heap.is_free(b.as_ptr()));
            assert!(!heap.is_free(a.as_ptr()));
            assert!(!heap.is_free(c.as_ptr()));

            heap.release(a.as_ptr()).unwrap();
            heap.release(c.as_ptr()).unwrap();
            assert!(heap.is_free(a.as_ptr()));
            assert!(heap.is_free(c.as_ptr()));
            assert_eq!(heap.stats().releases, 3);
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_lifo_reuse() {
        with_reference_heap(|heap, _base| unsafe {
            let _keep = heap.allocate(100).unwrap();
            let p = heap.allocate(100).unwrap();
            heap.release(p.as_ptr()).unwrap();
            assert_eq!(heap.allocate(65), Some(p));
        });
    }

    #[test]
    fn test_release_null_and_out_of_range() {
        with_two_pool_heap(|heap, base| unsafe {
            let a = heap.allocate(16).unwrap();
            let before = (0..2).map(|pool| heap.pool_usage(pool)).collect::<Vec<_>>();

            heap.release(ptr::null_mut()).unwrap();
            heap.release(addr_ptr(base, base.addr().get() + 96)).unwrap();
            heap.release(addr_ptr(base, base.addr().get() + 96 + 16)).unwrap();
            heap.release(addr_ptr(base, base.addr().get() - 16)).unwrap();

            let after = (0..2).map(|pool| heap.pool_usage(pool)).collect::<Vec<_>>();
            assert_eq!(before, after);
            assert!(!heap.is_free(a.as_ptr()));
            assert!(heap.check_consistency());

            let stats = heap.stats();
            assert_eq!(stats.null_releases, 1);
            assert_eq!(stats.out_of_range_releases, 3);
            assert_eq!(stats.releases, 0);
            assert_eq!(stats.bad_releases(), 4);
        });
    }

    #[test]
    fn test_release_misaligned() {
        with_two_pool_heap(|heap, _base| unsafe {
            let a = heap.allocate(32).unwrap();
            let err = heap.release(a.as_ptr().add(8)).unwrap_err();
            assert!(matches!(
                err,
                ReleaseError::InvalidPointer {
                    source: ClassifyError::Misaligned { pool: 1, .. },
                    ..
                }
            ));
            assert!(!heap.is_free(a.as_ptr()));
            assert!(!heap.is_free(a.as_ptr().add(8)));
            assert!(matches!(
                heap.block_state(a.as_ptr().add(8)),
                Err(ClassifyError::Misaligned { .. })
            ));
            assert_eq!(heap.stats().misaligned_releases, 1);
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_double_free_detected() {
        with_two_pool_heap(|heap, _base| unsafe {
            let a = heap.allocate(32).unwrap();
            heap.release(a.as_ptr()).unwrap();
            assert!(heap.is_free(a.as_ptr()));

            let err = heap.release(a.as_ptr()).unwrap_err();
            assert!(matches!(err, ReleaseError::DoubleFree { addr, .. } if addr == a.addr().get()));
            assert!(heap.is_free(a.as_ptr()));
            assert_eq!(heap.stats().double_frees, 1);
            assert!(heap.check_consistency());

            // the pool still hands out each block once
            let b = heap.allocate(32).unwrap();
            let c = heap.allocate(32).unwrap();
            assert_eq!(b, a);
            assert_ne!(b, c);
            assert_eq!(heap.allocate(32), None);
        });
    }

    #[test]
    fn test_double_free_of_never_allocated_block() {
        with_two_pool_heap(|heap, base| unsafe {
            assert!(matches!(
                heap.release(base.as_ptr()),
                Err(ReleaseError::DoubleFree { .. })
            ));
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_exhaust_then_release() {
        with_two_pool_heap(|heap, _base| unsafe {
            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(16).unwrap();
            heap.release(a.as_ptr()).unwrap();
            assert_eq!(heap.allocate(16), Some(a));
            heap.release(b.as_ptr()).unwrap();
            assert_eq!(heap.allocate(16), Some(b));
            assert_eq!(heap.stats().escalations, 0);
        });
    }

    #[test]
    fn test_every_reference_pool() {
        for pool in 0..REFERENCE_POOLS {
            with_reference_heap(|heap, _base| unsafe {
                let class = REFERENCE_LAYOUT.classes()[pool];
                let range = heap.pool_range(pool).unwrap();

                let mut blocks = Vec::new();
                for _ in 0..class.block_count() {
                    let block = heap.allocate(class.block_size()).unwrap();
                    assert!(range.contains(&block.addr().get()));
                    assert!(!heap.is_free(block.as_ptr()));
                    blocks.push(block);
                }
                assert_eq!(heap.pool_usage(pool).unwrap().free, 0);
                assert_eq!(heap.stats().escalations, 0);

                heap.release(blocks[0].as_ptr()).unwrap();
                assert!(heap.is_free(blocks[0].as_ptr()));
                assert_eq!(heap.allocate(class.block_size()), Some(blocks[0]));

                for block in &blocks {
                    heap.release(block.as_ptr()).unwrap();
                }
                assert_eq!(heap.pool_usage(pool).unwrap().free, class.block_count());
                assert!(heap.check_consistency());
            });
        }
    }

    #[test]
    fn test_exhaust_whole_heap() {
        with_reference_heap(|heap, _base| unsafe {
            let mut blocks = Vec::new();
            while let Some(block) = heap.allocate(16) {
                blocks.push(block);
            }
            assert_eq!(blocks.len(), REFERENCE_LAYOUT.total_blocks());
            for pool in 0..REFERENCE_POOLS {
                assert_eq!(heap.pool_usage(pool).unwrap().free, 0);
            }
            assert!(heap.check_consistency());

            for block in blocks {
                heap.release(block.as_ptr()).unwrap();
            }
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_block_state() {
        with_two_pool_heap(|heap, base| {
            let a = heap.allocate(16).unwrap();
            assert_eq!(heap.block_state(a.as_ptr()).unwrap(), BlockState::Allocated);
            assert_eq!(
                heap.block_state(base.as_ptr().wrapping_add(16)).unwrap(),
                BlockState::Free
            );
            assert!(matches!(
                heap.block_state(ptr::null()),
                Err(ClassifyError::OutOfRange { .. })
            ));
        });
    }

    #[test]
    fn test_global_index_spans_pools() {
        with_two_pool_heap(|heap, base| {
            let indices = [0, 16, 32, 64]
                .map(|offset| heap.classify(base.as_ptr().wrapping_add(offset)).unwrap());
            assert_eq!(indices.map(|l| l.global_index), [0, 1, 2, 3]);
            assert_eq!(indices.map(|l| l.pool), [0, 0, 1, 1]);
            assert_eq!(indices.map(|l| l.index_in_pool), [0, 1, 0, 1]);
        });
    }

    #[test]
    fn test_stress_pattern() {
        with_reference_heap(|heap, _base| unsafe {
            let mut live = Vec::new();
            for i in 0..600_usize {
                let size = 16 + (i % 4) * 8;
                let block = heap.allocate(size).unwrap();
                block.write_bytes(0xee, size);
                live.push(block);
                if i % 3 == 0 {
                    let victim = live.swap_remove(i % live.len());
                    heap.release(victim.as_ptr()).unwrap();
                }
            }
            assert!(heap.check_consistency());

            let allocated: usize = (0..REFERENCE_POOLS)
                .map(|pool| heap.pool_usage(pool).unwrap().allocated())
                .sum();
            assert_eq!(allocated, live.len());

            for block in live {
                heap.release(block.as_ptr()).unwrap();
            }
            assert!(heap.check_consistency());
            assert_eq!(heap.stats().bad_releases(), 0);
        });
    }

    #[test]
    fn test_reset() {
        with_two_pool_heap(|heap, base| unsafe {
            while heap.allocate(16).is_some() {}
            heap.release(ptr::null_mut()).unwrap();

            heap.reset();
            assert_eq!(heap.stats(), HeapStats::default());
            assert_eq!(heap.allocate(16), Some(base));
            assert!(heap.check_consistency());
        });
    }

    #[test]
    fn test_reinit_at_new_base() {
        with_test_region(96, |first| {
            with_test_region(96, |second| unsafe {
                let mut heap = TwoPoolHeap::new(TWO_POOLS);
                heap.init(first).unwrap();
                let a = heap.allocate(16).unwrap();
                assert_eq!(a, first);

                heap.init(second).unwrap();
                assert!(!heap.is_free(a.as_ptr()));
                assert_eq!(heap.heap_range(), Some(second.addr().get()..second.addr().get() + 96));
                assert_eq!(heap.allocate(16), Some(second));
            });
        });
    }

    #[test]
    fn test_independent_heaps() {
        with_two_pool_heap(|first, first_base| {
            with_two_pool_heap(|second, second_base| {
                assert_eq!(first.allocate(16), Some(first_base));
                assert_eq!(second.allocate(16), Some(second_base));
                assert!(!first.is_free(first_base.as_ptr()));
                assert!(second.is_free(second_base.as_ptr().wrapping_add(16)));
                assert!(!first.is_free(second_base.as_ptr().wrapping_add(16)));
            });
        });
    }

    #[test]
    fn test_uninitialized_heap() {
        let mut heap = TwoPoolHeap::new(TWO_POOLS);
        assert!(!heap.is_initialized());
        assert_eq!(heap.heap_range(), None);
        assert_eq!(heap.pool_range(0), None);
        assert!(matches!(
            heap.try_allocate(16),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert!(!heap.is_free(ptr::null()));
        assert_eq!(heap.pool_usage(1).unwrap().free, 0);
        assert_eq!(heap.pool_usage(2), None);
        unsafe {
            heap.release(ptr::dangling_mut()).unwrap();
        }
        assert_eq!(heap.stats().out_of_range_releases, 1);
        assert!(heap.check_consistency());
    }

    const ODD_POOLS: PoolLayout<2> =
        PoolLayout::new([SizeClass::new(16, 1), SizeClass::new(1028, 5)], 5156);

    #[test]
    fn test_aligned_allocation_skips_misaligned_blocks() {
        with_test_heap::<2, 1, _>(ODD_POOLS, |heap, base| {
            let at = |offset: usize| base.as_ptr().wrapping_add(offset);

            assert_eq!(heap.allocate_aligned(100, 16).unwrap().as_ptr(), at(16));
            // 1044, 2072 and 3100 are not 16-byte aligned
            assert_eq!(heap.allocate_aligned(100, 16).unwrap().as_ptr(), at(4128));
            assert!(matches!(
                heap.try_allocate_aligned(100, 16),
                Err(AllocError::OutOfMemory { size: 100, .. })
            ));

            assert_eq!(heap.allocate_aligned(100, 8).unwrap().as_ptr(), at(2072));
            assert_eq!(heap.allocate(100).unwrap().as_ptr(), at(1044));
            assert!(heap.is_free(at(3100)));
            assert!(heap.check_consistency());

            let stats = heap.stats();
            assert_eq!(stats.allocations, 4);
            assert_eq!(stats.failed_allocations, 1);
            assert_eq!(stats.releases, 0);
        });
    }

    #[test]
    fn test_aligned_allocation_pops_uniform_pool() {
        with_two_pool_heap(|heap, base| {
            assert_eq!(heap.allocate_aligned(10, 16), Some(base));
            let next = heap.allocate_aligned(10, 1).unwrap();
            assert_eq!(next.as_ptr(), base.as_ptr().wrapping_add(16));
            assert_eq!(heap.stats().escalations, 0);
        });
    }

    #[test]
    fn test_aligned_allocation_rejects_bad_alignment() {
        with_two_pool_heap(|heap, _base| {
            for align in [0, 3, 24] {
                assert!(matches!(
                    heap.try_allocate_aligned(16, align),
                    Err(AllocError::InvalidAlignment { .. })
                ));
            }
            assert_eq!(heap.pool_usage(0).unwrap().free, 2);
        });
    }

    #[test]
    fn test_events_wait_for_finish() {
        with_two_pool_heap(|heap, base| unsafe {
            let addr = base.addr().get();
            assert_eq!(
                heap.place(base).event(),
                Some(HeapEvent::Placed {
                    base: addr,
                    pools: 2,
                    blocks: 4,
                    bytes: 96,
                })
            );

            assert_eq!(heap.take(16, 1).event(), None);
            assert_eq!(heap.take(16, 1).event(), None);
            assert_eq!(
                heap.take(16, 1).event(),
                Some(HeapEvent::Escalated {
                    size: 16,
                    from: 0,
                    to: 1,
                })
            );
            assert!(matches!(
                heap.take(16, 1).event(),
                Some(HeapEvent::Escalated { to: 1, .. })
            ));
            assert_eq!(heap.take(16, 1).event(), Some(HeapEvent::Exhausted { size: 16 }));
            assert_eq!(heap.take(0, 1).event(), None);

            assert_eq!(heap.give_back(ptr::null_mut()).event(), Some(HeapEvent::NullRelease));
            assert_eq!(
                heap.give_back(addr_ptr(base, addr + 96)).event(),
                Some(HeapEvent::ForeignRelease { addr: addr + 96 })
            );
            assert_eq!(
                heap.give_back(addr_ptr(base, addr + 40)).event(),
                Some(HeapEvent::MisalignedRelease {
                    addr: addr + 40,
                    pool: 1,
                })
            );
            assert_eq!(heap.give_back(base.as_ptr()).event(), None);
            assert_eq!(
                heap.give_back(base.as_ptr()).event(),
                Some(HeapEvent::DoubleFree { addr })
            );
            assert!(heap.check_consistency());
        });
    }
}
