use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{
    error::{self, ConfigError, ReleaseError},
    heap::PoolHeap,
    layout::PoolLayout,
    stats::HeapStats,
};

/// A [`PoolHeap`] behind a spin lock, usable from a `static`.
///
/// Every method takes the lock for the duration of one heap operation and
/// logs only after releasing it. Use [`lock`](Self::lock) to perform several
/// operations atomically; messages from operations on the guard are logged
/// while it is held.
///
/// ```no_run
/// use pool_heap::config::{LockedReferenceHeap, REFERENCE_LAYOUT};
///
/// #[global_allocator]
/// static HEAP: LockedReferenceHeap = LockedReferenceHeap::new(REFERENCE_LAYOUT);
///
/// # fn heap_start() -> core::ptr::NonNull<u8> { unimplemented!() }
/// fn boot() {
///     unsafe { HEAP.init_or_halt(heap_start()) };
/// }
/// # fn main() {}
/// ```
#[derive(Debug)]
pub struct LockedHeap<const N: usize, const B: usize> {
    heap: Mutex<PoolHeap<N, B>>,
}

impl<const N: usize, const B: usize> LockedHeap<N, B> {
    #[must_use]
    pub const fn new(layout: PoolLayout<N>) -> Self {
        Self {
            heap: Mutex::new(PoolHeap::new(layout)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PoolHeap<N, B>> {
        self.heap.lock()
    }

    /// See [`PoolHeap::init`].
    ///
    /// # Safety
    ///
    /// Same contract as [`PoolHeap::init`].
    pub unsafe fn init(&self, base: NonNull<u8>) -> Result<(), ConfigError> {
        let placed = unsafe { self.lock().place(base) };
        placed.finish()
    }

    /// Initializes the heap at boot, halting with a report on a bad layout.
    ///
    /// # Panics
    ///
    /// Panics if the layout is rejected.
    ///
    /// # Safety
    ///
    /// Same contract as [`PoolHeap::init`].
    #[track_caller]
    pub unsafe fn init_or_halt(&self, base: NonNull<u8>) {
        if let Err(err) = unsafe { self.init(base) } {
            error::report(err);
        }
    }

    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let taken = self.lock().take(size, 1);
        taken.finish().ok()
    }

    /// See [`PoolHeap::allocate_aligned`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let taken = self.lock().take(size, align);
        taken.finish().ok()
    }

    /// See [`PoolHeap::release`].
    ///
    /// # Safety
    ///
    /// Same contract as [`PoolHeap::release`].
    pub unsafe fn release(&self, ptr: *mut u8) -> Result<(), ReleaseError> {
        let released = unsafe { self.lock().give_back(ptr) };
        released.finish()
    }

    pub fn is_free(&self, ptr: *const u8) -> bool {
        self.lock().is_free(ptr)
    }

    pub fn stats(&self) -> HeapStats {
        self.lock().stats()
    }
}

unsafe impl<const N: usize, const B: usize> GlobalAlloc for LockedHeap<N, B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = unsafe { self.release(ptr) } {
            error!("dealloc failed: {err}");
        }
    }
}
