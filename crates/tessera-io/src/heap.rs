//! Process-wide heap indirection.
//!
//! Every buffer this crate hands to the kernel is allocated through the
//! active [`Heap`]. The log store embedding this crate may install its own
//! heap (for accounting or fault injection) with [`install`] and put the
//! built-in one back with [`install_default`].
//!
//! # Lifecycle
//!
//! The active heap is process-global. Install it once during single-threaded
//! startup, before any allocation can be in flight, and restore it during
//! teardown. The slot is lock-protected so a racing swap cannot corrupt it,
//! but memory obtained from one heap must still be returned to that same heap:
//! a raw pointer allocated before a swap and freed after it is a caller bug.
//! [`AlignedBuffer`](crate::AlignedBuffer) avoids this by retaining the heap
//! it was allocated from (see [`current`]).

use std::ffi::c_void;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

/// A complete set of allocation routines.
///
/// All six methods are required, so a heap is always fully populated; callers
/// replace the whole heap, never individual routines. Any state the routines
/// need lives in the implementing value.
pub trait Heap: Send + Sync {
    /// Allocates `size` bytes. Returns null on failure.
    fn malloc(&self, size: usize) -> *mut u8;

    /// Releases memory returned by [`Heap::malloc`], [`Heap::calloc`] or
    /// [`Heap::realloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and come from this heap's unaligned routines.
    unsafe fn free(&self, ptr: *mut u8);

    /// Allocates `nmemb * size` zeroed bytes. Returns null on failure or overflow.
    fn calloc(&self, nmemb: usize, size: usize) -> *mut u8;

    /// Resizes an allocation, preserving its prefix. Returns null on failure,
    /// in which case `ptr` is still valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from this heap's unaligned routines.
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// Allocates at least `size` bytes at an address that is a multiple of
    /// `alignment` (a power of two). Returns null on failure.
    fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8;

    /// Releases memory returned by [`Heap::aligned_alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and come from this heap's `aligned_alloc` with
    /// the same `alignment`.
    unsafe fn aligned_free(&self, alignment: usize, ptr: *mut u8);
}

/// The built-in heap, backed by the C allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

impl Heap for SystemHeap {
    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: malloc has no preconditions.
        unsafe { libc::malloc(size).cast() }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: caller guarantees ptr came from malloc/calloc/realloc.
        unsafe { libc::free(ptr.cast()) }
    }

    fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        if nmemb.checked_mul(size).is_none() {
            return std::ptr::null_mut();
        }
        // SAFETY: calloc has no preconditions.
        unsafe { libc::calloc(nmemb, size).cast() }
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: caller guarantees ptr is null or came from this heap.
        unsafe { libc::realloc(ptr.cast(), size).cast() }
    }

    fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        // posix_memalign wants a multiple of sizeof(void *).
        let alignment = alignment.max(size_of::<*mut c_void>());
        // Some platforms require the size to be a multiple of the alignment.
        let Some(size) = size.max(1).checked_next_multiple_of(alignment) else {
            return std::ptr::null_mut();
        };

        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: alignment is a power of two multiple of sizeof(void *).
        let rv = unsafe { libc::posix_memalign(&raw mut ptr, alignment, size) };
        if rv != 0 {
            return std::ptr::null_mut();
        }
        ptr.cast()
    }

    unsafe fn aligned_free(&self, _alignment: usize, ptr: *mut u8) {
        // SAFETY: posix_memalign memory is released with free().
        unsafe { libc::free(ptr.cast()) }
    }
}

static ACTIVE: LazyLock<RwLock<Arc<dyn Heap>>> =
    LazyLock::new(|| RwLock::new(Arc::new(SystemHeap)));

/// Makes `heap` the process-wide heap.
pub fn install(heap: Arc<dyn Heap>) {
    *ACTIVE.write().unwrap_or_else(PoisonError::into_inner) = heap;
}

/// Restores the built-in [`SystemHeap`].
pub fn install_default() {
    install(Arc::new(SystemHeap));
}

/// Returns a handle to the active heap.
///
/// Holders keep using this heap even if another one is installed later,
/// which is how long-lived allocations stay paired with their free routine.
pub fn current() -> Arc<dyn Heap> {
    Arc::clone(&ACTIVE.read().unwrap_or_else(PoisonError::into_inner))
}

fn with_active<T>(f: impl FnOnce(&dyn Heap) -> T) -> T {
    let guard = ACTIVE.read().unwrap_or_else(PoisonError::into_inner);
    f(guard.as_ref())
}

/// Allocates `size` bytes from the active heap.
pub fn malloc(size: usize) -> *mut u8 {
    with_active(|heap| heap.malloc(size))
}

/// Returns memory to the active heap. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or come from [`malloc`], [`calloc`] or [`realloc`]
/// while the same heap was active.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: forwarded caller guarantee.
    with_active(|heap| unsafe { heap.free(ptr) });
}

/// Allocates `nmemb * size` zeroed bytes from the active heap.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    with_active(|heap| heap.calloc(nmemb, size))
}

/// Resizes an allocation from the active heap.
///
/// # Safety
///
/// `ptr` must be null or come from the active heap's unaligned routines.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    // SAFETY: forwarded caller guarantee.
    with_active(|heap| unsafe { heap.realloc(ptr, size) })
}

/// Allocates `size` bytes aligned to `alignment` from the active heap.
pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    with_active(|heap| heap.aligned_alloc(alignment, size))
}

/// Returns aligned memory to the active heap. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or come from [`aligned_alloc`] with the same
/// `alignment` while the same heap was active.
pub unsafe fn aligned_free(alignment: usize, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: forwarded caller guarantee.
    with_active(|heap| unsafe { heap.aligned_free(alignment, ptr) });
}
