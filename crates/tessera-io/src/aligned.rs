//! Aligned buffers for Direct I/O.
//!
//! With `O_DIRECT` the buffer address, the transfer length and the file offset
//! must all be multiples of the filesystem's logical block size. The probe
//! discovers that size at runtime, so unlike a fixed page-aligned buffer the
//! alignment here is chosen per buffer.
//!
//! Memory comes from the active [`Heap`](crate::heap::Heap). The buffer keeps
//! a handle to that heap and its alignment, so it is always released through
//! the matching `aligned_free` even if another heap is installed meanwhile.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::heap::{self, Heap};
use crate::{IoError, IoResult};

/// Logical block size assumed when none has been probed (4 KiB).
pub const BLOCK_ALIGNMENT: usize = 4096;

/// A zero-initialized buffer with a runtime-chosen alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
    heap: Arc<dyn Heap>,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    ///
    /// `alignment` must be a power of two. `len` is kept as requested; callers
    /// doing direct I/O pass a multiple of `alignment`.
    pub fn zeroed(alignment: usize, len: usize) -> IoResult<Self> {
        debug_assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        let heap = heap::current();
        let ptr = NonNull::new(heap.aligned_alloc(alignment, len))
            .ok_or(IoError::OutOfMemory { size: len, alignment })?;

        // SAFETY: the allocation holds at least `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };

        Ok(Self {
            ptr,
            len,
            alignment,
            heap,
        })
    }

    /// Creates a buffer holding `data`, zero-padded to the next multiple of
    /// `alignment`.
    pub fn from_data(alignment: usize, data: &[u8]) -> IoResult<Self> {
        let mut buf = Self::zeroed(alignment, round_up(data.len(), alignment))?;
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(buf)
    }

    /// Returns the buffer contents as a slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid and initialized for len bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the buffer contents as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and initialized for len bytes; &mut self is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Raw pointer for handing to the kernel.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The alignment this buffer was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr came from this heap's aligned_alloc with this alignment.
        unsafe { self.heap.aligned_free(self.alignment, self.ptr.as_ptr()) };
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

/// Rounds `value` up to the nearest multiple of `alignment`.
pub(crate) fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0, "alignment must be positive");
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of two"
    );
    (value + alignment - 1) & !(alignment - 1)
}
