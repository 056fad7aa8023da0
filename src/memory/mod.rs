//! Host memory with the alignment compiled programs expect.
//!
//! Allocation failure aborts the process through [`std::alloc::handle_alloc_error`].

use std::{alloc::Layout, ptr::NonNull};

pub mod descriptor;

pub use descriptor::{
    Buffer, BufferDescriptor, DescriptorSet, Image, ImageDescriptor, allocate_buffer,
    allocate_image_rgba,
};

/// Rounds `size` up to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// An owned, zero-initialized block of bytes with a fixed alignment.
///
/// The block only ever grows: [`AlignedBuf::reserve`] replaces it with a larger one and leaves it
/// alone otherwise.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

// SAFETY: the buffer exclusively owns its allocation, which is plain bytes.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// An empty buffer. Does not allocate.
    #[inline]
    pub const fn empty(align: usize) -> Self {
        assert!(align.is_power_of_two());
        // an aligned, non-null address that is never dereferenced while `len == 0`
        let ptr = unsafe { NonNull::new_unchecked(std::ptr::without_provenance_mut(align)) };
        Self { ptr, len: 0, align }
    }

    /// Allocates `len` zeroed bytes aligned to `align`.
    pub fn new(len: usize, align: usize) -> Self {
        if len == 0 {
            return Self::empty(align);
        }
        let layout = Self::layout(len, align);
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, len, align },
            None => std::alloc::handle_alloc_error(layout),
        }
    }

    fn layout(len: usize, align: usize) -> Layout {
        match Layout::from_size_align(len, align) {
            Ok(layout) => layout,
            Err(err) => panic!("invalid allocation of {len} bytes aligned to {align}: {err}"),
        }
    }

    /// Makes sure the buffer holds at least `len` bytes.
    ///
    /// Growing discards the previous contents. Returns `true` if the buffer was reallocated.
    pub fn reserve(&mut self, len: usize) -> bool {
        if len <= self.len {
            return false;
        }
        *self = Self::new(len, self.align);
        true
    }

    /// Releases the allocation, leaving an empty buffer of the same alignment.
    #[inline]
    pub fn free(&mut self) {
        *self = Self::empty(self.align);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes, or dangling with `len == 0`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Default for AlignedBuf {
    fn default() -> Self {
        Self::empty(crate::abi::REQUIRED_MEMORY_ALIGNMENT)
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let layout = Self::layout(self.len, self.align);
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}
