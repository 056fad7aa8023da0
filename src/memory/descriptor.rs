use std::ffi::c_void;

use bytemuck::{Pod, Zeroable};
use derive_more::Deref;

use super::{AlignedBuf, align_up};
use crate::abi::{MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT, REQUIRED_MEMORY_ALIGNMENT};

/// A storage buffer as seen by compiled programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable)]
#[repr(C, align(16))]
pub struct BufferDescriptor {
    pub ptr: *mut u8,
    pub size_in_bytes: i32,
    pub robustness_size: i32,
}

/// A sampled or storage image as seen by compiled programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable)]
#[repr(C, align(16))]
pub struct ImageDescriptor {
    pub ptr: *mut u8,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub row_pitch_bytes: i32,
    pub slice_pitch_bytes: i32,
    pub sample_pitch_bytes: i32,
    pub sample_count: i32,
    pub size_in_bytes: i32,

    pub stencil_ptr: *mut u8,
    pub stencil_row_pitch_bytes: i32,
    pub stencil_slice_pitch_bytes: i32,
    pub stencil_sample_pitch_bytes: i32,
    _pad0: u32,

    pub memory_owner: *mut c_void,
    _pad1: u64,
}

// SAFETY: descriptors are plain addresses; what may be done through them is governed by the
// `unsafe` accessors and by the programs that receive them.
unsafe impl Send for BufferDescriptor {}
unsafe impl Sync for BufferDescriptor {}
unsafe impl Send for ImageDescriptor {}
unsafe impl Sync for ImageDescriptor {}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self::zeroed()
    }
}

unsafe fn raw_bytes<'a>(ptr: *mut u8, len: i32) -> &'a mut [u8] {
    match (ptr.is_null(), usize::try_from(len)) {
        (false, Ok(len)) => unsafe { std::slice::from_raw_parts_mut(ptr, len) },
        _ => &mut [],
    }
}

impl BufferDescriptor {
    /// The bytes this descriptor points to.
    ///
    /// # Safety
    /// The backing allocation must be alive, and no one may write to it for the lifetime of the
    /// returned slice.
    #[inline]
    pub unsafe fn data<'a>(&self) -> &'a [u8] {
        unsafe { raw_bytes(self.ptr, self.size_in_bytes) }
    }

    /// The bytes this descriptor points to, mutably.
    ///
    /// # Safety
    /// The backing allocation must be alive, and the returned slice must be the only live access
    /// to those bytes.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn data_mut<'a>(&self) -> &'a mut [u8] {
        unsafe { raw_bytes(self.ptr, self.size_in_bytes) }
    }

    /// # Safety
    /// See [`BufferDescriptor::data`].
    #[inline]
    pub unsafe fn read_slice<'a, T: Pod>(&self) -> &'a [T] {
        bytemuck::cast_slice(unsafe { self.data() })
    }

    /// # Safety
    /// See [`BufferDescriptor::data_mut`].
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn write_slice<'a, T: Pod>(&self) -> &'a mut [T] {
        bytemuck::cast_slice_mut(unsafe { self.data_mut() })
    }
}

impl ImageDescriptor {
    /// # Safety
    /// See [`BufferDescriptor::data`].
    #[inline]
    pub unsafe fn data<'a>(&self) -> &'a [u8] {
        unsafe { raw_bytes(self.ptr, self.size_in_bytes) }
    }

    /// # Safety
    /// See [`BufferDescriptor::data_mut`].
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn data_mut<'a>(&self) -> &'a mut [u8] {
        unsafe { raw_bytes(self.ptr, self.size_in_bytes) }
    }
}

/// A `#[repr(C)]` struct of descriptors that a program reads as one descriptor set.
///
/// Usually implemented with `#[derive(DescriptorSet)]`.
///
/// # Safety
/// The type must be `#[repr(C)]`, contain no padding, and consist only of descriptors, so that
/// [`DescriptorSet::as_bytes`] covers initialized memory and compiled programs find each binding
/// where they expect it.
pub unsafe trait DescriptorSet: Sized {
    /// Number of bindings in the set.
    const BINDINGS: usize;

    /// The raw bytes to hand to [`DispatchContext::prepare`](crate::runtime::DispatchContext::prepare).
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the implementor: no padding, only initialized fields.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

unsafe impl DescriptorSet for BufferDescriptor {
    const BINDINGS: usize = 1;
}

unsafe impl DescriptorSet for ImageDescriptor {
    const BINDINGS: usize = 1;
}

fn abi_size(size: usize) -> i32 {
    match i32::try_from(size) {
        Ok(size) => size,
        Err(_) => panic!("allocation of {size} bytes exceeds the descriptor size limit"),
    }
}

/// A host-allocated storage buffer, aligned to [`MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT`].
#[derive(Debug, Deref)]
pub struct Buffer {
    #[deref]
    desc: BufferDescriptor,
    storage: AlignedBuf,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        let size_in_bytes = abi_size(size);
        let mut storage = AlignedBuf::new(size, MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT);
        let desc = BufferDescriptor {
            ptr: storage.as_mut_ptr(),
            size_in_bytes,
            robustness_size: size_in_bytes,
        };
        Self { desc, storage }
    }

    /// A copy of the descriptor, for binding into a descriptor set.
    #[inline]
    pub fn descriptor(&self) -> BufferDescriptor {
        self.desc
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.storage.as_slice()
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    #[inline]
    pub fn read_slice<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.data())
    }

    /// Copies `contents` to the start of the buffer.
    pub fn write_slice<T: Pod>(&mut self, contents: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(contents);
        self.data_mut()[..bytes.len()].copy_from_slice(bytes);
    }

    /// Releases the memory and resets the descriptor. Freeing twice is a no-op.
    pub fn free(&mut self) {
        self.storage.free();
        self.desc = BufferDescriptor::zeroed();
    }
}

/// A host-allocated single-sample 2D image, aligned to [`REQUIRED_MEMORY_ALIGNMENT`].
#[derive(Debug, Deref)]
pub struct Image {
    #[deref]
    desc: ImageDescriptor,
    storage: AlignedBuf,
}

impl Image {
    /// Allocates an RGBA image with 4 bytes per pixel.
    ///
    /// The size is padded to a multiple of [`REQUIRED_MEMORY_ALIGNMENT`].
    pub fn new_rgba(width: u32, height: u32) -> Self {
        let row_pitch = (width as usize).checked_mul(4);
        let size = match row_pitch.and_then(|pitch| pitch.checked_mul(height as usize)) {
            Some(size) if size <= i32::MAX as usize => size,
            _ => panic!("image of {width}x{height} pixels exceeds the descriptor size limit"),
        };
        let size = align_up(size, REQUIRED_MEMORY_ALIGNMENT);
        let size_in_bytes = abi_size(size);

        let mut storage = AlignedBuf::new(size, REQUIRED_MEMORY_ALIGNMENT);
        let desc = ImageDescriptor {
            ptr: storage.as_mut_ptr(),
            width: abi_size(width as usize),
            height: abi_size(height as usize),
            depth: 1,
            row_pitch_bytes: abi_size(width as usize * 4),
            slice_pitch_bytes: size_in_bytes,
            sample_pitch_bytes: size_in_bytes,
            sample_count: 1,
            size_in_bytes,
            ..Zeroable::zeroed()
        };
        Self { desc, storage }
    }

    #[inline]
    pub fn descriptor(&self) -> ImageDescriptor {
        self.desc
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.storage.as_slice()
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    /// The bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let pitch = self.desc.row_pitch_bytes as usize;
        &self.data()[y as usize * pitch..][..pitch]
    }

    /// Releases the memory and resets the descriptor. Freeing twice is a no-op.
    pub fn free(&mut self) {
        self.storage.free();
        self.desc = ImageDescriptor::zeroed();
    }
}

#[inline]
pub fn allocate_buffer(size: usize) -> Buffer {
    Buffer::new(size)
}

#[inline]
pub fn allocate_image_rgba(width: u32, height: u32) -> Image {
    Image::new_rgba(width, height)
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::{
        Buffer, BufferDescriptor, DescriptorSet, Image, ImageDescriptor, allocate_buffer,
        allocate_image_rgba,
    };
    use crate::abi::MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT;

    #[derive(spindle_derive::DescriptorSet)]
    #[descriptor_set(crate = "crate")]
    #[repr(C)]
    struct Bindings {
        input: BufferDescriptor,
        output: BufferDescriptor,
        target: ImageDescriptor,
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_layout() {
        assert_eq!(size_of::<BufferDescriptor>(), 16);
        assert_eq!(align_of::<BufferDescriptor>(), 16);

        assert_eq!(offset_of!(ImageDescriptor, size_in_bytes), 36);
        assert_eq!(offset_of!(ImageDescriptor, stencil_ptr), 40);
        assert_eq!(offset_of!(ImageDescriptor, stencil_sample_pitch_bytes), 56);
        assert_eq!(offset_of!(ImageDescriptor, memory_owner), 64);
        assert_eq!(size_of::<ImageDescriptor>(), 80);
        assert_eq!(align_of::<ImageDescriptor>(), 16);
    }

    #[test]
    fn test_buffer() {
        let mut buffer = allocate_buffer(1000);
        assert_eq!(buffer.ptr as usize % MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT, 0);
        assert_eq!(buffer.size_in_bytes, 1000);
        assert_eq!(buffer.robustness_size, 1000);
        assert_eq!(buffer.descriptor(), *buffer);

        buffer.write_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(&buffer.read_slice::<f32>()[..4], &[1.0, 2.0, 3.0, 0.0]);

        let desc = buffer.descriptor();
        let view: &[f32] = unsafe { desc.read_slice() };
        assert_eq!(view.len(), 250);
        assert_eq!(view[1], 2.0);

        buffer.free();
        assert_eq!(*buffer, BufferDescriptor::default());
        assert!(buffer.data().is_empty());

        // freeing a zeroed descriptor is a no-op
        buffer.free();
        assert_eq!(*buffer, BufferDescriptor::default());
    }

    #[test]
    fn test_image_padding() {
        let image = allocate_image_rgba(3, 1);
        assert_eq!(image.row_pitch_bytes, 12);
        assert_eq!(image.size_in_bytes, 16);
        assert_eq!(image.slice_pitch_bytes, 16);
        assert_eq!(image.sample_pitch_bytes, 16);
        assert_eq!(image.depth, 1);
        assert_eq!(image.sample_count, 1);
        assert_eq!(image.data().len(), 16);
        assert_eq!(image.ptr as usize % 16, 0);
        assert_eq!(image.row(0).len(), 12);
        assert!(image.stencil_ptr.is_null());

        let image = Image::new_rgba(4, 4);
        assert_eq!(image.size_in_bytes, 64);
        assert_eq!(image.row_pitch_bytes, 16);
    }

    #[test]
    #[should_panic(expected = "exceeds the descriptor size limit")]
    fn test_image_too_large() {
        Image::new_rgba(u32::MAX, u32::MAX);
    }

    #[test]
    #[should_panic(expected = "exceeds the descriptor size limit")]
    fn test_image_over_limit() {
        // 16 GiB: representable, but larger than a descriptor can describe
        Image::new_rgba(1 << 16, 1 << 16);
    }

    #[test]
    fn test_image_free() {
        let mut image = Image::new_rgba(5, 7);
        image.data_mut().fill(0xff);
        assert_eq!(image.row(6), &[0xff; 20]);

        image.free();
        assert_eq!(*image, ImageDescriptor::default());
        image.free();
        assert!(image.data().is_empty());
    }

    #[test]
    fn test_descriptor_set() {
        let a = Buffer::new(16);
        let b = Buffer::new(32);
        let c = Image::new_rgba(2, 2);

        let mut set = Bindings {
            input: a.descriptor(),
            output: Default::default(),
            target: c.descriptor(),
        };
        *set.binding1() = b.descriptor();

        assert_eq!(Bindings::BINDINGS, 3);
        assert_eq!(set.as_bytes().len(), 16 + 16 + size_of::<ImageDescriptor>());
        assert_eq!(set.binding0().size_in_bytes, 16);
        assert_eq!(set.output.ptr, b.ptr);
        assert_eq!(set.binding2().width, 2);

        let bytes = set.as_bytes();
        let ptr = usize::from_ne_bytes(bytes[16..16 + size_of::<usize>()].try_into().unwrap());
        assert_eq!(ptr, b.ptr as usize);
    }
}
