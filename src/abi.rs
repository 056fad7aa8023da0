//! Binary interface shared with code emitted by the shader compiler.
//!
//! Every type here is `#[repr(C)]` and laid out exactly like its counterpart in the compiler's
//! C headers, so values can be handed across the boundary without conversion.

use std::ffi::c_void;

use bytemuck::Zeroable;

use crate::memory::descriptor::DescriptorSet;

pub const MAX_BOUND_DESCRIPTOR_SETS: usize = 4;
pub const MAX_DESCRIPTOR_SET_UNIFORM_BUFFERS_DYNAMIC: usize = 8;
pub const MAX_DESCRIPTOR_SET_STORAGE_BUFFERS_DYNAMIC: usize = 4;
pub const MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC: usize =
    MAX_DESCRIPTOR_SET_UNIFORM_BUFFERS_DYNAMIC + MAX_DESCRIPTOR_SET_STORAGE_BUFFERS_DYNAMIC;
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

/// Alignment of storage buffers handed to programs.
pub const MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT: usize = 256;
/// Alignment of images, descriptor sets and workgroup memory.
pub const REQUIRED_MEMORY_ALIGNMENT: usize = 16;

/// Number of invocations executed in lockstep by one subgroup.
pub const SIMD_WIDTH: u32 = 4;

/// Value written by `routine_await`. Opaque to the runtime.
pub type YieldResult = i32;

/// An opaque coroutine frame returned by `routine_begin`.
pub type RawCoroutine = *mut c_void;

pub type RoutineBegin = unsafe extern "C" fn(
    data: *mut ProgramData,
    workgroup_x: i32,
    workgroup_y: i32,
    workgroup_z: i32,
    workgroup_memory: *mut c_void,
    first_subgroup: i32,
    subgroup_count: i32,
) -> RawCoroutine;

/// Resumes a coroutine. Returns non-zero while the coroutine is still running.
pub type RoutineAwait = unsafe extern "C" fn(r: RawCoroutine, res: *mut YieldResult) -> u8;

pub type RoutineDestroy = unsafe extern "C" fn(r: RawCoroutine);

/// Four 32-bit lanes aligned to a vector register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Zeroable)]
#[repr(C, align(16))]
pub struct Uint4(pub [u32; 4]);

/// Per-dispatch constants every coroutine of a program reads.
#[derive(Debug, Clone, Copy, Zeroable)]
#[repr(C)]
pub struct ProgramData {
    pub descriptor_sets: [*mut u8; MAX_BOUND_DESCRIPTOR_SETS],
    pub descriptor_dynamic_offsets: [u32; MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC],
    pub num_workgroups: Uint4,
    pub workgroup_size: Uint4,
    pub invocations_per_subgroup: u32,
    pub subgroups_per_workgroup: u32,
    pub invocations_per_workgroup: u32,
    pub push_constants: [u8; MAX_PUSH_CONSTANT_SIZE],
    /// Unused by generated code.
    pub constants: *mut c_void,
}

// SAFETY: the descriptor set pointers refer to storage owned by a `DispatchContext`, which is only
// written while preparing and is read-only for as long as any dispatch may observe this value.
unsafe impl Send for ProgramData {}
unsafe impl Sync for ProgramData {}

impl Default for ProgramData {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ProgramData {
    #[inline]
    pub fn num_workgroups(&self) -> [u32; 3] {
        let [x, y, z, _] = self.num_workgroups.0;
        [x, y, z]
    }

    #[inline]
    pub fn workgroup_size(&self) -> [u32; 3] {
        let [x, y, z, _] = self.workgroup_size.0;
        [x, y, z]
    }

    /// Reinterprets the bound descriptor set at `index` as `T`.
    ///
    /// # Safety
    /// The set must have been prepared from the bytes of a `T`, and the dispatch context that owns
    /// the storage must outlive the returned reference.
    pub unsafe fn descriptor_set<T: DescriptorSet>(&self, index: usize) -> Option<&T> {
        let ptr = *self.descriptor_sets.get(index)?;
        if ptr.is_null() {
            return None;
        }
        debug_assert_eq!(ptr as usize % align_of::<T>(), 0);
        // SAFETY: guaranteed by the caller.
        Some(unsafe { &*ptr.cast::<T>() })
    }
}
