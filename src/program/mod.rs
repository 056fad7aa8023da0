//! Compiled compute programs and the coroutines they run as.
//!
//! A program is split by the compiler into coroutines: each one executes some subgroups of one
//! workgroup, and suspends itself wherever the shader contains a control barrier. The runtime only
//! ever sees two things of a program: [`CompiledProgram::begin`] to start a coroutine, and
//! [`Coroutine::poll`] to resume it. Dropping a coroutine destroys it.

use std::{ptr::NonNull, task::Poll};

use bytemuck::Pod;
use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{abi::ProgramData, memory::descriptor::DescriptorSet};

pub mod kernel;
pub mod native;

pub use kernel::{Invocation, KernelProgram, barrier};
pub use native::{NativeProgram, NativeRoutine, RawProgramInfo};

/// Constant parameters of a compiled program.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgramInfo {
    /// Minimum size of the workgroup memory passed to the program.
    pub min_memory_size: usize,
    /// Whether the program contains control barriers.
    pub has_cbarriers: bool,
    /// Size of the first descriptor set of the program.
    pub desc_set_size: usize,
    pub workgroup_size: [u32; 3],
}

impl ProgramInfo {
    pub fn new(workgroup_size: [u32; 3]) -> Self {
        Self {
            workgroup_size,
            ..Default::default()
        }
    }

    pub fn with_memory_size(mut self, min_memory_size: usize) -> Self {
        self.min_memory_size = min_memory_size;
        self
    }

    pub fn with_cbarriers(mut self, has_cbarriers: bool) -> Self {
        self.has_cbarriers = has_cbarriers;
        self
    }

    pub fn with_desc_set_size(mut self, desc_set_size: usize) -> Self {
        self.desc_set_size = desc_set_size;
        self
    }

    /// Sizes the first descriptor set after `T`.
    pub fn with_descriptor_set<T: DescriptorSet>(self) -> Self {
        self.with_desc_set_size(size_of::<T>())
    }

    #[inline]
    pub fn invocations_per_workgroup(&self) -> usize {
        self.workgroup_size.iter().map(|&x| x as usize).product()
    }
}

/// A range of subgroups within a workgroup that one coroutine executes.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{}..{}", first, first + count)]
pub struct Subgroups {
    pub first: u32,
    pub count: u32,
}

impl Subgroups {
    #[inline]
    pub fn new(first: u32, count: u32) -> Self {
        Self { first, count }
    }

    #[inline]
    pub fn range(&self) -> std::ops::Range<u32> {
        self.first..self.first + self.count
    }
}

/// A view of the workgroup memory shared by all coroutines of one workgroup.
///
/// The handle is only valid while the coroutine that received it is alive. All coroutines of a
/// workgroup run on the same thread, so accesses through it never race.
#[derive(Debug, Clone, Copy)]
pub struct WorkgroupMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the runtime never lets a handle be used on another thread than the one that owns the
// memory; the handle itself is just an address.
unsafe impl Send for WorkgroupMemory {}
unsafe impl Sync for WorkgroupMemory {}

impl WorkgroupMemory {
    #[inline]
    pub(crate) fn new(memory: &mut [u8]) -> Self {
        let len = memory.len();
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { ptr, len }
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
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Reads a `T` at byte `offset`.
    ///
    /// # Safety
    /// Must be called while the coroutine that received this handle is alive.
    ///
    /// # Panics
    /// Panics if the value does not fit inside the memory.
    #[inline]
    pub unsafe fn read<T: Pod>(&self, offset: usize) -> T {
        self.check::<T>(offset);
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }

    /// Writes a `T` at byte `offset`.
    ///
    /// # Safety
    /// Must be called while the coroutine that received this handle is alive.
    ///
    /// # Panics
    /// Panics if the value does not fit inside the memory.
    #[inline]
    pub unsafe fn write<T: Pod>(&self, offset: usize, value: T) {
        self.check::<T>(offset);
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>().write_unaligned(value) }
    }

    #[inline]
    fn check<T>(&self, offset: usize) {
        let end = offset.checked_add(size_of::<T>());
        assert!(
            end.is_some_and(|end| end <= self.len),
            "workgroup memory access at {offset} of {} bytes out of bounds ({})",
            size_of::<T>(),
            self.len
        );
    }
}

/// A suspended execution of some subgroups of one workgroup.
pub trait Coroutine: Send {
    /// Resumes execution until the next suspension point.
    ///
    /// Returns [`Poll::Pending`] while the coroutine still has work left and must be resumed again,
    /// and [`Poll::Ready`] once it has finished. A finished coroutine is never polled again.
    fn poll(&mut self) -> Poll<()>;
}

/// A compute program compiled for the host CPU.
pub trait CompiledProgram: Send + Sync {
    fn info(&self) -> &ProgramInfo;

    /// Starts a coroutine running `subgroups` of the workgroup at `workgroup`.
    ///
    /// `data` lives in the dispatch context and stays valid until the dispatch completes.
    /// `memory` is shared by every coroutine of the workgroup.
    fn begin(
        &self,
        data: &ProgramData,
        workgroup: [u32; 3],
        memory: WorkgroupMemory,
        subgroups: Subgroups,
    ) -> Box<dyn Coroutine>;
}

#[cfg(test)]
mod tests {
    use super::{ProgramInfo, Subgroups, WorkgroupMemory};
    use crate::memory::descriptor::BufferDescriptor;

    #[test]
    fn test_info_builder() {
        let info = ProgramInfo::new([4, 2, 3])
            .with_memory_size(64)
            .with_cbarriers(true)
            .with_descriptor_set::<BufferDescriptor>();
        assert_eq!(info.invocations_per_workgroup(), 24);
        assert_eq!(info.min_memory_size, 64);
        assert!(info.has_cbarriers);
        assert_eq!(info.desc_set_size, 16);
    }

    #[test]
    fn test_subgroups() {
        let subgroups = Subgroups::new(2, 3);
        assert_eq!(subgroups.range(), 2..5);
        assert_eq!(subgroups.to_string(), "2..5");
    }

    #[test]
    fn test_workgroup_memory() {
        let mut bytes = [0u8; 16];
        let memory = WorkgroupMemory::new(&mut bytes);
        assert_eq!(memory.len(), 16);

        unsafe {
            memory.write(1, 0xdeadbeefu32);
            assert_eq!(memory.read::<u32>(1), 0xdeadbeef);
            memory.write(12, 7u32);
        }
        assert_eq!(u32::from_ne_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]), 7);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn test_info_sidecar() {
        let json = r#"{
            "min_memory_size": 32,
            "has_cbarriers": true,
            "desc_set_size": 48,
            "workgroup_size": [16, 4, 1]
        }"#;
        let info: ProgramInfo = serde_json::from_str(json).unwrap();
        assert_eq!(
            info,
            ProgramInfo::new([16, 4, 1])
                .with_memory_size(32)
                .with_cbarriers(true)
                .with_desc_set_size(48)
        );
    }

    #[test]
    #[should_panic]
    fn test_workgroup_memory_bounds() {
        let mut bytes = [0u8; 16];
        let memory = WorkgroupMemory::new(&mut bytes);
        unsafe { memory.write(13, 0u32) };
    }
}
