//! `spindle` runs compute shaders that were compiled ahead of time to native code on the host CPU.
//!
//! ## Key Components
//! 1. **Binary Interface** ([`abi`]):
//!    - `#[repr(C)]` mirrors of the structures generated code reads, most importantly [`ProgramData`].
//!    - Raw coroutine entry points (`begin`, `await`, `destroy`) of compiled programs.
//!
//! 2. **Memory** ([`memory`]):
//!    - Aligned host allocations for storage buffers, RGBA images and descriptor sets.
//!    - `#[derive(DescriptorSet)]` for laying out descriptor sets as plain Rust structs.
//!
//! 3. **Programs** ([`program`]):
//!    - [`CompiledProgram`] and [`Coroutine`], the two seams between runtime and program.
//!    - Native programs behind the C coroutine ABI, and Rust kernels written as `async` blocks.
//!
//! 4. **Runtime** ([`runtime`]):
//!    - [`DispatchContext`] prepares a dispatch; [`ThreadContext`] holds per-thread scratch state.
//!    - Workgroups are split round-robin across threads, and every workgroup's coroutines are
//!      interleaved at control barriers on a single thread.
//!
//! ## Example
//! ```
//! use std::sync::Arc;
//!
//! use spindle::{DispatchContext, KernelProgram, ProgramInfo, ThreadContext, barrier};
//!
//! let info = ProgramInfo::new([8, 1, 1]).with_cbarriers(true).with_memory_size(16);
//! let program = KernelProgram::new(info, |invocation| async move {
//!     let subgroup = invocation.subgroups.first as usize;
//!     unsafe { invocation.memory.write(subgroup * 4, subgroup as u32 + 1) };
//!     barrier().await;
//!     let sum: u32 = (0..2).map(|s| unsafe { invocation.memory.read::<u32>(s * 4) }).sum();
//!     assert_eq!(sum, 3);
//! });
//!
//! let mut ctx = DispatchContext::new();
//! ctx.prepare(2, Arc::new(program), &[], [4, 1, 1])?;
//!
//! let mut threads = vec![ThreadContext::new(), ThreadContext::new()];
//! let stats = ctx.dispatch_all(&mut threads)?;
//! assert_eq!(stats.workgroups, 4);
//! assert_eq!(stats.coroutines, 8);
//! # Ok::<(), spindle::DispatchError>(())
//! ```

pub mod abi;
pub mod memory;
pub mod program;
pub mod runtime;

pub use abi::ProgramData;
pub use memory::{
    Buffer, BufferDescriptor, DescriptorSet, Image, ImageDescriptor, allocate_buffer,
    allocate_image_rgba,
};
pub use program::{
    CompiledProgram, Coroutine, Invocation, KernelProgram, NativeProgram, ProgramInfo,
    RawProgramInfo, Subgroups, WorkgroupMemory, barrier,
};
pub use runtime::{DispatchContext, DispatchError, DispatchStats, ThreadContext};
pub use spindle_derive::DescriptorSet;
