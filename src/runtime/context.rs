use std::sync::Arc;

use super::{DispatchError, queue::Coroutines};
use crate::{
    abi::{
        MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC, MAX_PUSH_CONSTANT_SIZE, ProgramData,
        REQUIRED_MEMORY_ALIGNMENT, SIMD_WIDTH, Uint4,
    },
    memory::{AlignedBuf, align_up},
    program::{CompiledProgram, Coroutine},
};

/// State shared by every thread taking part in a dispatch.
///
/// A context is prepared once per dispatch and may be reused for any number of dispatches after
/// that. Its descriptor storage only ever grows.
pub struct DispatchContext {
    pub(super) descriptor_set: AlignedBuf,
    pub(super) nthreads: usize,
    pub(super) has_cbarriers: bool,
    pub(super) memory_size: usize,
    pub(super) workgroups: usize,
    pub(super) program: Option<Arc<dyn CompiledProgram>>,
    pub(super) data: ProgramData,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("descriptor_capacity", &self.descriptor_set.len())
            .field("nthreads", &self.nthreads)
            .field("has_cbarriers", &self.has_cbarriers)
            .field("memory_size", &self.memory_size)
            .field("workgroups", &self.workgroups)
            .field("prepared", &self.program.is_some())
            .finish()
    }
}

impl DispatchContext {
    /// An empty context. Nothing is allocated until the first [`DispatchContext::prepare`].
    pub fn new() -> Self {
        Self {
            descriptor_set: AlignedBuf::empty(REQUIRED_MEMORY_ALIGNMENT),
            nthreads: 0,
            has_cbarriers: false,
            memory_size: 0,
            workgroups: 0,
            program: None,
            data: ProgramData::default(),
        }
    }

    /// Sets up a dispatch of `program` over a grid of `num_workgroups` split across `nthreads`.
    ///
    /// The first `desc_set_size` bytes of `descriptor_set` are copied into storage owned by the
    /// context; the caller's bytes are not referenced afterwards. Push constants and dynamic
    /// offsets are left as they are.
    #[cfg_attr(
        feature = "trace",
        tracing::instrument(level = "trace", skip(self, program, descriptor_set))
    )]
    pub fn prepare(
        &mut self,
        nthreads: usize,
        program: Arc<dyn CompiledProgram>,
        descriptor_set: &[u8],
        num_workgroups: [u32; 3],
    ) -> Result<(), DispatchError> {
        if nthreads == 0 {
            return Err(DispatchError::Threads);
        }

        let info = *program.info();
        if descriptor_set.len() < info.desc_set_size {
            return Err(DispatchError::DescriptorSet(
                info.desc_set_size,
                descriptor_set.len(),
            ));
        }

        let workgroup_size = info.workgroup_size;
        let invocations_per_workgroup = workgroup_size
            .iter()
            .try_fold(1u32, |acc, &x| acc.checked_mul(x))
            .filter(|&x| x > 0)
            .ok_or(DispatchError::WorkgroupSize(workgroup_size))?;

        // workgroup coordinates must also fit the `i32` arguments of native routines
        let workgroups = num_workgroups
            .iter()
            .try_fold(1usize, |acc, &x| match i32::try_from(x) {
                Ok(_) => acc.checked_mul(x as usize),
                Err(_) => None,
            })
            .ok_or(DispatchError::GridOverflow(num_workgroups))?;

        let capacity = align_up(info.desc_set_size, REQUIRED_MEMORY_ALIGNMENT);
        if self.descriptor_set.reserve(capacity) {
            log::debug!("descriptor set storage grown to {capacity} bytes");
        }
        let size = info.desc_set_size;
        self.descriptor_set.as_mut_slice()[..size].copy_from_slice(&descriptor_set[..size]);

        let invocations_per_subgroup = SIMD_WIDTH;
        let subgroups_per_workgroup = invocations_per_workgroup.div_ceil(invocations_per_subgroup);

        self.nthreads = nthreads;
        self.has_cbarriers = info.has_cbarriers;
        self.memory_size = info.min_memory_size;
        self.workgroups = workgroups;
        self.program = Some(program);

        let [sx, sy, sz] = workgroup_size;
        let [nx, ny, nz] = num_workgroups;
        let data = &mut self.data;
        data.workgroup_size = Uint4([sx, sy, sz, 0]);
        data.num_workgroups = Uint4([nx, ny, nz, 0]);
        data.invocations_per_subgroup = invocations_per_subgroup;
        data.invocations_per_workgroup = invocations_per_workgroup;
        data.subgroups_per_workgroup = subgroups_per_workgroup;
        data.descriptor_sets[0] = match self.descriptor_set.is_empty() {
            true => std::ptr::null_mut(),
            false => self.descriptor_set.as_mut_ptr(),
        };
        Ok(())
    }

    /// Copies `bytes` to the start of the push constant block.
    pub fn set_push_constants(&mut self, bytes: &[u8]) -> Result<(), DispatchError> {
        let Some(dst) = self.data.push_constants.get_mut(..bytes.len()) else {
            return Err(DispatchError::PushConstants(
                bytes.len(),
                MAX_PUSH_CONSTANT_SIZE,
            ));
        };
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `offsets` to the start of the dynamic offset table.
    pub fn set_dynamic_offsets(&mut self, offsets: &[u32]) -> Result<(), DispatchError> {
        let Some(dst) = self.data.descriptor_dynamic_offsets.get_mut(..offsets.len()) else {
            return Err(DispatchError::DynamicOffsets(
                offsets.len(),
                MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC,
            ));
        };
        dst.copy_from_slice(offsets);
        Ok(())
    }

    /// Releases the descriptor storage and forgets the prepared program.
    pub fn free(&mut self) {
        *self = Self::new();
    }

    /// The constants handed to every coroutine of the prepared dispatch.
    #[inline]
    pub fn program_data(&self) -> &ProgramData {
        &self.data
    }

    /// The context's copy of the prepared descriptor set, including alignment padding.
    #[inline]
    pub fn descriptor_set(&self) -> &[u8] {
        self.descriptor_set.as_slice()
    }

    #[inline]
    pub fn descriptor_capacity(&self) -> usize {
        self.descriptor_set.len()
    }

    #[inline]
    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    #[inline]
    pub fn grid(&self) -> [u32; 3] {
        self.data.num_workgroups()
    }

    /// Total number of workgroups in the prepared grid.
    #[inline]
    pub fn num_workgroups(&self) -> usize {
        self.workgroups
    }
}

/// Per-thread scratch state: the workgroup memory block and the coroutine queue.
///
/// A thread context must only be used by one dispatch at a time. Both its memory and its queue
/// are kept between dispatches.
#[derive(Default)]
pub struct ThreadContext {
    // drops before `memory`, which queued coroutines may point into
    pub(super) routines: Coroutines<Box<dyn Coroutine>>,
    pub(super) memory: AlignedBuf,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("memory_size", &self.memory.len())
            .field("queued", &self.routines.len())
            .field("queue_capacity", &self.routines.capacity())
            .finish()
    }
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grows the workgroup memory to hold at least `size` bytes.
    pub(super) fn reserve_memory(&mut self, size: usize) {
        let size = align_up(size, REQUIRED_MEMORY_ALIGNMENT);
        if self.memory.reserve(size) {
            log::debug!("thread workgroup memory grown to {size} bytes");
        }
    }

    /// Releases the workgroup memory and the queue storage.
    pub fn free(&mut self) {
        self.routines.free();
        self.memory.free();
    }

    /// The workgroup memory as left by the last dispatch.
    #[inline]
    pub fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn queue_capacity(&self) -> usize {
        self.routines.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        alloc::{GlobalAlloc, Layout, System},
        panic::AssertUnwindSafe,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use super::{DispatchContext, ThreadContext};
    use crate::program::{Invocation, KernelProgram, ProgramInfo, WorkgroupMemory, barrier};

    /// Forwards to the system allocator and notes when the watched block is released.
    struct Tracking;

    static WATCHED: AtomicUsize = AtomicUsize::new(0);
    static RELEASED: AtomicBool = AtomicBool::new(false);

    #[global_allocator]
    static GLOBAL: Tracking = Tracking;

    unsafe impl GlobalAlloc for Tracking {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { System.alloc(layout) }
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { System.alloc_zeroed(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if ptr as usize == WATCHED.load(Ordering::SeqCst) {
                RELEASED.store(true, Ordering::SeqCst);
            }
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    fn watch(block: &[u8]) {
        RELEASED.store(false, Ordering::SeqCst);
        WATCHED.store(block.as_ptr() as usize, Ordering::SeqCst);
    }

    /// Reports on drop whether the workgroup memory it was handed is still allocated.
    struct Guard {
        memory: WorkgroupMemory,
        live: flume::Sender<bool>,
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            let watched = self.memory.as_ptr() as usize == WATCHED.load(Ordering::SeqCst);
            _ = self.live.send(watched && !RELEASED.load(Ordering::SeqCst));
        }
    }

    /// Runs a dispatch whose first subgroup panics after a barrier, leaving the second one queued.
    fn interrupted() -> (DispatchContext, ThreadContext, flume::Receiver<bool>) {
        let (sender, receiver) = flume::unbounded();
        let info = ProgramInfo::new([8, 1, 1])
            .with_cbarriers(true)
            .with_memory_size(16);
        let program = KernelProgram::new(info, move |invocation: Invocation| {
            let live = sender.clone();
            async move {
                let _guard = Guard {
                    memory: invocation.memory,
                    live,
                };
                barrier().await;
                if invocation.subgroups.first == 0 {
                    panic!("subgroup 0 failed");
                }
                barrier().await;
            }
        });

        let mut ctx = DispatchContext::new();
        ctx.prepare(1, Arc::new(program), &[], [1, 1, 1]).unwrap();

        let mut thread = ThreadContext::new();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| ctx.dispatch(0, &mut thread)));
        assert!(result.is_err());
        assert_eq!(thread.routines.len(), 1);

        // the guard of the panicking subgroup
        while receiver.try_recv().is_ok() {}
        (ctx, thread, receiver)
    }

    #[test]
    fn test_leftover_routines() {
        let (_ctx, thread, live) = interrupted();
        watch(thread.memory());
        drop(thread);
        assert_eq!(live.try_iter().collect::<Vec<_>>(), [true]);

        // the next dispatch grows the memory after destroying the leftovers
        let (mut ctx, mut thread, live) = interrupted();
        watch(thread.memory());
        let info = ProgramInfo::new([4, 1, 1]).with_memory_size(4096);
        let program = KernelProgram::new(info, |_: Invocation| async {});
        ctx.prepare(1, Arc::new(program), &[], [1, 1, 1]).unwrap();

        let stats = ctx.dispatch(0, &mut thread).unwrap();
        assert_eq!(stats.coroutines, 1);
        assert_eq!(thread.memory_size(), 4096);
        assert!(thread.routines.is_empty());
        assert_eq!(live.try_iter().collect::<Vec<_>>(), [true]);
    }
}
