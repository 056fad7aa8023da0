//! Programs written directly in Rust.
//!
//! A kernel is an `async` closure run once per coroutine. Control barriers are `barrier().await`;
//! everything between two barriers runs without interruption, exactly like the native routines the
//! shader compiler emits.

use std::{
    future::Future,
    ops::Range,
    pin::Pin,
    task::{Context, Poll},
};

use super::{CompiledProgram, Coroutine, ProgramInfo, Subgroups, WorkgroupMemory};
use crate::abi::ProgramData;

/// Everything a kernel coroutine knows about the work it was started for.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    pub data: ProgramData,
    pub workgroup: [u32; 3],
    pub subgroups: Subgroups,
    pub memory: WorkgroupMemory,
}

impl Invocation {
    /// Linear local invocation indices of one subgroup.
    ///
    /// The last subgroup of a workgroup whose size is not a multiple of the subgroup width only
    /// covers the remaining invocations.
    pub fn subgroup_invocations(&self, subgroup: u32) -> Range<u32> {
        let width = self.data.invocations_per_subgroup;
        let total = self.data.invocations_per_workgroup;
        let start = (subgroup * width).min(total);
        let end = (start + width).min(total);
        start..end
    }

    /// Converts a linear local invocation index into a local invocation id.
    pub fn local_id(&self, index: u32) -> [u32; 3] {
        let [sx, sy, _] = self.data.workgroup_size();
        [index % sx, (index / sx) % sy, index / (sx * sy)]
    }

    /// Global invocation id of the invocation with local id `local`.
    pub fn global_id(&self, local: [u32; 3]) -> [u32; 3] {
        let size = self.data.workgroup_size();
        std::array::from_fn(|i| self.workgroup[i] * size[i] + local[i])
    }

    /// Local invocation ids of every invocation this coroutine executes.
    pub fn local_ids(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.subgroups
            .range()
            .flat_map(|subgroup| self.subgroup_invocations(subgroup))
            .map(|index| self.local_id(index))
    }

    /// Subgroups of this coroutine, each with the linear local indices of its lanes.
    pub fn lanes(&self) -> impl Iterator<Item = (u32, Range<u32>)> + '_ {
        self.subgroups
            .range()
            .map(|subgroup| (subgroup, self.subgroup_invocations(subgroup)))
    }
}

/// Suspends the calling kernel until every other coroutine of its workgroup had its turn.
#[inline]
pub fn barrier() -> Barrier {
    Barrier { yielded: false }
}

/// Future returned by [`barrier`].
#[derive(Debug)]
#[must_use = "barriers do nothing unless awaited"]
pub struct Barrier {
    yielded: bool,
}

impl Future for Barrier {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// A program made of a Rust `async` kernel.
pub struct KernelProgram<F> {
    info: ProgramInfo,
    kernel: F,
}

impl<F, Fut> KernelProgram<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(info: ProgramInfo, kernel: F) -> Self {
        Self { info, kernel }
    }
}

impl<F> std::fmt::Debug for KernelProgram<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProgram")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<F, Fut> CompiledProgram for KernelProgram<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    #[inline]
    fn info(&self) -> &ProgramInfo {
        &self.info
    }

    fn begin(
        &self,
        data: &ProgramData,
        workgroup: [u32; 3],
        memory: WorkgroupMemory,
        subgroups: Subgroups,
    ) -> Box<dyn Coroutine> {
        let invocation = Invocation {
            data: *data,
            workgroup,
            subgroups,
            memory,
        };
        let future = Box::pin((self.kernel)(invocation));
        Box::new(KernelRoutine { future })
    }
}

struct KernelRoutine {
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Coroutine for KernelRoutine {
    #[inline]
    fn poll(&mut self) -> Poll<()> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        self.future.as_mut().poll(&mut cx)
    }
}
