//! Scheduling of compiled programs on host threads.
//!
//! A dispatch is prepared once on a [`DispatchContext`] and then executed by calling
//! [`DispatchContext::dispatch`] for every thread index, each with its own [`ThreadContext`].
//! Workgroups are dealt out round-robin: thread `t` of `n` runs workgroups `t`, `t + n`, `t + 2n`,
//! and so on. Each workgroup is run to completion before the next one starts, with its coroutines
//! resumed in FIFO order until all of them have finished.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod context;
mod dispatch;
pub mod queue;

pub use context::{DispatchContext, ThreadContext};
pub use queue::Coroutines;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch error: at least one thread is required")]
    Threads,
    #[error("dispatch error: program expects a descriptor set of {0} bytes, got {1}")]
    DescriptorSet(usize, usize),
    #[error("dispatch error: invalid workgroup size {0:?}")]
    WorkgroupSize([u32; 3]),
    #[error("dispatch error: workgroup grid {0:?} is too large")]
    GridOverflow([u32; 3]),
    #[error("dispatch error: context has not been prepared")]
    Unprepared,
    #[error("dispatch error: thread index {0} out of range for {1} threads")]
    ThreadIndex(usize, usize),
    #[error("dispatch error: dispatch prepared for {0} threads, got {1} thread contexts")]
    ThreadContexts(usize, usize),
    #[error("dispatch error: {0} bytes of push constants exceed the limit of {1}")]
    PushConstants(usize, usize),
    #[error("dispatch error: {0} dynamic offsets exceed the limit of {1}")]
    DynamicOffsets(usize, usize),
}

/// Work done by one or more threads of a dispatch.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{workgroups} workgroups, {coroutines} coroutines, {resumptions} resumptions")]
pub struct DispatchStats {
    pub workgroups: usize,
    pub coroutines: usize,
    pub resumptions: usize,
}

impl std::ops::AddAssign for DispatchStats {
    fn add_assign(&mut self, rhs: Self) {
        self.workgroups += rhs.workgroups;
        self.coroutines += rhs.coroutines;
        self.resumptions += rhs.resumptions;
    }
}

impl std::iter::Sum for DispatchStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, x| {
            acc += x;
            acc
        })
    }
}
