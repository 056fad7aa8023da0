use super::{DispatchContext, DispatchError, DispatchStats, ThreadContext};
use crate::program::{Subgroups, WorkgroupMemory};

impl DispatchContext {
    /// Coordinates of the workgroups run by thread `thread_index`, in execution order.
    ///
    /// Linear workgroup indices `thread_index, thread_index + nthreads, ...` are decoded with `x`
    /// varying fastest. The iterator is empty for an unprepared context.
    pub fn workgroups_for(&self, thread_index: usize) -> impl Iterator<Item = [u32; 3]> + '_ {
        let [sx, sy, _] = self.grid().map(|x| x as usize);
        (thread_index..self.workgroups)
            .step_by(self.nthreads.max(1))
            .map(move |index| {
                let z = index / (sx * sy);
                let index = index - z * sx * sy;
                let y = index / sx;
                let x = index - y * sx;
                [x as u32, y as u32, z as u32]
            })
    }

    /// Runs the share of the prepared dispatch that belongs to `thread_index`.
    ///
    /// Blocks until every coroutine started by this call has finished. Calls for different thread
    /// indices may run concurrently, each with its own `thread`.
    #[cfg_attr(
        feature = "trace",
        tracing::instrument(level = "trace", skip(self, thread))
    )]
    pub fn dispatch(
        &self,
        thread_index: usize,
        thread: &mut ThreadContext,
    ) -> Result<DispatchStats, DispatchError> {
        let Some(program) = &self.program else {
            return Err(DispatchError::Unprepared);
        };
        if thread_index >= self.nthreads {
            return Err(DispatchError::ThreadIndex(thread_index, self.nthreads));
        }

        // leftovers of a dispatch that unwound halfway, destroyed while their memory is alive
        while thread.routines.pop().is_some() {}

        thread.reserve_memory(self.memory_size);
        let ThreadContext { routines, memory } = thread;
        let memory = WorkgroupMemory::new(memory.as_mut_slice());

        let data = &self.data;
        let subgroups = data.subgroups_per_workgroup;
        let mut stats = DispatchStats::default();

        for workgroup in self.workgroups_for(thread_index) {
            stats.workgroups += 1;
            match self.has_cbarriers {
                true => {
                    for subgroup in 0..subgroups {
                        let routine =
                            program.begin(data, workgroup, memory, Subgroups::new(subgroup, 1));
                        routines.push(routine);
                    }
                    stats.coroutines += subgroups as usize;
                }
                false => {
                    let routine =
                        program.begin(data, workgroup, memory, Subgroups::new(0, subgroups));
                    routines.push(routine);
                    stats.coroutines += 1;
                }
            }

            while let Some(mut routine) = routines.pop() {
                stats.resumptions += 1;
                if routine.poll().is_pending() {
                    routines.push(routine);
                }
            }
        }

        log::trace!("thread {thread_index}/{}: {stats}", self.nthreads);
        Ok(stats)
    }

    /// Runs every thread index of the prepared dispatch, using `threads[i]` for index `i`.
    ///
    /// With the `rayon` feature the thread indices run in parallel on rayon's global pool;
    /// otherwise they run one after another on the calling thread.
    pub fn dispatch_all(
        &self,
        threads: &mut [ThreadContext],
    ) -> Result<DispatchStats, DispatchError> {
        if self.program.is_none() {
            return Err(DispatchError::Unprepared);
        }
        if threads.len() != self.nthreads {
            return Err(DispatchError::ThreadContexts(self.nthreads, threads.len()));
        }

        #[cfg(not(feature = "rayon"))]
        let stats: Vec<_> = threads
            .iter_mut()
            .enumerate()
            .map(|(index, thread)| self.dispatch(index, thread))
            .collect::<Result<_, _>>()?;
        #[cfg(feature = "rayon")]
        let stats: Vec<_> = {
            use rayon::prelude::*;

            threads
                .par_iter_mut()
                .enumerate()
                .map(|(index, thread)| self.dispatch(index, thread))
                .collect::<Result<_, _>>()?
        };

        let stats: DispatchStats = stats.into_iter().sum();
        log::trace!("dispatch on {} threads: {stats}", self.nthreads);
        Ok(stats)
    }
}
