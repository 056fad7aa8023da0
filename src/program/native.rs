use std::task::Poll;

use super::{CompiledProgram, Coroutine, ProgramInfo, Subgroups, WorkgroupMemory};
use crate::abi::{
    ProgramData, RawCoroutine, RoutineAwait, RoutineBegin, RoutineDestroy, YieldResult,
};

/// Constant parameters and entry points of a program, as emitted by the shader compiler.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawProgramInfo {
    pub min_memory_size: usize,
    pub has_cbarriers: u8,
    pub desc_set_size: usize,
    pub workgroup_size_x: i32,
    pub workgroup_size_y: i32,
    pub workgroup_size_z: i32,
    pub begin: RoutineBegin,
    pub r#await: RoutineAwait,
    pub destroy: RoutineDestroy,
}

/// A program whose coroutines are native routines following the compiler's coroutine ABI.
#[derive(Debug, Clone)]
pub struct NativeProgram {
    info: ProgramInfo,
    begin: RoutineBegin,
    r#await: RoutineAwait,
    destroy: RoutineDestroy,
}

impl NativeProgram {
    /// # Safety
    /// The entry points must implement the coroutine protocol: `begin` returns a handle that stays
    /// valid until it is passed to `destroy`, `await` resumes it and reports whether it is still
    /// running, and all three are safe to call from any thread.
    pub unsafe fn new(
        info: ProgramInfo,
        begin: RoutineBegin,
        r#await: RoutineAwait,
        destroy: RoutineDestroy,
    ) -> Self {
        Self {
            info,
            begin,
            r#await,
            destroy,
        }
    }

    /// # Safety
    /// See [`NativeProgram::new`].
    ///
    /// # Panics
    /// Panics if a workgroup dimension is negative.
    pub unsafe fn from_raw(raw: &RawProgramInfo) -> Self {
        let dim = |x: i32| match u32::try_from(x) {
            Ok(x) => x,
            Err(_) => panic!("negative workgroup dimension {x}"),
        };
        let info = ProgramInfo {
            min_memory_size: raw.min_memory_size,
            has_cbarriers: raw.has_cbarriers != 0,
            desc_set_size: raw.desc_set_size,
            workgroup_size: [
                dim(raw.workgroup_size_x),
                dim(raw.workgroup_size_y),
                dim(raw.workgroup_size_z),
            ],
        };
        unsafe { Self::new(info, raw.begin, raw.r#await, raw.destroy) }
    }
}

impl CompiledProgram for NativeProgram {
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
        let [x, y, z] = workgroup.map(|x| x as i32);
        // generated code takes a mutable pointer but never writes through it
        let data = data as *const ProgramData as *mut ProgramData;
        let handle = unsafe {
            (self.begin)(
                data,
                x,
                y,
                z,
                memory.as_ptr().cast(),
                subgroups.first as i32,
                subgroups.count as i32,
            )
        };
        Box::new(NativeRoutine {
            handle,
            r#await: self.r#await,
            destroy: self.destroy,
            result: 0,
            finished: false,
        })
    }
}

/// A coroutine frame owned by the runtime. Dropping it calls the program's `destroy` entry point.
#[derive(Debug)]
pub struct NativeRoutine {
    handle: RawCoroutine,
    r#await: RoutineAwait,
    destroy: RoutineDestroy,
    result: YieldResult,
    finished: bool,
}

// SAFETY: the frame is exclusively owned by this handle, and `NativeProgram::new` requires the
// entry points to be callable from any thread.
unsafe impl Send for NativeRoutine {}

impl NativeRoutine {
    /// The value the routine reported on its last resumption.
    #[inline]
    pub fn result(&self) -> YieldResult {
        self.result
    }
}

impl Coroutine for NativeRoutine {
    fn poll(&mut self) -> Poll<()> {
        debug_assert!(!self.finished, "resumed a finished coroutine");
        let running = unsafe { (self.r#await)(self.handle, &mut self.result) };
        match running {
            0 => {
                self.finished = true;
                Poll::Ready(())
            }
            _ => Poll::Pending,
        }
    }
}

impl Drop for NativeRoutine {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.handle) }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::c_void,
        sync::{Arc, Mutex},
        task::Poll,
    };

    use super::{NativeProgram, RawProgramInfo};
    use crate::{
        abi::{ProgramData, RawCoroutine, YieldResult},
        program::{CompiledProgram, Subgroups, WorkgroupMemory},
        runtime::{DispatchContext, ThreadContext},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Begin([i32; 3], i32, i32),
        Await([i32; 3], i32),
        Destroy([i32; 3], i32),
    }

    static EVENTS: Mutex<Vec<Event>> = Mutex::new(Vec::new());
    static SERIAL: Mutex<()> = Mutex::new(());

    struct Frame {
        workgroup: [i32; 3],
        first_subgroup: i32,
        remaining: i32,
        memory: *mut u8,
    }

    fn record(event: Event) {
        EVENTS.lock().unwrap().push(event);
    }

    unsafe extern "C" fn begin(
        data: *mut ProgramData,
        x: i32,
        y: i32,
        z: i32,
        memory: *mut c_void,
        first_subgroup: i32,
        subgroup_count: i32,
    ) -> RawCoroutine {
        let data = unsafe { &*data };
        // yield once per barrier; two barriers per run
        let remaining = 2 + data.push_constants[0] as i32;
        record(Event::Begin([x, y, z], first_subgroup, subgroup_count));
        let frame = Box::new(Frame {
            workgroup: [x, y, z],
            first_subgroup,
            remaining,
            memory: memory.cast(),
        });
        Box::into_raw(frame).cast()
    }

    unsafe extern "C" fn r#await(r: RawCoroutine, res: *mut YieldResult) -> u8 {
        let frame = unsafe { &mut *r.cast::<Frame>() };
        record(Event::Await(frame.workgroup, frame.first_subgroup));
        // count resumptions in the first byte of workgroup memory
        unsafe { *frame.memory += 1 };
        frame.remaining -= 1;
        unsafe { *res = frame.remaining };
        (frame.remaining >= 0) as u8
    }

    unsafe extern "C" fn destroy(r: RawCoroutine) {
        let frame = unsafe { Box::from_raw(r.cast::<Frame>()) };
        record(Event::Destroy(frame.workgroup, frame.first_subgroup));
    }

    fn raw_info(has_cbarriers: bool) -> RawProgramInfo {
        RawProgramInfo {
            min_memory_size: 16,
            has_cbarriers: has_cbarriers as u8,
            desc_set_size: 0,
            workgroup_size_x: 8,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            begin,
            r#await,
            destroy,
        }
    }

    #[test]
    fn test_native_protocol() {
        let _guard = SERIAL.lock().unwrap();
        EVENTS.lock().unwrap().clear();

        let program = unsafe { NativeProgram::from_raw(&raw_info(false)) };
        assert_eq!(program.info().workgroup_size, [8, 1, 1]);
        assert_eq!(program.info().min_memory_size, 16);

        let data = ProgramData::default();
        let mut memory = [0u8; 16];
        let handle = WorkgroupMemory::new(&mut memory);
        let mut routine = program.begin(&data, [1, 2, 3], handle, Subgroups::new(0, 2));

        assert_eq!(routine.poll(), Poll::Pending);
        assert_eq!(routine.poll(), Poll::Pending);
        assert_eq!(routine.poll(), Poll::Ready(()));
        drop(routine);

        assert_eq!(memory[0], 3);
        let events = EVENTS.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::Begin([1, 2, 3], 0, 2),
                Event::Await([1, 2, 3], 0),
                Event::Await([1, 2, 3], 0),
                Event::Await([1, 2, 3], 0),
                Event::Destroy([1, 2, 3], 0),
            ]
        );
    }

    #[test]
    fn test_native_dispatch() {
        let _guard = SERIAL.lock().unwrap();
        EVENTS.lock().unwrap().clear();

        let program = Arc::new(unsafe { NativeProgram::from_raw(&raw_info(true)) });
        let mut ctx = DispatchContext::new();
        ctx.prepare(1, program, &[], [1, 1, 1]).unwrap();

        let mut thread = ThreadContext::new();
        let stats = ctx.dispatch(0, &mut thread).unwrap();
        assert_eq!(stats.workgroups, 1);
        assert_eq!(stats.coroutines, 2);
        assert_eq!(stats.resumptions, 6);

        let events = EVENTS.lock().unwrap().clone();
        let wg = [0, 0, 0];
        assert_eq!(
            events,
            vec![
                Event::Begin(wg, 0, 1),
                Event::Begin(wg, 1, 1),
                Event::Await(wg, 0),
                Event::Await(wg, 1),
                Event::Await(wg, 0),
                Event::Await(wg, 1),
                Event::Await(wg, 0),
                Event::Destroy(wg, 0),
                Event::Await(wg, 1),
                Event::Destroy(wg, 1),
            ]
        );
        assert_eq!(thread.memory()[0], 6);
    }
}
