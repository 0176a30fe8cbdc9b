//! Explorer - Interpreter-aware exploration on top of a symbolic execution host
//!
//! This crate connects the low-level tracers and the path scheduler into a
//! single object the host engine feeds with its signals and asks for the next
//! execution context to run.
//!
//! # Overview
//!
//! The host reports guest pseudo-syscalls, privilege and address-space
//! changes, calls, stack pointer writes, basic blocks, memory accesses and
//! the lifecycle of its execution contexts. The explorer:
//!
//! * follows the guest thread selected by the configuration,
//! * reconstructs its native call stacks,
//! * detects the structure of the interpreter during a calibration window,
//! * tracks bytecode-level frames and PCs once the structure is known,
//! * drives the high-level executor and the low-level strategy.
//!
//! Every signal returns a [`Control`]: [`Control::YieldRequested`] asks the
//! host loop to return to scheduling, which happens after a merge.
//!
//! # Usage
//!
//! ```
//! use bytecode_tracer::StateId;
//! use explorer::{Config, Control, Explorer, Searcher};
//!
//! let mut explorer = Explorer::new(Config::default(), ()).unwrap();
//! explorer.update(None, &[StateId(0)], &[]);
//!
//! // No thread has been announced, so nothing is tracked yet
//! let control = explorer.on_call(StateId(0), 0x40_1000, 0x40_2000, 0x7fff_0000).unwrap();
//! assert_eq!(control, Control::Continue);
//! assert_eq!(explorer.select_state(), Some(StateId(0)));
//! ```

pub mod config;
pub mod error;
pub mod events;

pub use config::Config;
pub use error::ExplorerError;
pub use events::{Event, EventRecorder, Observer};
pub use path_scheduler::{Control, ExecutionHost, LowLevelKind, Searcher, StrategyKind};

use bytecode_tracer::syscall::{
    RangeHandle, SYSCALL_CALIBRATION_END, SYSCALL_CALIBRATION_START, SYSCALL_THREAD_START, SYSCALL_VM_ALLOC,
};
use bytecode_tracer::{
    BasicBlockInfo, CallGraphMonitor, CallStack, CallStackFrame, CallStackListener, CallTracer, GuestSyscall,
    HighLevelStack, InterpreterDetector, InterpreterListener, InterpreterStructureParams, InterpreterTracer,
    MemoryTrace, OsEvent, OsTracer, StateId, SyscallMonitor, TracerConfig,
};
use path_scheduler::Scheduler;
use std::path::Path;

/// Result type for explorer operations
pub type Result<T> = anyhow::Result<T>;

/// Number of functions listed in the call graph report
const TOP_CALLERS: usize = 10;

/// Analyses bound to the followed guest thread
#[derive(Debug)]
struct TrackedThread {
    tid: u32,
    calls: CallTracer,
    interp: InterpreterTracer,
    /// Call tree of the first context seen in the thread
    call_graph: Option<CallGraphMonitor>,
}

/// Fans native frame notifications out to every consumer
struct NativeDispatch<'a, H> {
    interp: &'a mut InterpreterTracer,
    call_graph: Option<&'a mut CallGraphMonitor>,
    scheduler: &'a mut Scheduler<H>,
    events: &'a mut Vec<Event>,
}

impl<H: ExecutionHost> CallStackListener for NativeDispatch<'_, H> {
    fn on_stack_frame_push(&mut self, state: StateId, old_top: &CallStackFrame, new_top: &CallStackFrame) -> Result<()> {
        self.events.push(Event::FramePush {
            state,
            frame_id: new_top.id,
            call_site: new_top.call_site,
            function: new_top.function,
        });
        if let Some(graph) = self.call_graph.as_deref_mut() {
            graph.on_stack_frame_push(state, old_top, new_top)?;
        }
        let mut high_level = HighLevelDispatch {
            scheduler: &mut *self.scheduler,
            events: &mut *self.events,
        };
        self.interp.on_frame_push(state, new_top, &mut high_level)?;
        self.scheduler.on_stack_frame_push(state, old_top, new_top)
    }

    fn on_stack_frame_popping(
        &mut self,
        state: StateId,
        old_top: &CallStackFrame,
        new_top: &CallStackFrame,
    ) -> Result<()> {
        self.events.push(Event::FramePopping {
            state,
            frame_id: old_top.id,
            function: old_top.function,
        });
        if let Some(graph) = self.call_graph.as_deref_mut() {
            graph.on_stack_frame_popping(state, old_top, new_top)?;
        }
        let mut high_level = HighLevelDispatch {
            scheduler: &mut *self.scheduler,
            events: &mut *self.events,
        };
        self.interp.on_frame_popping(state, old_top, &mut high_level)?;
        self.scheduler.on_stack_frame_popping(state, old_top, new_top)
    }

    fn on_stack_frame_resize(&mut self, state: StateId, top: &CallStackFrame) -> Result<()> {
        self.events.push(Event::FrameResize {
            state,
            frame_id: top.id,
            bottom: top.bottom,
        });
        Ok(())
    }

    fn on_basic_block_enter(&mut self, state: StateId, top: &CallStackFrame) -> Result<()> {
        if let Some(block) = top.basic_block {
            self.events.push(Event::BasicBlockEnter {
                state,
                function: top.function,
                block,
            });
        }
        self.scheduler.on_basic_block_enter(state, top)
    }
}

/// Records bytecode-level notifications and feeds PC updates to the scheduler
struct HighLevelDispatch<'a, H> {
    scheduler: &'a mut Scheduler<H>,
    events: &'a mut Vec<Event>,
}

impl<H: ExecutionHost> InterpreterListener for HighLevelDispatch<'_, H> {
    fn on_high_level_frame_push(&mut self, state: StateId, stack: &HighLevelStack) -> Result<()> {
        self.events.push(Event::HighLevelFramePush {
            state,
            depth: stack.depth(),
        });
        Ok(())
    }

    fn on_high_level_frame_popping(&mut self, state: StateId, stack: &HighLevelStack) -> Result<()> {
        self.events.push(Event::HighLevelFramePopping {
            state,
            depth: stack.depth(),
        });
        Ok(())
    }

    fn on_high_level_pc_update(&mut self, state: StateId, stack: &HighLevelStack) -> Result<()> {
        if let Some(frame) = stack.top() {
            self.events.push(Event::HighLevelPcUpdate { state, hlpc: frame.hlpc });
        }
        self.scheduler.on_high_level_pc_update(state, stack)
    }

    fn on_high_level_instruction_fetch(&mut self, state: StateId, stack: &HighLevelStack) -> Result<()> {
        if let Some(frame) = stack.top() {
            self.events.push(Event::OpcodeFetch {
                state,
                hlpc: frame.hlpc,
                address: frame.hlinst,
            });
        }
        Ok(())
    }
}

/// Entry point of the host engine
pub struct Explorer<H> {
    config: Config,
    tracer_config: TracerConfig,
    os: OsTracer,
    syscalls: SyscallMonitor,
    os_range: RangeHandle,
    calibration_range: RangeHandle,
    detector: InterpreterDetector,
    tracked: Option<TrackedThread>,
    /// Last detected or loaded structure
    params: Option<InterpreterStructureParams>,
    scheduler: Scheduler<H>,
    observers: Vec<Box<dyn Observer>>,
    pending: Vec<Event>,
}

impl<H: ExecutionHost> Explorer<H> {
    /// Create an explorer driving `host`
    pub fn new(config: Config, host: H) -> Result<Self> {
        let tracer_config = config.tracer_config();
        let mut syscalls = SyscallMonitor::new();
        let calibration_range = syscalls.register_range(SYSCALL_CALIBRATION_START, SYSCALL_CALIBRATION_END + 1)?;
        let os_range = syscalls.register_range(SYSCALL_THREAD_START, SYSCALL_VM_ALLOC + 1)?;

        tracing::info!(
            "Explorer ready: strategy {:?}, low-level {:?}, tracked thread {}",
            config.strategy,
            config.low_level,
            config.tracked_thread.as_deref().unwrap_or("<first announced>")
        );
        Ok(Self {
            detector: InterpreterDetector::new(tracer_config.clone()),
            scheduler: Scheduler::new(&config.scheduler_config(), host),
            tracer_config,
            config,
            os: OsTracer::new(),
            syscalls,
            os_range,
            calibration_range,
            tracked: None,
            params: None,
            observers: Vec::new(),
            pending: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn os(&self) -> &OsTracer {
        &self.os
    }

    pub fn scheduler(&self) -> &Scheduler<H> {
        &self.scheduler
    }

    pub fn host(&self) -> &H {
        self.scheduler.host()
    }

    pub fn host_mut(&mut self) -> &mut H {
        self.scheduler.host_mut()
    }

    /// Tid of the followed guest thread
    pub fn tracked_thread(&self) -> Option<u32> {
        self.tracked.as_ref().map(|tracked| tracked.tid)
    }

    /// Memory operations recorded by a running calibration
    pub fn calibration_trace(&self) -> Option<&MemoryTrace> {
        self.detector.trace()
    }

    /// The structure in use, detected or loaded
    pub fn params(&self) -> Option<&InterpreterStructureParams> {
        self.params.as_ref()
    }

    pub fn call_stack(&self, state: StateId) -> Option<&CallStack> {
        self.tracked.as_ref()?.calls.stack(state)
    }

    pub fn high_level_stack(&self, state: StateId) -> Option<&HighLevelStack> {
        self.tracked.as_ref()?.interp.stack(state)
    }

    /// Call tree of the followed thread
    pub fn call_graph(&self) -> Option<&CallGraphMonitor> {
        self.tracked.as_ref()?.call_graph.as_ref()
    }

    /// Register an observer of every produced [`Event`]
    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Use `params` as the interpreter structure from now on
    pub fn set_params(&mut self, params: InterpreterStructureParams) {
        tracing::info!(
            "Using interpreter structure: loop={:#x} hlpc_update={:#x} fetch={:#x}",
            params.interp_loop_function,
            params.hlpc_update_pc,
            params.instruction_fetch_pc
        );
        self.params = Some(params);
        self.scheduler.set_interp_loop_function(Some(params.interp_loop_function));
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.interp.set_params(params, tracked.calls.stacks());
        }
    }

    /// Persist the structure in use as JSON
    pub fn save_params(&self, path: impl AsRef<Path>) -> Result<()> {
        let params = self.params.ok_or(ExplorerError::NoStructure)?;
        params.save(path)
    }

    /// Load a structure saved by [`save_params`](Self::save_params) and use it
    pub fn load_params(&mut self, path: impl AsRef<Path>) -> Result<InterpreterStructureParams> {
        let params = InterpreterStructureParams::load(path)?;
        self.set_params(params);
        Ok(params)
    }

    /// Whether the followed thread is running in user mode
    fn is_tracking(&self) -> bool {
        match (&self.tracked, self.os.active_thread()) {
            (Some(tracked), Some(active)) => {
                tracked.tid == active.tid && self.os.is_running_in_user_mode(tracked.tid)
            }
            _ => false,
        }
    }

    /// The guest executed the analysis custom instruction
    pub fn on_custom_instruction(&mut self, state: StateId, syscall: &GuestSyscall) -> Result<Control> {
        for handle in self.syscalls.dispatch(syscall) {
            if handle == self.os_range {
                match self.os.handle_syscall(syscall) {
                    Ok(events) => self.handle_os_events(events),
                    Err(err) => tracing::warn!("Ignoring malformed OS syscall {:#x}: {:#}", syscall.id, err),
                }
            } else if handle == self.calibration_range {
                self.handle_calibration(state, syscall);
            }
        }
        self.finish()
    }

    /// The CPU privilege level changed
    pub fn on_privilege_change(&mut self, _state: StateId, previous: u32, current: u32) -> Result<Control> {
        let events = self.os.on_privilege_change(previous, current);
        self.handle_os_events(events);
        self.finish()
    }

    /// The page-directory root changed
    pub fn on_page_directory_change(&mut self, _state: StateId, previous: u64, current: u64) -> Result<Control> {
        let events = self.os.on_page_directory_change(previous, current);
        self.handle_os_events(events);
        self.finish()
    }

    /// A control transfer classified as a call; `sp` is the stack pointer
    /// after the return address was pushed
    pub fn on_call(&mut self, state: StateId, call_site: u64, function: u64, sp: u64) -> Result<Control> {
        self.native_signal(state, |calls, listener| {
            calls.on_call(state, call_site, function, sp, listener)
        })
    }

    /// Any other write to the stack pointer
    pub fn on_stack_pointer_write(&mut self, state: StateId, sp: u64) -> Result<Control> {
        self.native_signal(state, |calls, listener| calls.on_stack_pointer_write(state, sp, listener))
    }

    pub fn on_basic_block_enter(&mut self, state: StateId, block: BasicBlockInfo) -> Result<Control> {
        self.native_signal(state, |calls, listener| calls.on_basic_block_enter(state, block, listener))
    }

    /// A memory access with concrete address and value
    pub fn on_concrete_memory_access(
        &mut self,
        state: StateId,
        pc: u64,
        address: u64,
        value: u64,
        size: u8,
        is_write: bool,
    ) -> Result<Control> {
        if self.is_tracking() {
            if let Some(tracked) = self.tracked.as_mut() {
                let Some(stack) = tracked.calls.stack(state) else {
                    if self.detector.is_calibrating() {
                        tracing::trace!("{} has no call stack yet, access at {:#x} not recorded", state, pc);
                    }
                    return self.finish();
                };
                let top = stack.top();
                self.detector.on_memory_access(top, pc, address, value, size, is_write);
                let mut high_level = HighLevelDispatch {
                    scheduler: &mut self.scheduler,
                    events: &mut self.pending,
                };
                tracked
                    .interp
                    .on_memory_access(state, top, pc, address, value, is_write, &mut high_level)?;
            }
        }
        self.finish()
    }

    /// A memory access whose address or value is symbolic
    pub fn on_symbolic_memory_access(&mut self, state: StateId, pc: u64, is_write: bool) -> Result<Control> {
        if self.is_tracking() {
            if let Some(tracked) = self.tracked.as_mut() {
                tracked.interp.on_symbolic_memory_access(state, pc, is_write);
            }
        }
        self.finish()
    }

    /// The host forked `parent` into `children`
    pub fn on_state_fork(&mut self, parent: StateId, children: &[StateId]) -> Result<Control> {
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.calls.fork(parent, children);
            tracked.interp.fork(parent, children);
        }
        self.scheduler.on_state_fork(parent, children)?;
        self.finish()
    }

    /// The host destroyed `state`
    pub fn on_state_kill(&mut self, state: StateId) -> Result<Control> {
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.calls.remove(state);
            tracked.interp.remove(state);
        }
        self.scheduler.on_state_kill(state)?;
        self.finish()
    }

    /// The host switched to another context
    pub fn on_state_switch(&mut self, previous: Option<StateId>, next: StateId) -> Result<Control> {
        tracing::trace!("Switching state {:?} -> {}", previous, next);
        self.finish()
    }

    fn native_signal(
        &mut self,
        state: StateId,
        signal: impl FnOnce(&mut CallTracer, &mut dyn CallStackListener) -> Result<()>,
    ) -> Result<Control> {
        if self.is_tracking() {
            if let Some(tracked) = self.tracked.as_mut() {
                let mut dispatch = NativeDispatch {
                    interp: &mut tracked.interp,
                    call_graph: tracked.call_graph.as_mut(),
                    scheduler: &mut self.scheduler,
                    events: &mut self.pending,
                };
                signal(&mut tracked.calls, &mut dispatch)?;
                if tracked.call_graph.is_none() {
                    tracked.call_graph = tracked
                        .calls
                        .stack(state)
                        .map(|stack| CallGraphMonitor::new(state, stack));
                }
            }
        }
        self.finish()
    }

    fn handle_calibration(&mut self, state: StateId, syscall: &GuestSyscall) {
        if !self.is_tracking() {
            tracing::warn!("Calibration syscall {:#x} from {} outside the tracked thread, ignoring", syscall.id, state);
            return;
        }
        match self.detector.handle_syscall(syscall) {
            Some(Ok(params)) => {
                self.pending.push(Event::StructureDetected { params });
                self.set_params(params);
            }
            Some(Err(err)) => self.pending.push(Event::DetectionFailed {
                reason: err.to_string(),
            }),
            None => {}
        }
    }

    fn handle_os_events(&mut self, events: Vec<OsEvent>) {
        for event in events {
            match event {
                OsEvent::ThreadCreated { tid } => self.on_thread_created(tid),
                OsEvent::ThreadExited { tid } => self.on_thread_exited(tid),
                OsEvent::ThreadSwitched { previous, next } => {
                    tracing::debug!("Guest switched thread {:?} -> {}", previous, next);
                }
                OsEvent::PrivilegeChanged { tid, kernel_mode } => {
                    tracing::trace!("Thread {} kernel mode: {}", tid, kernel_mode);
                }
            }
        }
    }

    fn on_thread_created(&mut self, tid: u32) {
        if self.tracked.is_some() {
            return;
        }
        let Some(thread) = self.os.thread(tid) else {
            return;
        };
        if let Some(name) = &self.config.tracked_thread {
            if &thread.name != name {
                return;
            }
        }
        tracing::info!("Tracking thread {}", thread);
        let mut tracked = TrackedThread {
            tid,
            calls: CallTracer::new(thread.stack_top).with_debug(self.config.debug_call_stack),
            interp: InterpreterTracer::new(&self.tracer_config),
            call_graph: None,
        };
        match self.params.filter(|_| self.config.reuse_structure) {
            Some(params) => {
                tracing::info!("Reusing interpreter structure for thread {}", tid);
                tracked.interp.set_params(params, std::iter::empty());
            }
            None => self.scheduler.set_interp_loop_function(None),
        }
        self.tracked = Some(tracked);
    }

    fn on_thread_exited(&mut self, tid: u32) {
        if self.tracked_thread() != Some(tid) {
            return;
        }
        if let Some(tracked) = self.tracked.take() {
            if let Some(graph) = &tracked.call_graph {
                graph.report(TOP_CALLERS);
            }
            if self.detector.is_calibrating() {
                tracing::warn!("Tracked thread {} exited during calibration", tid);
            }
        }
        tracing::info!("Tracked thread {} exited", tid);
    }

    /// Publish everything produced by the last signal
    fn finish(&mut self) -> Result<Control> {
        self.pending
            .extend(self.scheduler.take_events().into_iter().map(Event::from));
        let events = std::mem::take(&mut self.pending);
        for event in &events {
            for observer in &mut self.observers {
                observer.on_event(event);
            }
        }
        Ok(self.scheduler.take_control())
    }
}

impl<H: ExecutionHost> Searcher for Explorer<H> {
    fn select_state(&mut self) -> Option<StateId> {
        self.scheduler.select_state()
    }

    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        self.scheduler.update(current, added, removed);
    }

    fn empty(&self) -> bool {
        self.scheduler.empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_tracer::syscall::{SYSCALL_CALIBRATION_CHECKPOINT, SYSCALL_THREAD_EXIT};
    use path_scheduler::HighLevelEvent;
    use std::cell::RefCell;
    use std::rc::Rc;

    const TID: u32 = 7;
    const ADDRESS_SPACE: u64 = 0x3000;
    const STACK_TOP: u64 = 0x7fff_0000;
    const LOOP: u64 = 0x40_0000;
    const UPDATE: u64 = 0x40_0100;
    const FETCH: u64 = 0x40_0120;
    const HLPC_ADDRESS: u64 = 0x60_1000;
    const BYTECODE: u64 = 0x80_0000;
    const S0: StateId = StateId(0);
    const S1: StateId = StateId(1);

    #[derive(Default)]
    struct MergingHost {
        attempts: usize,
    }

    impl ExecutionHost for MergingHost {
        fn merge(&mut self, _base: StateId, _other: StateId) -> bool {
            self.attempts += 1;
            true
        }
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn thread_start(tid: u32, name: &str) -> GuestSyscall {
        let mut payload = Vec::new();
        payload.extend_from_slice(&tid.to_le_bytes());
        payload.extend_from_slice(&STACK_TOP.to_le_bytes());
        payload.extend_from_slice(&(ADDRESS_SPACE + u64::from(tid)).to_le_bytes());
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        GuestSyscall::with_payload(SYSCALL_THREAD_START, 0, payload)
    }

    /// Announce a thread, schedule it and drop to user mode
    fn run_thread<H: ExecutionHost>(explorer: &mut Explorer<H>, tid: u32, name: &str) {
        explorer.on_custom_instruction(S0, &thread_start(tid, name)).unwrap();
        explorer
            .on_page_directory_change(S0, 0, ADDRESS_SPACE + u64::from(tid))
            .unwrap();
        explorer.on_privilege_change(S0, 0, 3).unwrap();
    }

    fn explorer<H: ExecutionHost>(host: H) -> (Explorer<H>, Rc<RefCell<EventRecorder>>) {
        init_logging();
        let mut explorer = Explorer::new(Config::default(), host).unwrap();
        let recorder = Rc::new(RefCell::new(EventRecorder::new()));
        explorer.add_observer(Box::new(recorder.clone()));
        run_thread(&mut explorer, TID, "python");
        explorer.update(None, &[S0], &[]);
        (explorer, recorder)
    }

    fn params() -> InterpreterStructureParams {
        InterpreterStructureParams {
            interp_loop_function: LOOP,
            hlpc_update_pc: UPDATE,
            instruction_fetch_pc: FETCH,
        }
    }

    fn write_hlpc<H: ExecutionHost>(explorer: &mut Explorer<H>, state: StateId, hlpc: u64) -> Control {
        explorer
            .on_concrete_memory_access(state, UPDATE, HLPC_ADDRESS, hlpc, 8, true)
            .unwrap()
    }

    #[test]
    fn test_follows_announced_thread() {
        let (mut explorer, recorder) = explorer(());
        assert_eq!(explorer.tracked_thread(), Some(TID));

        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        assert_eq!(explorer.call_stack(S0).unwrap().depth(), 2);
        assert_eq!(explorer.call_graph().unwrap().depth(), 2, "The call graph replays the stack");
        assert!(recorder
            .borrow()
            .events()
            .iter()
            .any(|e| matches!(e, Event::FramePush { function, .. } if *function == LOOP)));

        // Kernel-mode execution of the tracked thread is ignored
        explorer.on_privilege_change(S0, 3, 0).unwrap();
        explorer.on_call(S0, 0x40_1010, 0x40_3000, STACK_TOP - 0x200).unwrap();
        assert_eq!(explorer.call_stack(S0).unwrap().depth(), 2);
    }

    #[test]
    fn test_thread_name_filter() {
        init_logging();
        let config = Config::default().with_tracked_thread("python");
        let mut explorer = Explorer::new(config, ()).unwrap();
        run_thread(&mut explorer, 1, "init");
        assert_eq!(explorer.tracked_thread(), None);

        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        assert!(explorer.call_stack(S0).is_none(), "Other threads are not traced");

        run_thread(&mut explorer, TID, "python");
        assert_eq!(explorer.tracked_thread(), Some(TID));
    }

    #[test]
    fn test_calibration_detects_structure() {
        let (mut explorer, recorder) = explorer(());
        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();

        explorer
            .on_custom_instruction(S0, &GuestSyscall::new(SYSCALL_CALIBRATION_START, 0))
            .unwrap();
        for i in 0..12 {
            let hlpc = BYTECODE + i * 3;
            write_hlpc(&mut explorer, S0, hlpc);
            explorer
                .on_concrete_memory_access(S0, FETCH, hlpc, 0x17, 1, false)
                .unwrap();
        }
        explorer
            .on_custom_instruction(S0, &GuestSyscall::new(SYSCALL_CALIBRATION_CHECKPOINT, 12))
            .unwrap();
        explorer
            .on_custom_instruction(S0, &GuestSyscall::new(SYSCALL_CALIBRATION_END, 0))
            .unwrap();

        assert_eq!(explorer.params(), Some(&params()));
        assert!(recorder
            .borrow()
            .events()
            .contains(&Event::StructureDetected { params: params() }));
        assert_eq!(
            explorer.high_level_stack(S0).unwrap().depth(),
            1,
            "The running dispatch loop gets a high-level frame"
        );

        write_hlpc(&mut explorer, S0, BYTECODE + 0x100);
        let created = recorder
            .borrow()
            .events()
            .iter()
            .any(|e| matches!(e, Event::HighLevelStateCreated { state, .. } if *state == S0));
        assert!(created, "The first bytecode PC creates a high-level state");
    }

    #[test]
    fn test_calibration_skips_states_without_call_stack() {
        let (mut explorer, _recorder) = explorer(());
        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        explorer
            .on_custom_instruction(S0, &GuestSyscall::new(SYSCALL_CALIBRATION_START, 0))
            .unwrap();

        let control = explorer
            .on_concrete_memory_access(StateId(7), FETCH, BYTECODE, 0x17, 1, false)
            .unwrap();
        assert_eq!(control, Control::Continue);
        assert_eq!(explorer.calibration_trace().unwrap().len(), 0, "Nothing to attribute the access to");

        explorer
            .on_concrete_memory_access(S0, FETCH, BYTECODE, 0x17, 1, false)
            .unwrap();
        assert_eq!(explorer.calibration_trace().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_calibration_fails() {
        let (mut explorer, recorder) = explorer(());
        for (id, data) in [
            (SYSCALL_CALIBRATION_START, 0),
            (SYSCALL_CALIBRATION_CHECKPOINT, 5),
            (SYSCALL_CALIBRATION_END, 0),
        ] {
            explorer.on_custom_instruction(S0, &GuestSyscall::new(id, data)).unwrap();
        }
        assert!(explorer.params().is_none());
        assert!(recorder
            .borrow()
            .events()
            .iter()
            .any(|e| matches!(e, Event::DetectionFailed { .. })));
    }

    #[test]
    fn test_bytecode_fork_selects_new_path() {
        let (mut explorer, recorder) = explorer(());
        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        explorer.set_params(params());
        write_hlpc(&mut explorer, S0, BYTECODE);

        explorer.on_state_fork(S0, &[S1]).unwrap();
        explorer.update(Some(S0), &[S1], &[]);
        write_hlpc(&mut explorer, S0, BYTECODE + 3);
        write_hlpc(&mut explorer, S1, BYTECODE + 0x20);

        let forked = recorder
            .borrow()
            .events()
            .iter()
            .any(|e| matches!(e, Event::HighLevelStateForked { forks, .. } if forks.len() == 1));
        assert!(forked);
        assert_eq!(explorer.scheduler().executor().high_level_states().count(), 2);
        assert_eq!(explorer.select_state(), Some(S1), "Depth-first follows the newest path");
    }

    #[test]
    fn test_merge_yields_to_scheduler() {
        let (mut explorer, _) = explorer(MergingHost::default());
        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        explorer.set_params(params());
        write_hlpc(&mut explorer, S0, BYTECODE);
        explorer.on_state_fork(S0, &[S1]).unwrap();

        let block = BasicBlockInfo {
            index: 1,
            ..Default::default()
        };
        let mut controls = Vec::new();
        for state in [S0, S1] {
            controls.push(explorer.on_call(state, 0x40_0150, 0x50_0000, STACK_TOP - 0x200).unwrap());
            controls.push(explorer.on_basic_block_enter(state, block).unwrap());
        }

        assert_eq!(explorer.host().attempts, 1);
        assert_eq!(
            controls,
            vec![Control::Continue, Control::Continue, Control::Continue, Control::YieldRequested]
        );
        explorer.on_state_kill(S1).unwrap();
        assert!(!explorer.scheduler().executor().contains(S1));
    }

    #[test]
    fn test_structure_reused_for_new_thread() {
        let (mut explorer, _) = explorer(());
        explorer.set_params(params());
        explorer
            .on_custom_instruction(S0, &GuestSyscall::new(SYSCALL_THREAD_EXIT, u64::from(TID)))
            .unwrap();
        assert_eq!(explorer.tracked_thread(), None);

        run_thread(&mut explorer, 8, "python");
        assert_eq!(explorer.tracked_thread(), Some(8));
        explorer.on_call(S0, 0x40_1000, LOOP, STACK_TOP - 0x100).unwrap();
        assert_eq!(
            explorer.high_level_stack(S0).map(HighLevelStack::depth),
            Some(1),
            "The known dispatch loop is tracked right away"
        );
    }

    #[test]
    fn test_params_persistence() {
        let (mut explorer, _) = explorer(());
        let path = std::env::temp_dir().join(format!("explorer-params-{}.json", std::process::id()));

        let err = explorer.save_params(&path).unwrap_err();
        assert_eq!(err.downcast_ref::<ExplorerError>(), Some(&ExplorerError::NoStructure));

        explorer.set_params(params());
        explorer.save_params(&path).unwrap();

        let (mut other, _) = self::explorer(());
        assert_eq!(other.load_params(&path).unwrap(), params());
        assert_eq!(other.params(), Some(&params()));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_os_syscall_is_ignored() {
        let (mut explorer, _) = explorer(());
        let truncated = GuestSyscall::with_payload(SYSCALL_THREAD_START, 0, vec![1, 2, 3]);
        assert_eq!(explorer.on_custom_instruction(S0, &truncated).unwrap(), Control::Continue);
        assert_eq!(explorer.tracked_thread(), Some(TID));
    }

    #[test]
    fn test_high_level_events_convert() {
        let event: Event = HighLevelEvent::Switched {
            from: None,
            to: Some(path_scheduler::PathId(0)),
        }
        .into();
        assert!(matches!(event, Event::HighLevelStateSwitched { from: None, .. }));
    }
}
