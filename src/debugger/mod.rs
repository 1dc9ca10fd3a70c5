pub mod breakpoint;
pub mod callback;
pub mod config;
pub mod debuginfo;
mod error;
pub mod event;
pub mod frame;
pub mod runtime;
pub mod step;
pub mod thread;

pub use error::Error;

use crate::debugger::breakpoint::{
    BreakpointEvent, BreakpointView, Breakpoints, ConditionEvaluator, ExceptionBreakMode, ExceptionFilter,
    FunctionBreakpointRequest, LineBreakpointRequest, NoConditions, SourceView,
};
use crate::debugger::callback::CallbacksQueue;
use crate::debugger::config::DebuggerConfig;
use crate::debugger::debuginfo::{DebugInfoRegistry, ModuleView, NoSymbols, SymbolLoader};
use crate::debugger::event::{DebuggerEvent, EventSink};
use crate::debugger::frame::{
    internal_frame_name, walk_frames, FrameType, NativeUnwinder, StackFrameView, WalkFrame,
    NATIVE_FRAMES_NAME,
};
use crate::debugger::runtime::{Frame, ManagedCallback, Process, Thread};
use crate::debugger::step::{StepKind, Steppers};
use crate::debugger::thread::{FrameId, FrameIds, FrameLevel, ThreadId};
use crate::muted_error;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Last exception thrown on a thread, kept for the `exceptionInfo` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: Option<String>,
    pub break_mode: ExceptionBreakMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadView {
    pub id: i64,
    pub name: String,
}

/// Session state shared by the request dispatcher and the callbacks worker.
pub(crate) struct Shared {
    config: DebuggerConfig,
    pub(crate) registry: Arc<DebugInfoRegistry>,
    pub(crate) breakpoints: Arc<Breakpoints>,
    pub(crate) steppers: Steppers,
    pub(crate) frame_ids: FrameIds,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) symbol_loader: Arc<dyn SymbolLoader>,
    pub(crate) native_unwinder: Option<Arc<dyn NativeUnwinder>>,
    pub(crate) process_name: String,
    process: RwLock<Option<Arc<dyn Process>>>,
    exceptions: Mutex<HashMap<ThreadId, ExceptionInfo>>,
    last_stopped_thread: Mutex<ThreadId>,
    terminated: AtomicBool,
}

impl Shared {
    pub(crate) fn process(&self) -> Option<Arc<dyn Process>> {
        self.process.read().expect("process lock poisoned").clone()
    }

    pub(crate) fn set_process(&self, process: Arc<dyn Process>) {
        *self.process.write().expect("process lock poisoned") = Some(process);
    }

    /// Launch configuration with the current Just-My-Code flag.
    pub(crate) fn effective_config(&self) -> DebuggerConfig {
        DebuggerConfig {
            just_my_code: self.breakpoints.just_my_code(),
            ..self.config.clone()
        }
    }

    pub(crate) fn last_stopped_thread(&self) -> ThreadId {
        *self
            .last_stopped_thread
            .lock()
            .expect("last stopped thread lock poisoned")
    }

    pub(crate) fn set_last_stopped_thread(&self, thread: ThreadId) {
        *self
            .last_stopped_thread
            .lock()
            .expect("last stopped thread lock poisoned") = thread;
    }

    pub(crate) fn set_exception_info(&self, thread: ThreadId, info: ExceptionInfo) {
        self.exceptions
            .lock()
            .expect("exceptions lock poisoned")
            .insert(thread, info);
    }

    pub(crate) fn forget_exception_info(&self, thread: ThreadId) {
        self.exceptions
            .lock()
            .expect("exceptions lock poisoned")
            .remove(&thread);
    }

    fn exception_info(&self, thread: ThreadId) -> Option<ExceptionInfo> {
        self.exceptions
            .lock()
            .expect("exceptions lock poisoned")
            .get(&thread)
            .cloned()
    }

    /// Emit `terminated` once per session.
    pub(crate) fn terminate_session(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            log::info!(target: "debugger", "debug session terminated");
            self.sink.emit(DebuggerEvent::Terminated);
        }
    }
}

/// Discards every event, used when no sink is configured.
struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _: DebuggerEvent) {}
}

pub struct DebuggerBuilder {
    config: DebuggerConfig,
    sink: Option<Arc<dyn EventSink>>,
    symbol_loader: Option<Arc<dyn SymbolLoader>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    native_unwinder: Option<Arc<dyn NativeUnwinder>>,
    breakpoints: Option<Arc<Breakpoints>>,
    process_name: String,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            config: DebuggerConfig::default(),
            sink: None,
            symbol_loader: None,
            evaluator: None,
            native_unwinder: None,
            breakpoints: None,
            process_name: String::new(),
        }
    }

    pub fn with_config(self, config: DebuggerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_sink(self, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: Some(sink),
            ..self
        }
    }

    pub fn with_symbol_loader(self, loader: Arc<dyn SymbolLoader>) -> Self {
        Self {
            symbol_loader: Some(loader),
            ..self
        }
    }

    pub fn with_evaluator(self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self {
            evaluator: Some(evaluator),
            ..self
        }
    }

    /// Unwinder is used only if interop debugging is enabled in configuration.
    pub fn with_native_unwinder(self, unwinder: Arc<dyn NativeUnwinder>) -> Self {
        Self {
            native_unwinder: Some(unwinder),
            ..self
        }
    }

    /// Use breakpoints configured before the debugger is created. Their registry
    /// becomes the debugger registry and the evaluator set here is ignored.
    pub fn with_breakpoints(self, breakpoints: Arc<Breakpoints>) -> Self {
        Self {
            breakpoints: Some(breakpoints),
            ..self
        }
    }

    pub fn with_process_name(self, name: impl Into<String>) -> Self {
        Self {
            process_name: name.into(),
            ..self
        }
    }

    /// Create a debugger and start the callbacks worker.
    pub fn build(self) -> Result<Debugger, Error> {
        let breakpoints = match self.breakpoints {
            Some(breakpoints) => {
                breakpoints.apply_config(&self.config);
                breakpoints
            }
            None => {
                let evaluator = self.evaluator.unwrap_or_else(|| Arc::new(NoConditions));
                let registry = Arc::new(DebugInfoRegistry::new());
                Arc::new(Breakpoints::new(registry, evaluator, &self.config))
            }
        };
        let registry = breakpoints.registry().clone();
        let native_unwinder = self
            .native_unwinder
            .filter(|_| self.config.interop_debugging);

        let shared = Arc::new(Shared {
            breakpoints,
            steppers: Steppers::new(registry.clone(), self.config.enable_step_filtering),
            registry,
            frame_ids: FrameIds::default(),
            sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
            symbol_loader: self.symbol_loader.unwrap_or_else(|| Arc::new(NoSymbols)),
            native_unwinder,
            process_name: self.process_name,
            process: RwLock::default(),
            exceptions: Mutex::default(),
            last_stopped_thread: Mutex::new(ThreadId::INVALID),
            terminated: AtomicBool::new(false),
            config: self.config,
        });

        Ok(Debugger {
            queue: CallbacksQueue::new(shared)?,
        })
    }
}

/// Main structure of the debugger back-end, entry point for front-end requests.
///
/// Runtime events come through [`Debugger::managed_callback`], outward events go
/// to the configured [`EventSink`].
pub struct Debugger {
    queue: CallbacksQueue,
}

impl Debugger {
    fn shared(&self) -> &Arc<Shared> {
        self.queue.shared()
    }

    /// Callback interface to register in the runtime.
    pub fn managed_callback(&self) -> Arc<dyn ManagedCallback> {
        self.queue.managed_callback()
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.shared().config
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.shared().breakpoints
    }

    pub fn registry(&self) -> &Arc<DebugInfoRegistry> {
        &self.shared().registry
    }

    pub fn callbacks_queue(&self) -> &CallbacksQueue {
        &self.queue
    }

    /// Bind the debugger to an already running process (attach),
    /// with launch the process comes from the `CreateProcess` callback.
    pub fn set_process(&self, process: Arc<dyn Process>) {
        self.shared().set_process(process);
        self.queue.set_running();
    }

    pub fn modules(&self) -> Vec<ModuleView> {
        self.shared().registry.modules()
    }

    pub fn set_just_my_code(&self, enabled: bool) {
        log::debug!(target: "debugger", "just my code: {enabled}");
        self.shared().breakpoints.set_just_my_code(enabled);
    }

    /// Replace line breakpoints of a source file.
    ///
    /// Return breakpoints in request order and the records created or removed by
    /// this call. A DAP client learns about its own breakpoints from the response,
    /// so changes are not emitted to the sink.
    pub fn set_line_breakpoints(
        &self,
        source_path: &str,
        requests: &[LineBreakpointRequest],
    ) -> Result<(Vec<BreakpointView>, Vec<BreakpointEvent>), Error> {
        self.shared()
            .breakpoints
            .line
            .set_breakpoints(source_path, requests)
    }

    /// Replace function breakpoints, see [`Debugger::set_line_breakpoints`].
    pub fn set_function_breakpoints(
        &self,
        requests: &[FunctionBreakpointRequest],
    ) -> (Vec<BreakpointView>, Vec<BreakpointEvent>) {
        self.shared().breakpoints.function.set_breakpoints(requests)
    }

    pub fn set_exception_breakpoints(
        &self,
        filters: &[(ExceptionFilter, Option<String>)],
    ) -> Vec<BreakpointView> {
        self.shared().breakpoints.exception.set_breakpoints(filters)
    }

    pub fn threads(&self) -> Result<Vec<ThreadView>, Error> {
        let Some(process) = self.shared().process() else {
            return Ok(vec![]);
        };
        let threads = process
            .threads()?
            .into_iter()
            .map(|t| ThreadView {
                id: t.id().into(),
                name: format!("Thread #{}", t.id()),
            })
            .collect();
        Ok(threads)
    }

    fn thread(&self, thread_id: ThreadId) -> Result<Arc<dyn Thread>, Error> {
        let process = self.shared().process().ok_or(Error::ProcessNotStarted)?;
        process
            .threads()?
            .into_iter()
            .find(|t| t.id() == thread_id)
            .ok_or(Error::ThreadNotFound(thread_id))
    }

    /// Return `levels` frames (all if 0) starting from `start` and a total frame count.
    pub fn stack_trace(
        &self,
        thread_id: ThreadId,
        start: usize,
        levels: usize,
    ) -> Result<(Vec<StackFrameView>, usize), Error> {
        if !self.queue.is_stopped() {
            return Err(Error::ProcessRunning);
        }
        let thread = self.thread(thread_id)?;
        let shared = self.shared();
        let end = if levels == 0 {
            usize::MAX
        } else {
            start.saturating_add(levels)
        };

        let mut frames = vec![];
        let mut total = 0;
        walk_frames(
            thread.as_ref(),
            shared.native_unwinder.as_deref(),
            |frame_type, frame| {
                let level = total;
                total += 1;
                if level < start || level >= end {
                    return Ok(ControlFlow::Continue(()));
                }

                let id = shared
                    .frame_ids
                    .encode(thread_id, level as FrameLevel)
                    .as_raw();
                let view = match frame {
                    WalkFrame::Managed(frame) => self.managed_frame_view(id, frame.as_ref()),
                    WalkFrame::Internal(internal) => {
                        StackFrameView::label(id, internal_frame_name(internal.kind), frame_type)
                    }
                    WalkFrame::Native(native) => {
                        let name = native
                            .name
                            .unwrap_or_else(|| format!("{:#016x}", native.ip));
                        StackFrameView::label(id, name, frame_type)
                    }
                    WalkFrame::NativeChain => {
                        StackFrameView::label(id, NATIVE_FRAMES_NAME, frame_type)
                    }
                };
                frames.push(view);
                Ok(ControlFlow::Continue(()))
            },
        )?;

        Ok((frames, total))
    }

    fn managed_frame_view(&self, id: i64, frame: &dyn Frame) -> StackFrameView {
        let registry = &self.shared().registry;
        let function = muted_error!(frame.function());
        let name = function
            .as_ref()
            .and_then(|f| {
                let base = muted_error!(f.module())?.base_address();
                let method = registry
                    .method_name(base, f.token())
                    .or_else(|| muted_error!(f.name()))?;
                Some(match registry.module_name(base) {
                    Some(module) => format!("{module}!{method}"),
                    None => method,
                })
            })
            .unwrap_or_else(|| "[Unknown]".to_string());

        let mut view = StackFrameView::label(id, name, FrameType::ClrManaged);
        view.presentation_hint = None;
        if let Some((_, sp)) = muted_error!(registry.frame_il_and_sequence_point(frame)) {
            view.source = Some(SourceView::new(debuginfo::canonicalize(&sp.document)));
            view.line = sp.start_line;
            view.column = sp.start_column;
            view.end_line = Some(sp.end_line);
            view.end_column = Some(sp.end_column);
        }
        view
    }

    /// Thread and level of a frame id, ids are invalidated on every resume.
    pub fn frame_by_id(&self, id: FrameId) -> Result<(ThreadId, FrameLevel), Error> {
        self.shared()
            .frame_ids
            .decode(id)
            .ok_or(Error::FrameNotFound(id))
    }

    pub fn exception_info(&self, thread_id: ThreadId) -> Option<ExceptionInfo> {
        self.shared().exception_info(thread_id)
    }

    /// Resume the debuggee after a stop event.
    pub fn continue_execution(&self) -> Result<(), Error> {
        self.queue.continue_process()
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.queue.pause(self.shared().last_stopped_thread())
    }

    pub fn step(&self, thread_id: ThreadId, kind: StepKind) -> Result<(), Error> {
        if !self.queue.is_stopped() {
            return Err(Error::ProcessRunning);
        }
        let thread = self.thread(thread_id)?;
        let shared = self.shared();
        shared
            .steppers
            .setup(thread.as_ref(), kind, shared.breakpoints.just_my_code())?;
        self.queue.continue_process()
    }

    /// Kill the debuggee, `exited` and `terminated` follow from the runtime exit callback.
    pub fn terminate(&self) -> Result<(), Error> {
        let Some(process) = self.shared().process() else {
            self.shared().terminate_session();
            return Ok(());
        };
        self.queue.stop()?;
        process.terminate(0)?;
        Ok(())
    }

    /// Detach from the debuggee, every runtime handle is released first.
    pub fn detach(&self) -> Result<(), Error> {
        let shared = self.shared();
        if let Some(process) = shared.process() {
            self.queue.stop()?;
            shared.steppers.disable_all();
            shared.breakpoints.clear();
            process.detach()?;
        }
        shared.terminate_session();
        Ok(())
    }

    pub fn disconnect(&self, terminate_debuggee: bool) -> Result<(), Error> {
        if terminate_debuggee {
            self.terminate()
        } else {
            self.detach()
        }
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        // steppers hold runtime objects, release them before the worker is joined
        self.shared().steppers.disable_all();
    }
}
