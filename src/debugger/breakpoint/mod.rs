//! Breakpoint Engine.
//!
//! Five sibling managers share the [`DebugInfoRegistry`] and the session id allocator:
//! line, function, exception, entry and break (user break) breakpoints.
//! The [`Breakpoints`] facade groups them for the callback queue and the request dispatcher.

mod brk;
mod entry;
mod exception;
mod function;
mod line;

pub use brk::{BreakBreakpoint, StopLocation};
pub use entry::EntryBreakpoint;
pub use exception::{
    ExceptionBreakMode, ExceptionBreakpoints, ExceptionCondition, ExceptionFilter, ExceptionStop,
};
pub use function::{FunctionBreakpointRequest, FunctionBreakpoints};
pub use line::{LineBreakpointRequest, LineBreakpoints};

use crate::debugger::config::DebuggerConfig;
use crate::debugger::debuginfo::DebugInfoRegistry;
use crate::debugger::error::Error;
use crate::debugger::event::{ChangeReason, DebuggerEvent};
use crate::debugger::runtime::{
    ExceptionCallbackType, HandleKey, ModuleAddress, RuntimeBreakpoint, Thread,
};
use crate::debugger::thread::ThreadId;
use crate::weak_error;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Monotonic allocator of user visible breakpoint ids, ids are never reused within a session.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

impl IdAllocator {
    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Owned runtime breakpoint, deactivated when dropped.
pub struct BreakpointHandle {
    handle: Arc<dyn RuntimeBreakpoint>,
}

impl BreakpointHandle {
    /// Take ownership of a fresh runtime breakpoint and activate it.
    pub fn activate(handle: Arc<dyn RuntimeBreakpoint>) -> Result<Self, Error> {
        handle.activate(true).map_err(Error::BreakpointActivation)?;
        Ok(Self { handle })
    }

    pub fn key(&self) -> HandleKey {
        HandleKey::of(&self.handle)
    }
}

impl Drop for BreakpointHandle {
    fn drop(&mut self) {
        weak_error!(self.handle.activate(false), "deactivate breakpoint:");
    }
}

/// Expression evaluation collaborator, used for conditional breakpoints.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `expression` in the context of thread active frame.
    fn evaluate(&self, thread: &dyn Thread, expression: &str) -> Result<bool, Error>;
}

/// Evaluator for sessions without expression support, every condition fails to evaluate.
pub struct NoConditions;

impl ConditionEvaluator for NoConditions {
    fn evaluate(&self, _: &dyn Thread, expression: &str) -> Result<bool, Error> {
        Err(Error::ConditionEvaluation {
            expr: expression.to_string(),
            message: "expression evaluation is not supported".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
}

impl SourceView {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        Self { name, path }
    }
}

/// Breakpoint state as it shown to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointView {
    pub id: u32,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(skip)]
    pub hit_count: u32,
}

impl BreakpointView {
    fn pending(id: u32, line: Option<u32>, message: Option<String>) -> Self {
        Self {
            id,
            verified: false,
            message,
            source: None,
            line,
            end_line: None,
            hit_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointEvent {
    pub reason: ChangeReason,
    pub breakpoint: BreakpointView,
}

impl BreakpointEvent {
    fn new(reason: ChangeReason, breakpoint: BreakpointView) -> Self {
        Self { reason, breakpoint }
    }
}

impl From<BreakpointEvent> for DebuggerEvent {
    fn from(event: BreakpointEvent) -> Self {
        DebuggerEvent::Breakpoint {
            reason: event.reason,
            breakpoint: event.breakpoint,
        }
    }
}

/// Result of a line or function breakpoint hit classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitCheck {
    /// Handle belongs to a record and its condition (if any) holds.
    Hit(u32),
    NoHit,
    /// Handle belongs to a record but condition evaluation failed, treated as no-hit.
    ConditionFailed { id: u32, message: String },
}

/// All breakpoint managers of a debug session.
pub struct Breakpoints {
    pub line: LineBreakpoints,
    pub function: FunctionBreakpoints,
    pub exception: ExceptionBreakpoints,
    pub entry: EntryBreakpoint,
    pub brk: BreakBreakpoint,
    just_my_code: AtomicBool,
    evaluator: Arc<dyn ConditionEvaluator>,
    registry: Arc<DebugInfoRegistry>,
}

impl Breakpoints {
    pub fn new(
        registry: Arc<DebugInfoRegistry>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: &DebuggerConfig,
    ) -> Self {
        let ids = Arc::new(IdAllocator::default());
        Self {
            line: LineBreakpoints::new(registry.clone(), ids.clone()),
            function: FunctionBreakpoints::new(registry.clone(), ids.clone()),
            exception: ExceptionBreakpoints::new(ids),
            entry: EntryBreakpoint::new(registry.clone(), config.stop_at_entry),
            brk: BreakBreakpoint::default(),
            just_my_code: AtomicBool::new(config.just_my_code),
            evaluator,
            registry,
        }
    }

    /// Registry the records are resolved against.
    pub fn registry(&self) -> &Arc<DebugInfoRegistry> {
        &self.registry
    }

    /// Take launch options of an engine created before the launch request.
    pub fn apply_config(&self, config: &DebuggerConfig) {
        self.set_just_my_code(config.just_my_code);
        self.entry.set_enabled(config.stop_at_entry);
    }

    pub fn just_my_code(&self) -> bool {
        self.just_my_code.load(Ordering::Acquire)
    }

    pub fn set_just_my_code(&self, enabled: bool) {
        self.just_my_code.store(enabled, Ordering::Release);
    }

    /// Re-try pending records against a freshly loaded module and arm the entry breakpoint.
    pub fn on_module_load(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        weak_error!(self.entry.try_arm(base), "arm entry breakpoint:");
        let mut events = self.line.on_module_load(base);
        events.extend(self.function.on_module_load(base));
        events
    }

    /// Release every runtime handle bound to an unloaded module.
    pub fn on_module_unload(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        self.entry.on_module_unload(base);
        let mut events = self.line.on_module_unload(base);
        events.extend(self.function.on_module_unload(base));
        events
    }

    /// Release every runtime handle, used before detach.
    pub fn clear(&self) {
        self.line.clear();
        self.function.clear();
        self.entry.disable();
    }

    pub fn on_thread_exit(&self, thread: ThreadId) {
        self.exception.reset_thread(thread);
        self.brk.forget_thread(thread);
    }

    /// Ask line then function breakpoints whether the handle belongs to them
    /// and evaluate an attached condition.
    pub fn check_breakpoint_hit(
        &self,
        thread: &dyn Thread,
        handle: &Arc<dyn RuntimeBreakpoint>,
    ) -> HitCheck {
        let key = HandleKey::of(handle);
        match self.line.check_hit(thread, key, self.evaluator.as_ref()) {
            HitCheck::NoHit => self
                .function
                .check_hit(thread, key, self.evaluator.as_ref()),
            hit => hit,
        }
    }

    /// Decide whether an exception callback stops the debuggee.
    pub fn check_exception(
        &self,
        thread: ThreadId,
        kind: ExceptionCallbackType,
        type_name: &str,
        handler_in_user_code: bool,
    ) -> Option<ExceptionStop> {
        self.exception.on_exception(
            thread,
            kind,
            type_name,
            handler_in_user_code,
            self.just_my_code(),
        )
    }
}
