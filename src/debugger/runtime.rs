//! Contract of the managed runtime inspection API.
//!
//! The runtime exposes a COM-style object graph (process, app-domain, thread, frame,
//! stack walker, function, module, breakpoint). This module describes the part of the
//! graph consumed by the debugger as a set of object-safe traits, and the callback
//! interface ([`ManagedCallback`]) the runtime invokes on its own threads.

use crate::debugger::error::Error;
use crate::debugger::thread::ThreadId;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use strum_macros::Display;
use uuid::Uuid;

/// Status code returned by runtime calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_NOTIMPL: HResult = HResult(0x8000_4001_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);
    pub const CORDBG_E_PROCESS_TERMINATED: HResult = HResult(0x8013_1301_u32 as i32);
    pub const CORDBG_E_UNABLE_TO_SET_BREAKPOINT: HResult = HResult(0x8013_1330_u32 as i32);
    pub const CORDBG_E_CODE_NOT_AVAILABLE: HResult = HResult(0x8013_1c04_u32 as i32);

    pub fn succeeded(self) -> bool {
        self.0 >= 0
    }

    pub fn failed(self) -> bool {
        !self.succeeded()
    }

    /// Convert a callback handler result into a status code returned to the runtime.
    ///
    /// Only `S_OK` or a failure code can leave a callback. Success-like codes (`S_FALSE`
    /// and friends) are interpreted by the runtime as "callback processed, stop event
    /// emitted", so they never pass through.
    pub fn from_callback_result(result: Result<(), Error>) -> HResult {
        match result {
            Ok(()) => HResult::S_OK,
            Err(Error::Runtime(RuntimeError(hr))) if hr.failed() => hr,
            Err(_) => HResult::E_FAIL,
        }
    }
}

impl Display for HResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// Failed runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("runtime call failed with {0}")]
pub struct RuntimeError(pub HResult);

impl RuntimeError {
    pub fn is_process_terminated(&self) -> bool {
        self.0 == HResult::CORDBG_E_PROCESS_TERMINATED
    }
}

impl From<HResult> for RuntimeError {
    fn from(hr: HResult) -> Self {
        RuntimeError(hr)
    }
}

pub type RtResult<T> = Result<T, RuntimeError>;

/// Module base address, the runtime's identity of a loaded module.
pub type ModuleAddress = u64;

/// Byte offset into a method's IL.
pub type IlOffset = u32;

/// Metadata token of a method definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize)]
pub struct MethodToken(pub u32);

impl Display for MethodToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Half-open IL range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IlRange {
    pub start: IlOffset,
    pub end: IlOffset,
}

impl IlRange {
    pub fn contains(&self, offset: IlOffset) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Register subset used by the stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuContext {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StepReason {
    Normal,
    Return,
    Call,
    ExceptionFilter,
    ExceptionHandler,
    Intercept,
    Exit,
}

/// Phase of an in-flight exception reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionCallbackType {
    FirstChance,
    UserFirstChance,
    CatchHandlerFound,
    UserCatchHandlerFound,
    Unhandled,
}

/// Runtime-owned transition or stub frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InternalFrameType {
    None,
    M2U,
    U2M,
    AppDomainTransition,
    LightweightFunction,
    FuncEval,
    InternalCall,
    ClassInit,
    Exception,
    Security,
    JitCompilation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalFrame {
    pub kind: InternalFrameType,
    /// Stack address of the frame, smaller values are closer to the leaf.
    pub address: u64,
}

/// Result of a native IP to IL offset mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MappingResult {
    Prolog,
    Epilog,
    NoInfo,
    UnmappedAddress,
    Exact,
    Approximate,
}

/// What the stack walker points to at the current step.
pub enum WalkPosition {
    Managed(Arc<dyn Frame>),
    /// Native (unmanaged) code, the walker can't unwind through it by itself.
    Native,
    /// Runtime native code that the walker unwinds on its own.
    RuntimeUnwindable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionObject {
    pub type_name: String,
    pub message: Option<String>,
}

pub trait Process: Send + Sync {
    fn id(&self) -> u32;
    /// Resume the process after a callback or `stop`.
    fn continue_execution(&self) -> RtResult<()>;
    /// Synchronously suspend all managed threads.
    fn stop(&self) -> RtResult<()>;
    fn terminate(&self, exit_code: u32) -> RtResult<()>;
    fn detach(&self) -> RtResult<()>;
    /// True if the runtime will deliver more callbacks after the next continue
    /// without letting the debuggee run.
    fn has_queued_callbacks(&self) -> RtResult<bool>;
    fn threads(&self) -> RtResult<Vec<Arc<dyn Thread>>>;
    fn app_domains(&self) -> RtResult<Vec<Arc<dyn AppDomain>>>;
    fn exit_code(&self) -> RtResult<i32>;
}

pub trait AppDomain: Send + Sync {
    fn id(&self) -> u32;
    fn breakpoints(&self) -> RtResult<Vec<Arc<dyn RuntimeBreakpoint>>>;
}

pub trait Thread: Send + Sync {
    fn id(&self) -> ThreadId;
    fn active_frame(&self) -> RtResult<Option<Arc<dyn Frame>>>;
    fn create_stack_walk(&self) -> RtResult<Box<dyn StackWalk>>;
    fn active_internal_frames(&self) -> RtResult<Vec<InternalFrame>>;
    fn create_stepper(&self) -> RtResult<Box<dyn Stepper>>;
    fn current_exception(&self) -> RtResult<Option<ExceptionObject>>;
}

pub trait Frame: Send + Sync {
    fn function(&self) -> RtResult<Arc<dyn Function>>;
    fn ip(&self) -> RtResult<(IlOffset, MappingResult)>;
}

pub trait StackWalk {
    fn position(&self) -> RtResult<WalkPosition>;
    fn context(&self) -> RtResult<CpuContext>;
    fn set_context(&mut self, context: CpuContext) -> RtResult<()>;
    /// Move to the caller frame, return `false` at the end of stack.
    fn next(&mut self) -> RtResult<bool>;
}

pub trait Function: Send + Sync {
    fn token(&self) -> MethodToken;
    fn module(&self) -> RtResult<Arc<dyn Module>>;
    fn name(&self) -> RtResult<String>;
    fn create_breakpoint(&self, il_offset: IlOffset) -> RtResult<Arc<dyn RuntimeBreakpoint>>;
    /// Just-My-Code status, `None` if runtime doesn't expose it.
    fn jmc_status(&self) -> RtResult<Option<bool>>;
}

pub trait Module: Send + Sync {
    fn base_address(&self) -> ModuleAddress;
    /// Full path of module file.
    fn path(&self) -> RtResult<String>;
    fn mvid(&self) -> RtResult<Uuid>;
    fn is_dynamic(&self) -> bool;
    fn function(&self, token: MethodToken) -> RtResult<Arc<dyn Function>>;
    /// Mark whole module as user (or non-user) code except listed methods
    /// that get the opposite status.
    fn set_jmc_status(&self, is_user_code: bool, exceptions: &[MethodToken]) -> RtResult<()>;
}

pub trait RuntimeBreakpoint: Send + Sync {
    fn activate(&self, active: bool) -> RtResult<()>;
    fn is_active(&self) -> RtResult<bool>;
}

pub trait Stepper: Send {
    fn set_jmc(&mut self, enabled: bool) -> RtResult<()>;
    fn step_range(&mut self, step_in: bool, ranges: &[IlRange]) -> RtResult<()>;
    fn step(&mut self, step_in: bool) -> RtResult<()>;
    fn step_out(&mut self) -> RtResult<()>;
    fn deactivate(&mut self) -> RtResult<()>;
}

/// Identity of a runtime breakpoint handle, the handle's pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey(usize);

impl HandleKey {
    pub fn of(handle: &Arc<dyn RuntimeBreakpoint>) -> Self {
        HandleKey(Arc::as_ptr(handle) as *const () as usize)
    }
}

/// Callbacks invoked by the runtime on its own threads.
///
/// While a callback is in progress (and until the debugger calls
/// [`Process::continue_execution`]) the debuggee is suspended.
pub trait ManagedCallback: Send + Sync {
    fn create_process(&self, process: Arc<dyn Process>) -> HResult;
    fn exit_process(&self, process: Arc<dyn Process>) -> HResult;
    fn create_thread(&self, app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult;
    fn exit_thread(&self, app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult;
    fn load_module(&self, app_domain: Arc<dyn AppDomain>, module: Arc<dyn Module>) -> HResult;
    fn unload_module(&self, app_domain: Arc<dyn AppDomain>, module: Arc<dyn Module>) -> HResult;
    fn breakpoint(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        breakpoint: Arc<dyn RuntimeBreakpoint>,
    ) -> HResult;
    fn step_complete(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        reason: StepReason,
    ) -> HResult;
    fn user_break(&self, app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult;
    fn exception(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        frame: Option<Arc<dyn Frame>>,
        kind: ExceptionCallbackType,
    ) -> HResult;
}
