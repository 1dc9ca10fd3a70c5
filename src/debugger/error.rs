use crate::debugger::runtime::RuntimeError;
use crate::debugger::thread::{FrameId, ThreadId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no active debuggee process")]
    ProcessNotStarted,
    #[error("debuggee is running, stop it first")]
    ProcessRunning,
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("frame id {0} is unknown or was invalidated by resume")]
    FrameNotFound(FrameId),
    #[error("module at {0:#x} not found")]
    ModuleNotFound(u64),
    #[error("method {0:#010x} not found in symbols")]
    MethodNotFound(u32),
    #[error("no symbols loaded for module {0}")]
    NoSymbols(String),
    #[error("no sequence point for IL offset {0:#x}")]
    NoSequencePoint(u32),
    #[error("no user code in method after IL offset {0:#x}")]
    NoUserCode(u32),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("invalid line number {0}")]
    InvalidLineNumber(i64),
    #[error("breakpoint activation: {0}")]
    BreakpointActivation(RuntimeError),
    #[error("condition `{expr}` evaluation: {message}")]
    ConditionEvaluation { expr: String, message: String },
    #[error("symbol loading for {module}: {message}")]
    SymbolLoading { module: String, message: String },

    // --------------------------------- process/queue errors --------------------------------------
    #[error("debuggee process terminated")]
    ProcessTerminated,
    #[error("callback queue worker is not available")]
    WorkerUnavailable,
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Json(_) => false,
            Error::Runtime(e) => e.is_process_terminated(),
            Error::ProcessNotStarted => false,
            Error::ProcessRunning => false,
            Error::ThreadNotFound(_) => false,
            Error::FrameNotFound(_) => false,
            Error::ModuleNotFound(_) => false,
            Error::MethodNotFound(_) => false,
            Error::NoSymbols(_) => false,
            Error::NoSequencePoint(_) => false,
            Error::NoUserCode(_) => false,
            Error::InvalidLineNumber(_) => false,
            Error::BreakpointActivation(_) => false,
            Error::ConditionEvaluation { .. } => false,
            Error::SymbolLoading { .. } => false,

            // currently fatal errors
            Error::ProcessTerminated => true,
            Error::WorkerUnavailable => true,
            Error::Invariant(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
