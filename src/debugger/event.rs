//! Events emitted by the debugger core toward the front-end.

use crate::debugger::breakpoint::BreakpointView;
use crate::debugger::debuginfo::ModuleView;
use crate::debugger::thread::ThreadId;
use serde::Serialize;
use strum_macros::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StopReason {
    Step,
    Breakpoint,
    Exception,
    Pause,
    Entry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedEvent {
    pub reason: StopReason,
    pub thread_id: ThreadId,
    pub text: Option<String>,
    pub description: Option<String>,
    pub hit_breakpoint_ids: Vec<u32>,
    pub all_threads_stopped: bool,
}

impl StoppedEvent {
    pub fn new(reason: StopReason, thread_id: ThreadId) -> Self {
        Self {
            reason,
            thread_id,
            text: None,
            description: None,
            hit_breakpoint_ids: vec![],
            all_threads_stopped: true,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_hit_breakpoints(mut self, ids: Vec<u32>) -> Self {
        self.hit_breakpoint_ids = ids;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ChangeReason {
    New,
    Changed,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ThreadReason {
    Started,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OutputCategory {
    Console,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEvent {
    Initialized,
    Process {
        name: String,
        system_process_id: u32,
    },
    Stopped(StoppedEvent),
    Continued {
        thread_id: ThreadId,
        all_threads_continued: bool,
    },
    Thread {
        reason: ThreadReason,
        thread_id: ThreadId,
    },
    Module {
        reason: ChangeReason,
        module: ModuleView,
    },
    Breakpoint {
        reason: ChangeReason,
        breakpoint: BreakpointView,
    },
    Output {
        category: OutputCategory,
        output: String,
        source: Option<String>,
        line: Option<u32>,
    },
    Exited {
        exit_code: i32,
    },
    Terminated,
}

impl DebuggerEvent {
    pub fn console(output: impl Into<String>) -> Self {
        let mut output = output.into();
        if !output.ends_with('\n') {
            output.push('\n');
        }
        DebuggerEvent::Output {
            category: OutputCategory::Console,
            output,
            source: None,
            line: None,
        }
    }
}

/// Receiver of outward events, implemented by the DAP output channel.
///
/// Implementations must serialize concurrent `emit` calls so that events never interleave.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DebuggerEvent);
}
