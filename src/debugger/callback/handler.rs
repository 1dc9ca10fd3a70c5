use crate::debugger::breakpoint::{ExceptionBreakMode, HitCheck, StopLocation};
use crate::debugger::callback::{Outcome, QueueEntry, QueueShared, SyntheticBreak};
use crate::debugger::error::Error;
use crate::debugger::event::{DebuggerEvent, StopReason, StoppedEvent};
use crate::debugger::runtime::{
    ExceptionCallbackType, Frame, Process, RuntimeBreakpoint, StepReason, Thread,
};
use crate::debugger::step::StepOutcome;
use crate::debugger::thread::ThreadId;
use crate::debugger::ExceptionInfo;
use crate::muted_error;
use std::sync::Arc;

impl QueueShared {
    pub(super) fn handle(&self, entry: QueueEntry) -> Result<Outcome, Error> {
        match entry {
            QueueEntry::FinishWorker => Ok(Outcome::Done),
            QueueEntry::Breakpoint {
                thread, breakpoint, ..
            } => self.on_breakpoint(thread.as_ref(), &breakpoint),
            QueueEntry::StepComplete { thread, reason, .. } => {
                self.on_step_complete(thread.as_ref(), reason)
            }
            QueueEntry::Break {
                synthetic: Some(pause),
                ..
            } => self.on_pause(pause),
            QueueEntry::Break {
                thread: Some(thread),
                synthetic: None,
            } => self.on_user_break(thread.as_ref()),
            QueueEntry::Break {
                thread: None,
                synthetic: None,
            } => Ok(Outcome::Silent),
            QueueEntry::Exception {
                thread, frame, kind, ..
            } => self.on_exception(thread.as_ref(), frame, kind),
            QueueEntry::CreateProcess { process } => self.on_create_process(process),
            QueueEntry::Deferred { work, .. } => {
                work()?;
                Ok(Outcome::Silent)
            }
        }
    }

    fn on_breakpoint(
        &self,
        thread: &dyn Thread,
        breakpoint: &Arc<dyn RuntimeBreakpoint>,
    ) -> Result<Outcome, Error> {
        let tid = thread.id();
        let breakpoints = &self.shared.breakpoints;

        if breakpoints.entry.check_hit(breakpoint) {
            return Ok(Outcome::Stop(StoppedEvent::new(StopReason::Entry, tid)));
        }

        // runtime doesn't suppress breakpoints in non-user code by itself
        if breakpoints.just_my_code() {
            if let Some(frame) = thread.active_frame()? {
                let jmc = muted_error!(frame.function().and_then(|f| f.jmc_status())).flatten();
                if jmc == Some(false) {
                    log::debug!(target: "callback", "breakpoint in non-user code, continue");
                    return Ok(Outcome::Silent);
                }
            }
        }

        match breakpoints.check_breakpoint_hit(thread, breakpoint) {
            HitCheck::Hit(id) => Ok(Outcome::Stop(
                StoppedEvent::new(StopReason::Breakpoint, tid).with_hit_breakpoints(vec![id]),
            )),
            HitCheck::ConditionFailed { id, message } => {
                self.shared.sink.emit(DebuggerEvent::console(format!(
                    "breakpoint {id}: condition evaluation failed, {message}"
                )));
                Ok(Outcome::Silent)
            }
            HitCheck::NoHit => Ok(Outcome::Silent),
        }
    }

    fn on_step_complete(&self, thread: &dyn Thread, reason: StepReason) -> Result<Outcome, Error> {
        let tid = thread.id();
        log::debug!(target: "callback", "step complete on thread {tid} ({reason})");

        match self.shared.steppers.on_step_complete(thread)? {
            StepOutcome::Continue => Ok(Outcome::Silent),
            StepOutcome::Stop => {
                if let Some(location) = stop_location(thread) {
                    self.shared.breakpoints.brk.set_last_step_stop(tid, location);
                }
                Ok(Outcome::Stop(StoppedEvent::new(StopReason::Step, tid)))
            }
        }
    }

    fn on_user_break(&self, thread: &dyn Thread) -> Result<Outcome, Error> {
        let tid = thread.id();
        let location = stop_location(thread);
        let in_user_code = match thread.active_frame()? {
            Some(frame) => self.is_user_frame(frame.as_ref()),
            None => false,
        };

        let breakpoints = &self.shared.breakpoints;
        if breakpoints
            .brk
            .should_skip(tid, location, in_user_code, breakpoints.just_my_code())
        {
            log::debug!(target: "callback", "skip user break on thread {tid}");
            return Ok(Outcome::Silent);
        }

        Ok(Outcome::Stop(
            StoppedEvent::new(StopReason::Pause, tid).with_description("Debugger.Break"),
        ))
    }

    fn on_pause(&self, pause: SyntheticBreak) -> Result<Outcome, Error> {
        let still_requested = self.lock().pause_requested;
        let process = self.shared.process().ok_or(Error::ProcessNotStarted)?;

        if !still_requested {
            // real stop event overtook the pause request
            log::debug!(target: "callback", "discard pause");
            if pause.stopped_runtime {
                process.continue_execution()?;
            }
            return Ok(Outcome::Done);
        }

        if !pause.stopped_runtime {
            process.stop()?;
        }

        let thread = self.pause_thread(process.as_ref(), pause.thread);
        Ok(Outcome::Stop(StoppedEvent::new(StopReason::Pause, thread)))
    }

    /// Thread reported by a pause: last stopped thread if it's still alive, the first one otherwise.
    fn pause_thread(&self, process: &dyn Process, last_stopped: ThreadId) -> ThreadId {
        let threads = muted_error!(process.threads()).unwrap_or_default();
        if last_stopped.is_valid() && threads.iter().any(|t| t.id() == last_stopped) {
            return last_stopped;
        }
        threads
            .first()
            .map(|t| t.id())
            .unwrap_or(ThreadId::ALL_THREADS)
    }

    fn on_exception(
        &self,
        thread: &dyn Thread,
        frame: Option<Arc<dyn Frame>>,
        kind: ExceptionCallbackType,
    ) -> Result<Outcome, Error> {
        let tid = thread.id();
        let exception = muted_error!(thread.current_exception()).flatten();
        let type_name = exception
            .as_ref()
            .map(|e| e.type_name.clone())
            .unwrap_or_else(|| "<unknown>".to_string());

        let handler_in_user_code = match (kind, frame) {
            (ExceptionCallbackType::CatchHandlerFound, Some(frame)) => {
                self.is_user_frame(frame.as_ref())
            }
            _ => false,
        };

        let Some(stop) = self.shared.breakpoints.check_exception(
            tid,
            kind,
            &type_name,
            handler_in_user_code,
        ) else {
            return Ok(Outcome::Silent);
        };

        let description = match stop.break_mode {
            ExceptionBreakMode::Always => format!("Exception thrown: '{type_name}'"),
            ExceptionBreakMode::UserUnhandled => {
                format!("Exception is not handled in user code: '{type_name}'")
            }
            ExceptionBreakMode::Unhandled => format!("Unhandled exception: '{type_name}'"),
        };
        self.shared.set_exception_info(
            tid,
            ExceptionInfo {
                type_name: type_name.clone(),
                message: exception.and_then(|e| e.message),
                break_mode: stop.break_mode,
            },
        );

        Ok(Outcome::Stop(
            StoppedEvent::new(StopReason::Exception, tid)
                .with_text(type_name)
                .with_description(description)
                .with_hit_breakpoints(stop.breakpoint_ids),
        ))
    }

    fn on_create_process(&self, process: Arc<dyn Process>) -> Result<Outcome, Error> {
        log::debug!(target: "callback", "process {} created", process.id());
        self.shared.set_process(process.clone());
        self.shared.sink.emit(DebuggerEvent::Process {
            name: self.shared.process_name.clone(),
            system_process_id: process.id(),
        });
        Ok(Outcome::Silent)
    }

    /// Just-My-Code status of a frame method, symbols are used if runtime doesn't know it.
    fn is_user_frame(&self, frame: &dyn Frame) -> bool {
        let Some(function) = muted_error!(frame.function()) else {
            return false;
        };
        if let Some(Some(status)) = muted_error!(function.jmc_status()) {
            return status;
        }
        muted_error!(function.module())
            .map(|module| {
                self.shared
                    .registry
                    .is_user_method(module.base_address(), function.token())
            })
            .unwrap_or(false)
    }
}

fn stop_location(thread: &dyn Thread) -> Option<StopLocation> {
    let frame = thread.active_frame().ok()??;
    let function = frame.function().ok()?;
    let module = function.module().ok()?;
    let (il_offset, _) = frame.ip().ok()?;
    Some(StopLocation {
        module: module.base_address(),
        token: function.token(),
        il_offset,
    })
}
