//! Callback Queue: serializes runtime callbacks into a single-consumer pipeline.
//!
//! Runtime callback threads enqueue typed entries, one worker thread drains them.
//! For every entry the worker either resumes the debuggee silently or emits a stop
//! event and waits for the front-end to continue.

mod handler;
mod managed;

pub use managed::ManagedCallbackHandler;

use crate::debugger::error::Error;
use crate::debugger::event::{DebuggerEvent, StoppedEvent};
use crate::debugger::runtime::{
    AppDomain, ExceptionCallbackType, Frame, Process, RuntimeBreakpoint, StepReason, Thread,
};
use crate::debugger::thread::ThreadId;
use crate::debugger::Shared;
use crate::weak_error;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use strum_macros::IntoStaticStr;

/// Work scheduled on the worker while the debuggee is suspended in callback context.
pub type DeferredWork = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// Queue entry.
#[derive(IntoStaticStr)]
pub enum QueueEntry {
    FinishWorker,
    Breakpoint {
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        breakpoint: Arc<dyn RuntimeBreakpoint>,
    },
    StepComplete {
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        reason: StepReason,
    },
    /// User break from debuggee code, or a synthetic one injected by pause.
    Break {
        thread: Option<Arc<dyn Thread>>,
        synthetic: Option<SyntheticBreak>,
    },
    Exception {
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        frame: Option<Arc<dyn Frame>>,
        kind: ExceptionCallbackType,
    },
    CreateProcess {
        process: Arc<dyn Process>,
    },
    Deferred {
        app_domain: Option<Arc<dyn AppDomain>>,
        work: DeferredWork,
    },
}

/// Pause request marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticBreak {
    /// Runtime was stopped by the pause request itself.
    pub stopped_runtime: bool,
    /// Thread reported in the stop event.
    pub thread: ThreadId,
}

/// Handler verdict.
pub(crate) enum Outcome {
    /// Emit a stop event and wait for the front-end.
    Stop(StoppedEvent),
    /// Resume the debuggee.
    Silent,
    /// Debuggee is already resumed (or gone), nothing to do.
    Done,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    stop_event_in_process: bool,
    running: bool,
    pause_requested: bool,
    process_exited: bool,
    finishing: bool,
}

pub(crate) struct QueueShared {
    shared: Arc<Shared>,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("callbacks queue lock poisoned")
    }

    fn push(&self, entry: QueueEntry) -> Result<(), Error> {
        let mut state = self.lock();
        if state.finishing {
            return Err(Error::WorkerUnavailable);
        }
        state.entries.push_back(entry);
        self.cond.notify_all();
        Ok(())
    }

    /// Resume the runtime after a callback, worker side.
    fn continue_silently(&self) {
        let mut state = self.lock();
        if state.process_exited {
            return;
        }
        let Some(process) = self.shared.process() else {
            log::warn!(target: "callback", "continue without process");
            return;
        };
        if weak_error!(process.continue_execution(), "continue:").is_some() {
            state.running = !process.has_queued_callbacks().unwrap_or(false);
        }
    }

    fn on_process_exit(&self, exit_code: i32) {
        {
            let mut state = self.lock();
            if state.process_exited {
                return;
            }
            state.process_exited = true;
            // the finish marker must survive, the worker may already be joined on
            state
                .entries
                .retain(|e| matches!(e, QueueEntry::FinishWorker));
            state.stop_event_in_process = false;
            state.running = false;
            state.pause_requested = false;
            self.cond.notify_all();
        }
        self.shared.frame_ids.invalidate();
        self.shared.sink.emit(DebuggerEvent::Exited { exit_code });
        self.shared.terminate_session();
    }

    fn worker(self: Arc<Self>) {
        log::debug!(target: "callback", "callbacks worker started");
        loop {
            let entry = {
                let mut state = self.lock();
                loop {
                    if let Some(entry) = state.entries.pop_front() {
                        break entry;
                    }
                    if state.finishing {
                        break QueueEntry::FinishWorker;
                    }
                    state = self
                        .cond
                        .wait(state)
                        .expect("callbacks queue lock poisoned");
                }
            };

            if let QueueEntry::FinishWorker = entry {
                break;
            }

            let kind: &'static str = (&entry).into();
            log::trace!(target: "callback", "handle {kind}");
            let outcome = match self.handle(entry) {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!(target: "callback", "{kind} handler: {e:#}");
                    if e.is_fatal() {
                        self.shared.terminate_session();
                        Outcome::Done
                    } else {
                        Outcome::Silent
                    }
                }
            };

            match outcome {
                Outcome::Stop(event) => self.emit_stop_and_wait(event),
                Outcome::Silent => self.continue_silently(),
                Outcome::Done => {}
            }
        }
        log::debug!(target: "callback", "callbacks worker finished");
    }

    fn emit_stop_and_wait(&self, event: StoppedEvent) {
        {
            let mut state = self.lock();
            if state.process_exited || state.finishing {
                return;
            }
            state.stop_event_in_process = true;
            state.pause_requested = false;
            state.running = false;
        }

        self.shared.steppers.disable_all();
        self.shared.set_last_stopped_thread(event.thread_id);
        log::debug!(
            target: "callback",
            "stop: {} on thread {}",
            event.reason,
            event.thread_id
        );
        self.shared.sink.emit(DebuggerEvent::Stopped(event));

        let mut state = self.lock();
        while state.stop_event_in_process && !state.finishing && !state.process_exited {
            state = self
                .cond
                .wait(state)
                .expect("callbacks queue lock poisoned");
        }
    }
}

/// Single-consumer queue of runtime callbacks.
///
/// Dropping the queue enqueues the finish marker and joins the worker,
/// entries behind the marker are dropped.
pub struct CallbacksQueue {
    inner: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl CallbacksQueue {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Self, Error> {
        let inner = Arc::new(QueueShared {
            shared,
            state: Mutex::default(),
            cond: Condvar::new(),
        });
        let worker = std::thread::Builder::new()
            .name("callbacks-worker".to_string())
            .spawn({
                let inner = inner.clone();
                move || inner.worker()
            })?;
        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Enqueue a runtime event, never blocks on the worker.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<(), Error> {
        self.inner.push(entry)
    }

    /// Schedule deferred work on the worker.
    pub fn add_callback_to_queue(
        &self,
        app_domain: Option<Arc<dyn AppDomain>>,
        work: DeferredWork,
    ) -> Result<(), Error> {
        self.inner.push(QueueEntry::Deferred { app_domain, work })
    }

    /// Resume the debuggee after a stop event. No-op if there is no pending stop.
    pub fn continue_process(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();
        if !state.stop_event_in_process || state.process_exited {
            return Ok(());
        }
        let process = self.inner.shared.process().ok_or(Error::ProcessNotStarted)?;
        process.continue_execution()?;

        self.inner.shared.frame_ids.invalidate();
        state.stop_event_in_process = false;
        state.running = !process.has_queued_callbacks().unwrap_or(false);
        // emitted under the queue lock, so the next stop event can't overtake it
        self.inner.shared.sink.emit(DebuggerEvent::Continued {
            thread_id: self.inner.shared.last_stopped_thread(),
            all_threads_continued: true,
        });
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Request a stop, a synthetic break is injected into the queue.
    /// If a real stop event arrives first the synthetic one is discarded.
    pub fn pause(&self, last_stopped_thread: ThreadId) -> Result<(), Error> {
        let mut state = self.inner.lock();
        if state.stop_event_in_process || state.pause_requested || state.process_exited {
            return Ok(());
        }
        let process = self.inner.shared.process().ok_or(Error::ProcessNotStarted)?;

        let stopped_runtime = if state.running {
            process.stop()?;
            state.running = false;
            true
        } else {
            false
        };

        state.pause_requested = true;
        state.entries.push_back(QueueEntry::Break {
            thread: None,
            synthetic: Some(SyntheticBreak {
                stopped_runtime,
                thread: last_stopped_thread,
            }),
        });
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Synchronously stop a running debuggee (before terminate or detach).
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();
        if !state.running || state.process_exited {
            return Ok(());
        }
        let process = self.inner.shared.process().ok_or(Error::ProcessNotStarted)?;
        process.stop()?;
        state.running = false;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// True while a stop event is emitted and not yet continued.
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stop_event_in_process
    }

    /// Mark process as running, called by the launcher once the debuggee is started.
    pub fn set_running(&self) {
        self.inner.lock().running = true;
    }

    /// Process is gone: drop pending entries, release the worker and report the exit.
    pub(crate) fn on_process_exit(&self, exit_code: i32) {
        self.inner.on_process_exit(exit_code)
    }

    /// Callback interface to register in the runtime.
    pub fn managed_callback(&self) -> Arc<ManagedCallbackHandler> {
        Arc::new(ManagedCallbackHandler::new(self.inner.clone()))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }
}

impl Drop for CallbacksQueue {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.entries.push_back(QueueEntry::FinishWorker);
            state.finishing = true;
            self.inner.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!(target: "callback", "callbacks worker panicked");
            }
        }
    }
}
