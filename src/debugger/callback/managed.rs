use crate::debugger::callback::{QueueEntry, QueueShared};
use crate::debugger::error::Error;
use crate::debugger::event::{ChangeReason, DebuggerEvent, ThreadReason};
use crate::debugger::runtime::{
    AppDomain, ExceptionCallbackType, Frame, HResult, ManagedCallback, Module, Process,
    RuntimeBreakpoint, StepReason, Thread,
};
use crate::debugger::Shared;
use crate::weak_error;
use std::sync::Arc;

/// Runtime callback interface, every callback is turned into a queue entry.
///
/// Callbacks return as soon as the entry is queued, the debuggee stays suspended
/// until the worker resumes it.
pub struct ManagedCallbackHandler {
    queue: Arc<QueueShared>,
}

impl ManagedCallbackHandler {
    pub(super) fn new(queue: Arc<QueueShared>) -> Self {
        Self { queue }
    }

    fn defer(
        &self,
        app_domain: Option<Arc<dyn AppDomain>>,
        work: impl FnOnce(&Shared) -> Result<(), Error> + Send + 'static,
    ) -> HResult {
        let shared = self.queue.shared.clone();
        let queued = self.queue.push(QueueEntry::Deferred {
            app_domain,
            work: Box::new(move || work(&shared)),
        });
        HResult::from_callback_result(queued)
    }
}

impl ManagedCallback for ManagedCallbackHandler {
    fn create_process(&self, process: Arc<dyn Process>) -> HResult {
        HResult::from_callback_result(self.queue.push(QueueEntry::CreateProcess { process }))
    }

    fn exit_process(&self, process: Arc<dyn Process>) -> HResult {
        let exit_code = weak_error!(process.exit_code(), "process exit code:").unwrap_or(0);
        log::debug!(target: "callback", "process {} exited with {exit_code}", process.id());
        self.queue.on_process_exit(exit_code);
        HResult::S_OK
    }

    fn create_thread(&self, app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult {
        self.defer(Some(app_domain), move |shared| {
            shared.sink.emit(DebuggerEvent::Thread {
                reason: ThreadReason::Started,
                thread_id: thread.id(),
            });
            Ok(())
        })
    }

    fn exit_thread(&self, app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult {
        self.defer(Some(app_domain), move |shared| {
            let tid = thread.id();
            shared.breakpoints.on_thread_exit(tid);
            shared.forget_exception_info(tid);
            shared.sink.emit(DebuggerEvent::Thread {
                reason: ThreadReason::Exited,
                thread_id: tid,
            });
            Ok(())
        })
    }

    fn load_module(&self, app_domain: Arc<dyn AppDomain>, module: Arc<dyn Module>) -> HResult {
        self.defer(Some(app_domain), move |shared| {
            let config = shared.effective_config();
            let view = shared
                .registry
                .add_module(module, shared.symbol_loader.as_ref(), &config);
            let base = view.base_address;
            shared.sink.emit(DebuggerEvent::Module {
                reason: ChangeReason::New,
                module: view,
            });
            for event in shared.breakpoints.on_module_load(base) {
                shared.sink.emit(event.into());
            }
            Ok(())
        })
    }

    fn unload_module(&self, app_domain: Arc<dyn AppDomain>, module: Arc<dyn Module>) -> HResult {
        self.defer(Some(app_domain), move |shared| {
            let base = module.base_address();
            // handles must be released while module is still registered
            let events = shared.breakpoints.on_module_unload(base);
            if let Some(view) = shared.registry.remove_module(base) {
                shared.sink.emit(DebuggerEvent::Module {
                    reason: ChangeReason::Removed,
                    module: view,
                });
            }
            for event in events {
                shared.sink.emit(event.into());
            }
            Ok(())
        })
    }

    fn breakpoint(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        breakpoint: Arc<dyn RuntimeBreakpoint>,
    ) -> HResult {
        HResult::from_callback_result(self.queue.push(QueueEntry::Breakpoint {
            app_domain,
            thread,
            breakpoint,
        }))
    }

    fn step_complete(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        reason: StepReason,
    ) -> HResult {
        HResult::from_callback_result(self.queue.push(QueueEntry::StepComplete {
            app_domain,
            thread,
            reason,
        }))
    }

    fn user_break(&self, _app_domain: Arc<dyn AppDomain>, thread: Arc<dyn Thread>) -> HResult {
        HResult::from_callback_result(self.queue.push(QueueEntry::Break {
            thread: Some(thread),
            synthetic: None,
        }))
    }

    fn exception(
        &self,
        app_domain: Arc<dyn AppDomain>,
        thread: Arc<dyn Thread>,
        frame: Option<Arc<dyn Frame>>,
        kind: ExceptionCallbackType,
    ) -> HResult {
        HResult::from_callback_result(self.queue.push(QueueEntry::Exception {
            app_domain,
            thread,
            frame,
            kind,
        }))
    }
}
