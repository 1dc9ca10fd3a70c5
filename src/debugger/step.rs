use crate::debugger::debuginfo::DebugInfoRegistry;
use crate::debugger::error::Error;
use crate::debugger::runtime::{Stepper, Thread};
use crate::debugger::thread::ThreadId;
use crate::weak_error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StepKind {
    Over,
    In,
    Out,
}

/// What to do with a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step ends at a user visible location.
    Stop,
    /// Stepper is re-armed, debuggee must continue silently.
    Continue,
}

struct ActiveStep {
    kind: StepKind,
    just_my_code: bool,
    stepper: Box<dyn Stepper>,
    /// Thread steps out of a filtered method (property accessor or operator),
    /// step in again when it returns.
    filtered_out: bool,
}

/// Per thread runtime steppers.
pub struct Steppers {
    registry: Arc<DebugInfoRegistry>,
    step_filtering: bool,
    active: Mutex<HashMap<ThreadId, ActiveStep>>,
}

/// True for property accessors and operator implementations.
fn is_filtered_name(qualified_name: &str) -> bool {
    let method = qualified_name.rsplit('.').next().unwrap_or(qualified_name);
    method.starts_with("get_") || method.starts_with("set_") || method.starts_with("op_")
}

impl Steppers {
    pub fn new(registry: Arc<DebugInfoRegistry>, step_filtering: bool) -> Self {
        Self {
            registry,
            step_filtering,
            active: Mutex::default(),
        }
    }

    /// Create and arm a stepper for a thread, steppers of other threads are disabled.
    pub fn setup(&self, thread: &dyn Thread, kind: StepKind, just_my_code: bool) -> Result<(), Error> {
        self.disable_all();
        let stepper = self.arm(thread, kind, just_my_code)?;
        log::debug!(target: "debugger", "thread {} step {kind}", thread.id());
        self.active
            .lock()
            .expect("steppers lock poisoned")
            .insert(
                thread.id(),
                ActiveStep {
                    kind,
                    just_my_code,
                    stepper,
                    filtered_out: false,
                },
            );
        Ok(())
    }

    fn arm(
        &self,
        thread: &dyn Thread,
        kind: StepKind,
        just_my_code: bool,
    ) -> Result<Box<dyn Stepper>, Error> {
        let mut stepper = thread.create_stepper()?;
        stepper.set_jmc(just_my_code)?;
        match kind {
            StepKind::Out => stepper.step_out()?,
            StepKind::Over | StepKind::In => {
                let step_in = kind == StepKind::In;
                match self.registry.step_range_from_current_ip(thread) {
                    Ok(range) => stepper.step_range(step_in, &[range])?,
                    Err(e) => {
                        log::debug!(target: "debugger", "no step range, use plain step: {e:#}");
                        stepper.step(step_in)?
                    }
                }
            }
        }
        Ok(stepper)
    }

    /// Decide whether a completed step stops the debuggee, re-arm stepper otherwise.
    pub fn on_step_complete(&self, thread: &dyn Thread) -> Result<StepOutcome, Error> {
        let Some(step) = self
            .active
            .lock()
            .expect("steppers lock poisoned")
            .remove(&thread.id())
        else {
            return Ok(StepOutcome::Stop);
        };
        let Some(frame) = thread.active_frame()? else {
            return Ok(StepOutcome::Stop);
        };

        let rearm = |kind: StepKind, filtered_out: bool| -> Result<StepOutcome, Error> {
            let stepper = self.arm(thread, kind, step.just_my_code)?;
            self.active.lock().expect("steppers lock poisoned").insert(
                thread.id(),
                ActiveStep {
                    kind: if filtered_out { step.kind } else { kind },
                    just_my_code: step.just_my_code,
                    stepper,
                    filtered_out,
                },
            );
            Ok(StepOutcome::Continue)
        };

        if step.filtered_out {
            return rearm(StepKind::In, false);
        }

        let function = frame.function()?;
        let base = function.module()?.base_address();
        let token = function.token();

        if self.step_filtering && step.kind == StepKind::In {
            let filtered = self
                .registry
                .method_name(base, token)
                .map(|name| is_filtered_name(&name))
                .unwrap_or(false);
            if filtered {
                log::debug!(target: "debugger", "step over filtered method {token}");
                return rearm(StepKind::Out, true);
            }
        }

        if self.registry.is_user_code_location(frame.as_ref())? {
            return Ok(StepOutcome::Stop);
        }

        let (il, _) = frame.ip()?;
        match self
            .registry
            .next_user_code_il_offset_in_method(base, token, il)
        {
            Ok(_) => {
                let kind = if step.kind == StepKind::In {
                    StepKind::In
                } else {
                    StepKind::Over
                };
                rearm(kind, false)
            }
            Err(e) => {
                log::debug!(target: "debugger", "step out, no user code ahead: {e:#}");
                rearm(StepKind::Out, false)
            }
        }
    }

    /// Deactivate every stepper, called when any stop event is emitted.
    pub fn disable_all(&self) {
        let mut active = self.active.lock().expect("steppers lock poisoned");
        for (_, mut step) in active.drain() {
            weak_error!(step.stepper.deactivate(), "deactivate stepper:");
        }
    }

    pub fn is_stepping(&self, thread: ThreadId) -> bool {
        self.active
            .lock()
            .expect("steppers lock poisoned")
            .contains_key(&thread)
    }
}
