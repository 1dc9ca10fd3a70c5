use crate::debugger::runtime::{IlOffset, MethodToken, ModuleAddress};
use crate::debugger::thread::ThreadId;
use std::collections::HashMap;
use std::sync::Mutex;

/// Code location of a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopLocation {
    pub module: ModuleAddress,
    pub token: MethodToken,
    pub il_offset: IlOffset,
}

/// Filter for user break callbacks (`Debugger.Break()` in debuggee code).
#[derive(Default)]
pub struct BreakBreakpoint {
    last_step_stops: Mutex<HashMap<ThreadId, StopLocation>>,
}

impl BreakBreakpoint {
    /// Remember where a step stop happens on the thread.
    pub fn set_last_step_stop(&self, thread: ThreadId, location: StopLocation) {
        self.last_step_stops
            .lock()
            .expect("break breakpoint lock poisoned")
            .insert(thread, location);
    }

    pub fn clear_last_step_stops(&self) {
        self.last_step_stops
            .lock()
            .expect("break breakpoint lock poisoned")
            .clear();
    }

    pub fn forget_thread(&self, thread: ThreadId) {
        self.last_step_stops
            .lock()
            .expect("break breakpoint lock poisoned")
            .remove(&thread);
    }

    /// Return true if a user break must be ignored: it is raised from non-user code
    /// while Just-My-Code is on, or the thread already stopped at this location by a step.
    pub fn should_skip(
        &self,
        thread: ThreadId,
        location: Option<StopLocation>,
        in_user_code: bool,
        just_my_code: bool,
    ) -> bool {
        if just_my_code && !in_user_code {
            return true;
        }
        let stops = self
            .last_step_stops
            .lock()
            .expect("break breakpoint lock poisoned");
        match (location, stops.get(&thread)) {
            (Some(location), Some(last)) => location == *last,
            _ => false,
        }
    }
}
