use crate::debugger::breakpoint::BreakpointHandle;
use crate::debugger::debuginfo::DebugInfoRegistry;
use crate::debugger::error::Error;
use crate::debugger::runtime::{HandleKey, ModuleAddress, RuntimeBreakpoint};
use std::mem;
use std::sync::{Arc, Mutex};

enum EntryState {
    /// Stop at entry is not requested.
    Disabled,
    /// Waiting for a module with the managed entry point.
    Waiting,
    Armed {
        module: ModuleAddress,
        handle: BreakpointHandle,
    },
    /// One-shot breakpoint already fired, handle is released.
    Fired,
}

/// Singleton breakpoint at the managed entry point.
pub struct EntryBreakpoint {
    registry: Arc<DebugInfoRegistry>,
    state: Mutex<EntryState>,
}

impl EntryBreakpoint {
    pub fn new(registry: Arc<DebugInfoRegistry>, enabled: bool) -> Self {
        let state = if enabled {
            EntryState::Waiting
        } else {
            EntryState::Disabled
        };
        Self {
            registry,
            state: Mutex::new(state),
        }
    }

    /// Arm the breakpoint if module contains the entry point.
    pub fn try_arm(&self, base: ModuleAddress) -> Result<(), Error> {
        let mut state = self.state.lock().expect("entry breakpoint lock poisoned");
        if !matches!(*state, EntryState::Waiting) {
            return Ok(());
        }
        let Some(entry) = self.registry.entry_point(base) else {
            return Ok(());
        };

        let function = entry.module.function(entry.token)?;
        let handle = BreakpointHandle::activate(function.create_breakpoint(entry.il_offset)?)?;
        log::debug!(
            target: "breakpoint",
            "entry breakpoint armed at {}+{:#x}",
            entry.token,
            entry.il_offset
        );
        *state = EntryState::Armed {
            module: base,
            handle,
        };
        Ok(())
    }

    /// Return true if the handle is the entry breakpoint, in this case breakpoint
    /// moves to fired state and runtime handle is released.
    pub fn check_hit(&self, handle: &Arc<dyn RuntimeBreakpoint>) -> bool {
        let mut state = self.state.lock().expect("entry breakpoint lock poisoned");
        let hit = matches!(&*state, EntryState::Armed { handle: armed, .. } if armed.key() == HandleKey::of(handle));
        if hit {
            drop(mem::replace(&mut *state, EntryState::Fired));
        }
        hit
    }

    pub fn on_module_unload(&self, base: ModuleAddress) {
        let mut state = self.state.lock().expect("entry breakpoint lock poisoned");
        if matches!(&*state, EntryState::Armed { module, .. } if *module == base) {
            *state = EntryState::Waiting;
        }
    }

    /// Switch stop at entry before the entry module is loaded, later calls change nothing.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().expect("entry breakpoint lock poisoned");
        match (&*state, enabled) {
            (EntryState::Disabled, true) => *state = EntryState::Waiting,
            (EntryState::Waiting, false) => *state = EntryState::Disabled,
            _ => {}
        }
    }

    /// Release armed handle, breakpoint is never armed again.
    pub fn disable(&self) {
        let mut state = self.state.lock().expect("entry breakpoint lock poisoned");
        if !matches!(*state, EntryState::Fired) {
            *state = EntryState::Disabled;
        }
    }

    /// Stop at entry is requested and not yet fired.
    pub fn is_enabled(&self) -> bool {
        !matches!(
            *self.state.lock().expect("entry breakpoint lock poisoned"),
            EntryState::Disabled | EntryState::Fired
        )
    }

    pub fn is_fired(&self) -> bool {
        matches!(
            *self.state.lock().expect("entry breakpoint lock poisoned"),
            EntryState::Fired
        )
    }
}
