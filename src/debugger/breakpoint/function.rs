use crate::debugger::breakpoint::{
    BreakpointEvent, BreakpointHandle, BreakpointView, ConditionEvaluator, HitCheck, IdAllocator,
    SourceView,
};
use crate::debugger::debuginfo::{DebugInfoRegistry, FunctionMatch};
use crate::debugger::error::Error;
use crate::debugger::event::ChangeReason;
use crate::debugger::runtime::{HandleKey, MethodToken, ModuleAddress, Thread};
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};

/// Function breakpoint as submitted by a client.
///
/// Name may contain a parameter list: `App.Program.Run(System.Int32, System.String)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBreakpointRequest {
    pub name: String,
    pub params: Option<String>,
    pub condition: Option<String>,
}

impl FunctionBreakpointRequest {
    pub fn new(name: &str) -> Self {
        let (name, params) = match name.find('(') {
            Some(pos) => (name[..pos].trim(), Some(name[pos..].to_string())),
            None => (name.trim(), None),
        };
        Self {
            name: name.to_string(),
            params,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

struct FunctionSite {
    module: ModuleAddress,
    token: MethodToken,
    source_path: Option<String>,
    line: Option<u32>,
    end_line: Option<u32>,
    handle: BreakpointHandle,
}

struct FunctionRecord {
    id: u32,
    request: FunctionBreakpointRequest,
    sites: Vec<FunctionSite>,
    message: Option<String>,
    hit_count: u32,
}

impl FunctionRecord {
    fn is_verified(&self) -> bool {
        !self.sites.is_empty()
    }

    fn view(&self) -> BreakpointView {
        let Some(site) = self.sites.first() else {
            return BreakpointView::pending(self.id, None, self.message.clone());
        };
        BreakpointView {
            id: self.id,
            verified: true,
            message: None,
            source: site.source_path.clone().map(SourceView::new),
            line: site.line,
            end_line: site.end_line,
            hit_count: self.hit_count,
        }
    }

    /// Arm a runtime breakpoint at the method beginning.
    fn arm(&mut self, m: FunctionMatch) -> Result<(), Error> {
        let base = m.module.base_address();
        if self
            .sites
            .iter()
            .any(|s| s.module == base && s.token == m.token)
        {
            return Ok(());
        }
        let function = m.module.function(m.token)?;
        let handle = BreakpointHandle::activate(function.create_breakpoint(0)?)?;
        log::debug!(
            target: "breakpoint",
            "function breakpoint {} armed at {} ({})",
            self.id,
            m.name,
            m.token
        );
        self.sites.push(FunctionSite {
            module: base,
            token: m.token,
            source_path: m.source_path,
            line: m.line,
            end_line: m.end_line,
            handle,
        });
        Ok(())
    }
}

#[derive(Default)]
struct FunctionState {
    records: Vec<FunctionRecord>,
    by_handle: HashMap<HandleKey, u32>,
}

impl FunctionState {
    fn reindex(&mut self) {
        self.by_handle = self
            .records
            .iter()
            .flat_map(|r| r.sites.iter().map(move |s| (s.handle.key(), r.id)))
            .collect();
    }
}

/// Manager of function breakpoints.
pub struct FunctionBreakpoints {
    registry: Arc<DebugInfoRegistry>,
    ids: Arc<IdAllocator>,
    state: Mutex<FunctionState>,
}

impl FunctionBreakpoints {
    pub fn new(registry: Arc<DebugInfoRegistry>, ids: Arc<IdAllocator>) -> Self {
        Self {
            registry,
            ids,
            state: Mutex::default(),
        }
    }

    /// Replace the global function breakpoint list with a desired set.
    pub fn set_breakpoints(
        &self,
        requests: &[FunctionBreakpointRequest],
    ) -> (Vec<BreakpointView>, Vec<BreakpointEvent>) {
        let mut state = self.state.lock().expect("function breakpoints lock poisoned");
        let mut existing = mem::take(&mut state.records);
        let mut events = vec![];

        for req in requests {
            if let Some(pos) = existing.iter().position(|r| r.request == *req) {
                state.records.push(existing.remove(pos));
                continue;
            }

            let mut record = FunctionRecord {
                id: self.ids.next_id(),
                request: req.clone(),
                sites: vec![],
                message: None,
                hit_count: 0,
            };
            let resolved = self.registry.resolve_function_breakpoint_in_any(
                &req.name,
                req.params.as_deref(),
                |m| {
                    if let Err(e) = record.arm(m) {
                        log::warn!(target: "breakpoint", "function breakpoint {}: {e:#}", req.name);
                        record.message = Some(e.to_string());
                    }
                    Ok(())
                },
            );
            if let Err(e) = resolved {
                log::warn!(target: "breakpoint", "resolve function {}: {e:#}", req.name);
            }
            if record.is_verified() {
                record.message = None;
            }
            events.push(BreakpointEvent::new(ChangeReason::New, record.view()));
            state.records.push(record);
        }

        for record in existing {
            log::debug!(target: "breakpoint", "remove function breakpoint {}", record.id);
            events.push(BreakpointEvent::new(ChangeReason::Removed, record.view()));
        }

        state.reindex();
        let views = state.records.iter().map(FunctionRecord::view).collect();
        (views, events)
    }

    pub fn on_module_load(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        let mut state = self.state.lock().expect("function breakpoints lock poisoned");
        let mut events = vec![];

        for record in state.records.iter_mut() {
            let before = record.sites.len();
            let matches = self.registry.resolve_function_breakpoint(
                base,
                &record.request.name,
                record.request.params.as_deref(),
            );
            for m in matches {
                if let Err(e) = record.arm(m) {
                    log::warn!(target: "breakpoint", "function breakpoint {}: {e:#}", record.id);
                    record.message = Some(e.to_string());
                }
            }
            // only pending -> verified transition is visible to a client
            if before == 0 && record.is_verified() {
                record.message = None;
                events.push(BreakpointEvent::new(ChangeReason::Changed, record.view()));
            }
        }

        state.reindex();
        events
    }

    pub fn on_module_unload(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        let mut state = self.state.lock().expect("function breakpoints lock poisoned");
        let mut events = vec![];

        for record in state.records.iter_mut() {
            let before = record.sites.len();
            record.sites.retain(|s| s.module != base);
            if before != 0 && !record.is_verified() {
                events.push(BreakpointEvent::new(ChangeReason::Changed, record.view()));
            }
        }

        state.reindex();
        events
    }

    pub(super) fn check_hit(
        &self,
        thread: &dyn Thread,
        key: HandleKey,
        evaluator: &dyn ConditionEvaluator,
    ) -> HitCheck {
        let (id, condition) = {
            let state = self.state.lock().expect("function breakpoints lock poisoned");
            let Some(&id) = state.by_handle.get(&key) else {
                return HitCheck::NoHit;
            };
            let Some(record) = state.records.iter().find(|r| r.id == id) else {
                return HitCheck::NoHit;
            };
            (id, record.request.condition.clone())
        };

        if let Some(condition) = condition {
            match evaluator.evaluate(thread, &condition) {
                Ok(true) => {}
                Ok(false) => return HitCheck::NoHit,
                Err(e) => {
                    log::debug!(target: "breakpoint", "breakpoint {id} condition: {e:#}");
                    return HitCheck::ConditionFailed {
                        id,
                        message: e.to_string(),
                    };
                }
            }
        }

        let mut state = self.state.lock().expect("function breakpoints lock poisoned");
        if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
            record.hit_count += 1;
        }
        HitCheck::Hit(id)
    }

    pub fn views(&self) -> Vec<BreakpointView> {
        let state = self.state.lock().expect("function breakpoints lock poisoned");
        state.records.iter().map(FunctionRecord::view).collect()
    }

    /// Drop every record, runtime handles are deactivated.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("function breakpoints lock poisoned");
        *state = FunctionState::default();
    }
}
