use crate::debugger::breakpoint::{
    BreakpointEvent, BreakpointHandle, BreakpointView, ConditionEvaluator, HitCheck, IdAllocator,
    SourceView,
};
use crate::debugger::debuginfo::{canonicalize, DebugInfoRegistry, VerifiedSite};
use crate::debugger::error::Error;
use crate::debugger::event::ChangeReason;
use crate::debugger::runtime::{HandleKey, ModuleAddress, Thread};
use crate::weak_error;
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Mutex};

/// Line breakpoint as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBreakpointRequest {
    pub line: i64,
    pub condition: Option<String>,
}

impl LineBreakpointRequest {
    pub fn new(line: i64) -> Self {
        Self {
            line,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug)]
struct LineRecord {
    id: u32,
    requested_line: u32,
    condition: Option<String>,
    /// Keys of verified sites owned by record: `(source index, resolved line)`.
    locations: SmallVec<[(u32, u32); 1]>,
    /// Cause of the last activation failure.
    message: Option<String>,
    hit_count: u32,
}

impl LineRecord {
    fn is_verified(&self) -> bool {
        !self.locations.is_empty()
    }

    fn matches(&self, line: u32, condition: &Option<String>) -> bool {
        self.requested_line == line && self.condition == *condition
    }
}

struct ArmedSite {
    record_id: u32,
    site: VerifiedSite,
    handle: BreakpointHandle,
}

#[derive(Default)]
struct LineState {
    /// Records grouped by canonical source path, in submission order.
    records: IndexMap<String, Vec<LineRecord>>,
    /// Verified sites: source index -> resolved line -> sites.
    sites: HashMap<u32, BTreeMap<u32, Vec<ArmedSite>>>,
    /// Runtime handle -> record id.
    by_handle: HashMap<HandleKey, u32>,
}

impl LineState {
    fn record_mut(&mut self, id: u32) -> Option<&mut LineRecord> {
        self.records
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.id == id)
    }

    /// Drop every site owned by the record, runtime handles are deactivated.
    fn release(&mut self, record: &mut LineRecord) {
        for (source_index, line) in mem::take(&mut record.locations) {
            let Some(lines) = self.sites.get_mut(&source_index) else {
                continue;
            };
            if let Some(sites) = lines.get_mut(&line) {
                let (released, kept): (Vec<_>, Vec<_>) =
                    mem::take(sites).into_iter().partition(|s| s.record_id == record.id);
                *sites = kept;
                for site in released {
                    self.by_handle.remove(&site.handle.key());
                }
                if sites.is_empty() {
                    lines.remove(&line);
                }
            }
            if lines.is_empty() {
                self.sites.remove(&source_index);
            }
        }
    }

    fn first_site(&self, record: &LineRecord) -> Option<&VerifiedSite> {
        let (source_index, line) = record.locations.first()?;
        self.sites
            .get(source_index)?
            .get(line)?
            .iter()
            .find(|s| s.record_id == record.id)
            .map(|s| &s.site)
    }
}

/// Manager of source line breakpoints.
pub struct LineBreakpoints {
    registry: Arc<DebugInfoRegistry>,
    ids: Arc<IdAllocator>,
    state: Mutex<LineState>,
}

impl LineBreakpoints {
    pub fn new(registry: Arc<DebugInfoRegistry>, ids: Arc<IdAllocator>) -> Self {
        Self {
            registry,
            ids,
            state: Mutex::default(),
        }
    }

    /// Replace all breakpoints of a source file with a desired set.
    ///
    /// Return views in request order and delta events. Whole request is rejected if
    /// any line is not positive, nothing is changed in this case.
    pub fn set_breakpoints(
        &self,
        source_path: &str,
        requests: &[LineBreakpointRequest],
    ) -> Result<(Vec<BreakpointView>, Vec<BreakpointEvent>), Error> {
        let lines = requests
            .iter()
            .map(|req| {
                u32::try_from(req.line)
                    .ok()
                    .filter(|&line| line > 0)
                    .ok_or(Error::InvalidLineNumber(req.line))
            })
            .collect::<Result<Vec<u32>, Error>>()?;

        let path = canonicalize(source_path);
        let mut state = self.state.lock().expect("line breakpoints lock poisoned");
        let mut existing = state.records.shift_remove(&path).unwrap_or_default();
        let mut desired = Vec::with_capacity(requests.len());
        let mut events = vec![];

        for (req, line) in requests.iter().zip(lines) {
            if let Some(pos) = existing.iter().position(|r| r.matches(line, &req.condition)) {
                desired.push(existing.remove(pos));
                continue;
            }

            let mut record = LineRecord {
                id: self.ids.next_id(),
                requested_line: line,
                condition: req.condition.clone(),
                locations: SmallVec::new(),
                message: None,
                hit_count: 0,
            };
            for base in self.registry.module_addresses() {
                self.resolve(&mut state, &path, &mut record, base);
            }
            log::debug!(
                target: "breakpoint",
                "new line breakpoint {} at {path}:{line}, verified: {}",
                record.id,
                record.is_verified()
            );
            events.push(BreakpointEvent::new(
                ChangeReason::New,
                self.view(&state, &record),
            ));
            desired.push(record);
        }

        for mut record in existing {
            state.release(&mut record);
            log::debug!(target: "breakpoint", "remove line breakpoint {}", record.id);
            events.push(BreakpointEvent::new(
                ChangeReason::Removed,
                self.view(&state, &record),
            ));
        }

        let views = desired.iter().map(|r| self.view(&state, r)).collect();
        if !desired.is_empty() {
            state.records.insert(path, desired);
        }
        Ok((views, events))
    }

    /// Re-try pending records against a new module.
    pub fn on_module_load(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        let mut state = self.state.lock().expect("line breakpoints lock poisoned");
        let mut events = vec![];

        let paths: Vec<String> = state.records.keys().cloned().collect();
        for path in paths {
            let Some(mut records) = state.records.get_mut(&path).map(mem::take) else {
                continue;
            };
            for record in records.iter_mut().filter(|r| !r.is_verified()) {
                let message_before = record.message.clone();
                self.resolve(&mut state, &path, record, base);
                if record.is_verified() || record.message != message_before {
                    events.push(BreakpointEvent::new(
                        ChangeReason::Changed,
                        self.view(&state, record),
                    ));
                }
            }
            if let Some(slot) = state.records.get_mut(&path) {
                *slot = records;
            }
        }
        events
    }

    /// Release sites of an unloaded module, records without sites return to pending.
    pub fn on_module_unload(&self, base: ModuleAddress) -> Vec<BreakpointEvent> {
        let mut state = self.state.lock().expect("line breakpoints lock poisoned");
        let state = &mut *state;

        let mut released: Vec<(u32, (u32, u32))> = vec![];
        for (source_index, lines) in state.sites.iter_mut() {
            for (line, sites) in lines.iter_mut() {
                let (gone, kept): (Vec<_>, Vec<_>) =
                    mem::take(sites).into_iter().partition(|s| s.site.module == base);
                *sites = kept;
                for site in gone {
                    state.by_handle.remove(&site.handle.key());
                    released.push((site.record_id, (*source_index, *line)));
                }
            }
            lines.retain(|_, sites| !sites.is_empty());
        }
        state.sites.retain(|_, lines| !lines.is_empty());

        let mut events = vec![];
        for (id, location) in released {
            let still_owned = state
                .sites
                .get(&location.0)
                .and_then(|lines| lines.get(&location.1))
                .map(|sites| sites.iter().any(|s| s.record_id == id))
                .unwrap_or(false);
            let Some(record) = state.record_mut(id) else {
                continue;
            };
            if !still_owned {
                record.locations.retain(|l| *l != location);
            }
            if !record.is_verified() {
                let view = BreakpointView::pending(
                    record.id,
                    Some(record.requested_line),
                    record.message.clone(),
                );
                if !events
                    .iter()
                    .any(|e: &BreakpointEvent| e.breakpoint.id == view.id)
                {
                    events.push(BreakpointEvent::new(ChangeReason::Changed, view));
                }
            }
        }
        events
    }

    pub(super) fn check_hit(
        &self,
        thread: &dyn Thread,
        key: HandleKey,
        evaluator: &dyn ConditionEvaluator,
    ) -> HitCheck {
        let (id, condition) = {
            let mut state = self.state.lock().expect("line breakpoints lock poisoned");
            let Some(&id) = state.by_handle.get(&key) else {
                return HitCheck::NoHit;
            };
            let Some(record) = state.record_mut(id) else {
                return HitCheck::NoHit;
            };
            (id, record.condition.clone())
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

        let mut state = self.state.lock().expect("line breakpoints lock poisoned");
        if let Some(record) = state.record_mut(id) {
            record.hit_count += 1;
        }
        HitCheck::Hit(id)
    }

    /// Ids of records with verified sites at `(source index, resolved line)`.
    pub fn ids_at(&self, source_index: u32, line: u32) -> Vec<u32> {
        let state = self.state.lock().expect("line breakpoints lock poisoned");
        let mut ids: Vec<u32> = state
            .sites
            .get(&source_index)
            .and_then(|lines| lines.get(&line))
            .map(|sites| sites.iter().map(|s| s.record_id).collect())
            .unwrap_or_default();
        ids.dedup();
        ids
    }

    /// Current views of every record.
    pub fn views(&self) -> Vec<BreakpointView> {
        let state = self.state.lock().expect("line breakpoints lock poisoned");
        state
            .records
            .values()
            .flatten()
            .map(|r| self.view(&state, r))
            .collect()
    }

    /// Drop every record, runtime handles are deactivated.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("line breakpoints lock poisoned");
        *state = LineState::default();
    }

    fn resolve(
        &self,
        state: &mut LineState,
        path: &str,
        record: &mut LineRecord,
        base: ModuleAddress,
    ) {
        let Some(sites) = weak_error!(
            self.registry
                .resolve_breakpoint(base, path, record.requested_line),
            "resolve line breakpoint:"
        ) else {
            return;
        };
        let Some(module) = self.registry.module_handle(base) else {
            return;
        };

        for site in sites {
            let handle = module
                .function(site.token)
                .and_then(|f| f.create_breakpoint(site.il_offset))
                .map_err(Error::from)
                .and_then(BreakpointHandle::activate);
            let handle = match handle {
                Ok(handle) => handle,
                Err(e) => {
                    log::warn!(
                        target: "breakpoint",
                        "breakpoint {} at {}+{:#x}: {e:#}",
                        record.id,
                        site.token,
                        site.il_offset
                    );
                    record.message = Some(e.to_string());
                    continue;
                }
            };

            let location = (site.source_index, site.line);
            state.by_handle.insert(handle.key(), record.id);
            state
                .sites
                .entry(location.0)
                .or_default()
                .entry(location.1)
                .or_default()
                .push(ArmedSite {
                    record_id: record.id,
                    site,
                    handle,
                });
            if !record.locations.contains(&location) {
                record.locations.push(location);
            }
            record.message = None;
        }
    }

    fn view(&self, state: &LineState, record: &LineRecord) -> BreakpointView {
        let Some(site) = state.first_site(record) else {
            return BreakpointView::pending(
                record.id,
                Some(record.requested_line),
                record.message.clone(),
            );
        };
        BreakpointView {
            id: record.id,
            verified: true,
            message: None,
            source: self
                .registry
                .source_path_by_index(site.source_index)
                .map(SourceView::new),
            line: Some(site.line),
            end_line: Some(site.end_line),
            hit_count: record.hit_count,
        }
    }
}
