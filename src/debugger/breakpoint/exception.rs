use crate::debugger::breakpoint::{BreakpointView, IdAllocator};
use crate::debugger::runtime::ExceptionCallbackType;
use crate::debugger::thread::ThreadId;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use strum_macros::Display;

/// Exception breakpoint filter.
///
/// Only [`ExceptionFilter::Throw`] and [`ExceptionFilter::UserUnhandled`] are exposed to
/// a client, the composite filter is used when both are set with the same condition and
/// unhandled exceptions always stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionFilter {
    Throw,
    UserUnhandled,
    ThrowUserUnhandled,
    Unhandled,
}

impl ExceptionFilter {
    fn stops_on_throw(self) -> bool {
        matches!(
            self,
            ExceptionFilter::Throw | ExceptionFilter::ThrowUserUnhandled
        )
    }

    fn stops_on_user_unhandled(self) -> bool {
        matches!(
            self,
            ExceptionFilter::UserUnhandled | ExceptionFilter::ThrowUserUnhandled
        )
    }
}

/// Set of exception type names, optionally negated.
///
/// Textual form is a comma separated list of fully qualified type names,
/// a leading `!` negates the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExceptionCondition {
    types: BTreeSet<String>,
    negated: bool,
}

impl ExceptionCondition {
    pub fn parse(condition: Option<&str>) -> Self {
        let Some(condition) = condition.map(str::trim) else {
            return Self::default();
        };
        let (negated, list) = match condition.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, condition),
        };
        let types = list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        Self { types, negated }
    }

    /// Empty set matches every type.
    pub fn matches(&self, type_name: &str) -> bool {
        self.types.is_empty() || self.types.contains(type_name) != self.negated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ExceptionBreakMode {
    Always,
    UserUnhandled,
    Unhandled,
}

/// Stop decision for an exception callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionStop {
    pub break_mode: ExceptionBreakMode,
    /// Ids of exception breakpoints that cause the stop, empty for unhandled exceptions.
    pub breakpoint_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ExceptionPhase {
    #[default]
    Idle,
    FirstChanceSeen,
    UserCatchFound,
    Unhandled,
}

#[derive(Debug, Clone)]
struct ExceptionBreakpoint {
    id: u32,
    filter: ExceptionFilter,
    condition: ExceptionCondition,
}

#[derive(Default)]
struct ExceptionState {
    breakpoints: Vec<ExceptionBreakpoint>,
    phases: HashMap<ThreadId, ExceptionPhase>,
}

/// Manager of exception breakpoints and per thread exception state machine.
pub struct ExceptionBreakpoints {
    ids: Arc<IdAllocator>,
    state: Mutex<ExceptionState>,
}

impl ExceptionBreakpoints {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            state: Mutex::default(),
        }
    }

    /// Replace whole exception breakpoint set, ids of unchanged entries are preserved.
    pub fn set_breakpoints(
        &self,
        requests: &[(ExceptionFilter, Option<String>)],
    ) -> Vec<BreakpointView> {
        let mut requested: Vec<(ExceptionFilter, ExceptionCondition)> = requests
            .iter()
            .map(|(filter, condition)| (*filter, ExceptionCondition::parse(condition.as_deref())))
            .collect();

        // THROW and USER_UNHANDLED with the same condition collapse into the composite filter
        let mut idx = 0;
        while idx < requested.len() {
            let (filter, condition) = requested[idx].clone();
            let pair = match filter {
                ExceptionFilter::Throw => ExceptionFilter::UserUnhandled,
                ExceptionFilter::UserUnhandled => ExceptionFilter::Throw,
                _ => {
                    idx += 1;
                    continue;
                }
            };
            if let Some(pos) = requested
                .iter()
                .position(|(f, c)| *f == pair && *c == condition)
            {
                requested[idx].0 = ExceptionFilter::ThrowUserUnhandled;
                requested.remove(pos);
            }
            idx += 1;
        }

        let mut state = self.state.lock().expect("exception breakpoints lock poisoned");
        let mut existing = std::mem::take(&mut state.breakpoints);
        for (filter, condition) in requested {
            let bp = match existing
                .iter()
                .position(|bp| bp.filter == filter && bp.condition == condition)
            {
                Some(pos) => existing.remove(pos),
                None => ExceptionBreakpoint {
                    id: self.ids.next_id(),
                    filter,
                    condition,
                },
            };
            log::debug!(target: "breakpoint", "exception breakpoint {} ({})", bp.id, bp.filter);
            state.breakpoints.push(bp);
        }

        state
            .breakpoints
            .iter()
            .map(|bp| BreakpointView {
                id: bp.id,
                verified: true,
                message: None,
                source: None,
                line: None,
                end_line: None,
                hit_count: 0,
            })
            .collect()
    }

    /// Advance thread exception state and decide whether to stop.
    ///
    /// `handler_in_user_code` is only meaningful for `CatchHandlerFound` callbacks.
    pub fn on_exception(
        &self,
        thread: ThreadId,
        kind: ExceptionCallbackType,
        type_name: &str,
        handler_in_user_code: bool,
        just_my_code: bool,
    ) -> Option<ExceptionStop> {
        let mut state = self.state.lock().expect("exception breakpoints lock poisoned");
        let phase = state.phases.get(&thread).copied().unwrap_or_default();

        let matched = |state: &ExceptionState, pred: fn(ExceptionFilter) -> bool| -> Vec<u32> {
            state
                .breakpoints
                .iter()
                .filter(|bp| pred(bp.filter) && bp.condition.matches(type_name))
                .map(|bp| bp.id)
                .collect()
        };

        let (next_phase, stop) = match kind {
            ExceptionCallbackType::FirstChance => {
                let ids = if just_my_code {
                    vec![]
                } else {
                    matched(&*state, ExceptionFilter::stops_on_throw)
                };
                (ExceptionPhase::FirstChanceSeen, (!ids.is_empty()).then_some((ExceptionBreakMode::Always, ids)))
            }
            ExceptionCallbackType::UserFirstChance => {
                let ids = if just_my_code {
                    matched(&*state, ExceptionFilter::stops_on_throw)
                } else {
                    vec![]
                };
                (ExceptionPhase::FirstChanceSeen, (!ids.is_empty()).then_some((ExceptionBreakMode::Always, ids)))
            }
            ExceptionCallbackType::UserCatchHandlerFound => (ExceptionPhase::UserCatchFound, None),
            ExceptionCallbackType::CatchHandlerFound => {
                let ids = if phase != ExceptionPhase::UserCatchFound && !handler_in_user_code {
                    matched(&*state, ExceptionFilter::stops_on_user_unhandled)
                } else {
                    vec![]
                };
                (ExceptionPhase::Idle, (!ids.is_empty()).then_some((ExceptionBreakMode::UserUnhandled, ids)))
            }
            ExceptionCallbackType::Unhandled => (
                ExceptionPhase::Unhandled,
                Some((ExceptionBreakMode::Unhandled, vec![])),
            ),
        };

        log::debug!(
            target: "breakpoint",
            "thread {thread} exception {type_name} ({kind}): {phase:?} -> {next_phase:?}"
        );
        state.phases.insert(thread, next_phase);
        stop.map(|(break_mode, breakpoint_ids)| ExceptionStop {
            break_mode,
            breakpoint_ids,
        })
    }

    /// Forget exception state of exited thread.
    pub fn reset_thread(&self, thread: ThreadId) {
        let mut state = self.state.lock().expect("exception breakpoints lock poisoned");
        state.phases.remove(&thread);
    }
}
