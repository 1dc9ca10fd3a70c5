use crate::debugger::breakpoint::ExceptionFilter;
use crate::debugger::event::DebuggerEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// Note: the protocol allows responses with no `body` field at all.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Exception filter exposed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
pub enum ClientExceptionFilter {
    #[strum(serialize = "all")]
    All,
    #[strum(serialize = "user-unhandled")]
    UserUnhandled,
}

impl ClientExceptionFilter {
    fn label(self) -> &'static str {
        match self {
            ClientExceptionFilter::All => "All Exceptions",
            ClientExceptionFilter::UserUnhandled => "User-Unhandled Exceptions",
        }
    }

    fn description(self) -> Value {
        let id: &'static str = self.into();
        let mut desc = json!({
            "filter": id,
            "label": self.label(),
            "supportsCondition": true,
            "conditionDescription": "Comma-separated list of exception types, `!` excludes them",
        });
        if self == ClientExceptionFilter::UserUnhandled {
            desc["default"] = json!(true);
        }
        desc
    }
}

impl From<ClientExceptionFilter> for ExceptionFilter {
    fn from(filter: ClientExceptionFilter) -> Self {
        match filter {
            ClientExceptionFilter::All => ExceptionFilter::Throw,
            ClientExceptionFilter::UserUnhandled => ExceptionFilter::UserUnhandled,
        }
    }
}

/// Engine filter for a DAP filter id, unknown ids are ignored.
pub fn exception_filter(id: &str) -> Option<ExceptionFilter> {
    id.parse::<ClientExceptionFilter>().ok().map(Into::into)
}

pub fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsFunctionBreakpoints": true,
        "supportsConditionalBreakpoints": true,
        "supportTerminateDebuggee": true,
        "supportsSetVariable": true,
        "supportsSetExpression": true,
        "supportsTerminateRequest": true,
        "supportsCancelRequest": true,
        "supportsExceptionInfoRequest": true,
        "supportsExceptionFilterOptions": true,
        "exceptionBreakpointFilters": ClientExceptionFilter::iter()
            .map(ClientExceptionFilter::description)
            .collect::<Vec<_>>(),
    })
}

/// Event name and body of an outward debugger event.
pub fn event_message(event: &DebuggerEvent) -> (&'static str, Option<Value>) {
    match event {
        DebuggerEvent::Initialized => ("initialized", None),
        DebuggerEvent::Process {
            name,
            system_process_id,
        } => (
            "process",
            Some(json!({
                "name": name,
                "systemProcessId": system_process_id,
                "isLocalProcess": true,
                "startMethod": "launch",
            })),
        ),
        DebuggerEvent::Stopped(stopped) => {
            let reason: &'static str = stopped.reason.into();
            let mut body = json!({
                "reason": reason,
                "threadId": i64::from(stopped.thread_id),
                "allThreadsStopped": stopped.all_threads_stopped,
            });
            if let Some(text) = &stopped.text {
                body["text"] = json!(text);
            }
            if let Some(description) = &stopped.description {
                body["description"] = json!(description);
            }
            if !stopped.hit_breakpoint_ids.is_empty() {
                body["hitBreakpointIds"] = json!(stopped.hit_breakpoint_ids);
            }
            ("stopped", Some(body))
        }
        DebuggerEvent::Continued {
            thread_id,
            all_threads_continued,
        } => (
            "continued",
            Some(json!({
                "threadId": i64::from(*thread_id),
                "allThreadsContinued": all_threads_continued,
            })),
        ),
        DebuggerEvent::Thread { reason, thread_id } => (
            "thread",
            Some(json!({"reason": reason, "threadId": i64::from(*thread_id)})),
        ),
        DebuggerEvent::Module { reason, module } => (
            "module",
            Some(json!({"reason": reason, "module": module})),
        ),
        DebuggerEvent::Breakpoint { reason, breakpoint } => (
            "breakpoint",
            Some(json!({"reason": reason, "breakpoint": breakpoint})),
        ),
        DebuggerEvent::Output {
            category,
            output,
            source,
            line,
        } => {
            let mut body = json!({"category": category, "output": output});
            if let Some(path) = source {
                body["source"] = json!({ "path": path });
            }
            if let Some(line) = line {
                body["line"] = json!(line);
            }
            ("output", Some(body))
        }
        DebuggerEvent::Exited { exit_code } => ("exited", Some(json!({ "exitCode": exit_code }))),
        DebuggerEvent::Terminated => ("terminated", None),
    }
}
