use crate::dap::protocol::{event_message, DapEvent, DapResponse};
use crate::dap::transport::DapWriter;
use crate::debugger::event::{DebuggerEvent, EventSink};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

struct OutputState {
    seq: i64,
    writer: Box<dyn DapWriter>,
}

/// Outgoing side of a DAP connection.
///
/// Responses and events share a single `seq` counter, one mutex serializes
/// numbering and writing so that messages never interleave.
pub struct OutputChannel {
    state: Mutex<OutputState>,
}

impl OutputChannel {
    pub fn new(writer: impl DapWriter + 'static) -> Self {
        Self {
            state: Mutex::new(OutputState {
                seq: 0,
                writer: Box::new(writer),
            }),
        }
    }

    fn send<T: Serialize>(&self, make: impl FnOnce(i64) -> T) -> anyhow::Result<()> {
        // no logging here, log records may be routed into this channel
        let mut state = self.state.lock().expect("output channel lock poisoned");
        state.seq += 1;
        let message = serde_json::to_value(make(state.seq))?;
        state.writer.write_message(&message)
    }

    pub fn send_event(&self, event: &'static str, body: Option<Value>) -> anyhow::Result<()> {
        self.send(|seq| DapEvent {
            seq,
            r#type: "event",
            event,
            body,
        })
    }

    pub fn send_success(
        &self,
        request_seq: i64,
        command: &str,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        self.send(|seq| DapResponse {
            seq,
            r#type: "response",
            request_seq,
            success: true,
            command: command.to_string(),
            message: None,
            body,
        })
    }

    pub fn send_error(&self, request_seq: i64, command: &str, message: String) -> anyhow::Result<()> {
        self.send(|seq| DapResponse {
            seq,
            r#type: "response",
            request_seq,
            success: false,
            command: command.to_string(),
            message: Some(message),
            body: None,
        })
    }

    /// Restart message numbering, used when a new session starts on the same connection.
    pub fn reset_seq(&self) {
        self.state.lock().expect("output channel lock poisoned").seq = 0;
    }
}

impl EventSink for OutputChannel {
    fn emit(&self, event: DebuggerEvent) {
        let (name, body) = event_message(&event);
        // a failed write means the client is gone, session loop notices it on read
        let _ = self.send_event(name, body);
    }
}
