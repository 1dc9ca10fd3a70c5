use crate::dap::output::OutputChannel;
use crate::debugger::event::{DebuggerEvent, EventSink};
use log::LevelFilter;
use std::fmt::Write as _;
use std::sync::Arc;

/// Logger that forwards log records to a DAP client as `console` output events.
///
/// Filtering follows `RUST_LOG` like the default `env_logger` backend.
pub struct DapLogger {
    inner: env_logger::Logger,
    output: Arc<OutputChannel>,
}

impl DapLogger {
    pub fn new(output: Arc<OutputChannel>) -> Self {
        Self {
            inner: env_logger::Logger::from_default_env(),
            output,
        }
    }

    pub fn filter(&self) -> LevelFilter {
        self.inner.filter()
    }
}

impl log::Log for DapLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.matches(record) {
            return;
        }

        let mut output = String::new();
        let _ = write!(output, "[{}] ", record.level());
        let _ = write!(output, "{} ", record.target());
        let _ = writeln!(output, "{}", record.args());

        self.output.emit(DebuggerEvent::console(output));
    }

    fn flush(&self) {}
}
