//! DAP request dispatcher.

use crate::dap::logger::DapLogger;
use crate::dap::output::OutputChannel;
use crate::dap::protocol::{capabilities, exception_filter, DapRequest};
use crate::dap::transport::{DapReader, DapTransport};
use crate::debugger::breakpoint::{
    Breakpoints, ConditionEvaluator, ExceptionFilter, FunctionBreakpointRequest,
    LineBreakpointRequest, NoConditions,
};
use crate::debugger::config::DebuggerConfig;
use crate::debugger::debuginfo::{DebugInfoRegistry, SymbolLoader};
use crate::debugger::event::{DebuggerEvent, EventSink};
use crate::debugger::frame::NativeUnwinder;
use crate::debugger::runtime::{ManagedCallback, Process};
use crate::debugger::step::StepKind;
use crate::debugger::thread::ThreadId;
use crate::debugger::{Debugger, DebuggerBuilder};
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Embedder hook that starts the managed runtime or attaches to it.
///
/// Collaborators that can't be expressed in this crate (symbol file reader,
/// expression evaluator, native unwinder) are provided here as well.
pub trait RuntimeConnector {
    /// Start a debuggee described by `launch` arguments. Runtime callbacks must be
    /// delivered to `callback`, the process may be returned now or reported later
    /// by the `CreateProcess` callback.
    fn launch(
        &mut self,
        arguments: &Value,
        callback: Arc<dyn ManagedCallback>,
    ) -> anyhow::Result<Option<Arc<dyn Process>>>;

    /// Attach to a running process.
    fn attach(
        &mut self,
        pid: u32,
        callback: Arc<dyn ManagedCallback>,
    ) -> anyhow::Result<Arc<dyn Process>>;

    fn symbol_loader(&self) -> Option<Arc<dyn SymbolLoader>> {
        None
    }

    fn evaluator(&self) -> Option<Arc<dyn ConditionEvaluator>> {
        None
    }

    fn native_unwinder(&self) -> Option<Arc<dyn NativeUnwinder>> {
        None
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Source {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceBreakpoint {
    line: i64,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointsArguments {
    source: Source,
    breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form of `breakpoints`.
    lines: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionBreakpoint {
    name: String,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFunctionBreakpointsArguments {
    breakpoints: Vec<FunctionBreakpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionFilterOptions {
    filter_id: String,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    filters: Vec<String>,
    #[serde(default)]
    filter_options: Vec<ExceptionFilterOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadArguments {
    thread_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArguments {
    thread_id: i64,
    start_frame: Option<usize>,
    levels: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectArguments {
    terminate_debuggee: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArguments {
    process_id: u32,
}

fn parse_args<'a, T: Deserialize<'a>>(arguments: &'a Value) -> anyhow::Result<T> {
    T::deserialize(arguments).context("malformed request arguments")
}

fn thread_id(raw: i64) -> anyhow::Result<ThreadId> {
    ThreadId::try_from(raw).map_err(|_| anyhow!("invalid thread id {raw}"))
}

/// What to do with a request after dispatching.
enum Reply {
    Respond(Option<Value>),
    /// Response is sent later (launch waits for `configurationDone`).
    Deferred,
    /// Respond and finish the session.
    Disconnect,
}

/// Single debug session over a DAP connection.
pub struct DebugSession<T: DapTransport, C: RuntimeConnector> {
    reader: T::Reader,
    output: Arc<OutputChannel>,
    connector: C,
    debugger: Option<Debugger>,
    /// Created by the first breakpoint request, the debugger takes it over on launch.
    breakpoints: Option<Arc<Breakpoints>>,
    config_done: bool,
    pending_launch: Option<DapRequest>,
    /// Session owns the debuggee (launch), otherwise it's attached.
    launched: bool,
}

impl<T: DapTransport, C: RuntimeConnector> DebugSession<T, C> {
    pub fn new(transport: T, connector: C) -> Self {
        let (reader, writer) = transport.split();
        Self {
            reader,
            output: Arc::new(OutputChannel::new(writer)),
            connector,
            debugger: None,
            breakpoints: None,
            config_done: false,
            pending_launch: None,
            launched: false,
        }
    }

    pub fn output(&self) -> Arc<OutputChannel> {
        self.output.clone()
    }

    /// Serve requests until `disconnect` or the connection is closed.
    pub fn run(mut self) -> anyhow::Result<()> {
        let logger = DapLogger::new(self.output.clone());
        let filter = logger.filter();
        crate::log::LOGGER_SWITCHER.switch(logger, filter);

        let result = self.serve();

        crate::log::LOGGER_SWITCHER.disable();
        // joins callbacks worker
        self.debugger.take();
        self.output.reset_seq();
        result
    }

    fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            let message = match self.reader.read_message() {
                Ok(message) => message,
                Err(e) => {
                    log::info!(target: "dap", "client gone: {e:#}");
                    return Ok(());
                }
            };
            let request: DapRequest = match serde_json::from_value(message) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!(target: "dap", "malformed message: {e}");
                    continue;
                }
            };
            if request.r#type != "request" {
                continue;
            }
            log::debug!(target: "dap", "{}: {}", request.seq, request.command);

            if !self.handle(&request)? {
                return Ok(());
            }

            if self.config_done {
                if let Some(launch) = self.pending_launch.take() {
                    let result = self.launch_debuggee(&launch).map(Reply::Respond);
                    self.reply(&launch, result)?;
                }
            }
        }
    }

    /// Dispatch a request and send a response, return false if session is over.
    fn handle(&mut self, request: &DapRequest) -> anyhow::Result<bool> {
        let result = self.dispatch(request);
        self.reply(request, result)
    }

    fn reply(&mut self, request: &DapRequest, result: anyhow::Result<Reply>) -> anyhow::Result<bool> {
        match result {
            Ok(Reply::Respond(body)) => {
                self.output
                    .send_success(request.seq, &request.command, body)?;
            }
            Ok(Reply::Deferred) => {}
            Ok(Reply::Disconnect) => {
                self.output
                    .send_success(request.seq, &request.command, None)?;
                return Ok(false);
            }
            Err(e) => {
                log::warn!(target: "dap", "{} failed: {e:#}", request.command);
                self.output
                    .send_error(request.seq, &request.command, format!("{e:#}"))?;
            }
        }

        if request.command == "initialize" {
            self.output.emit(DebuggerEvent::Initialized);
        }
        Ok(true)
    }

    fn debugger(&self) -> anyhow::Result<&Debugger> {
        self.debugger
            .as_ref()
            .ok_or_else(|| anyhow!("no active debug session"))
    }

    fn dispatch(&mut self, request: &DapRequest) -> anyhow::Result<Reply> {
        let args = &request.arguments;
        let reply = match request.command.as_str() {
            "initialize" => Reply::Respond(Some(capabilities())),
            "launch" => {
                self.create_debugger(args)?;
                self.launched = true;
                if self.config_done {
                    Reply::Respond(self.launch_debuggee(request)?)
                } else {
                    // breakpoints are configured between launch and configurationDone,
                    // debuggee starts when configuration is complete
                    self.pending_launch = Some(request.clone());
                    Reply::Deferred
                }
            }
            "attach" => {
                let attach: AttachArguments = parse_args(args)?;
                self.create_debugger(args)?;
                let debugger = self
                    .debugger
                    .as_ref()
                    .ok_or_else(|| anyhow!("no active debug session"))?;
                let process = self
                    .connector
                    .attach(attach.process_id, debugger.managed_callback())?;
                debugger.set_process(process);
                Reply::Respond(None)
            }
            "configurationDone" => {
                self.config_done = true;
                Reply::Respond(None)
            }
            "setBreakpoints" => Reply::Respond(Some(self.set_breakpoints(args)?)),
            "setFunctionBreakpoints" => {
                let args: SetFunctionBreakpointsArguments = parse_args(args)?;
                let requests: Vec<_> = args
                    .breakpoints
                    .into_iter()
                    .map(|bp| {
                        let req = FunctionBreakpointRequest::new(&bp.name);
                        match bp.condition {
                            Some(cond) => req.with_condition(cond),
                            None => req,
                        }
                    })
                    .collect();
                let (views, _) = self.breakpoints().function.set_breakpoints(&requests);
                Reply::Respond(Some(json!({ "breakpoints": views })))
            }
            "setExceptionBreakpoints" => {
                let args: SetExceptionBreakpointsArguments = parse_args(args)?;
                let mut filters: Vec<(ExceptionFilter, Option<String>)> = args
                    .filters
                    .iter()
                    .filter_map(|id| exception_filter(id))
                    .map(|f| (f, None))
                    .collect();
                filters.extend(args.filter_options.into_iter().filter_map(|opt| {
                    exception_filter(&opt.filter_id).map(|f| (f, opt.condition))
                }));
                let views = self.breakpoints().exception.set_breakpoints(&filters);
                Reply::Respond(Some(json!({ "breakpoints": views })))
            }
            "threads" => {
                let threads = match self.debugger.as_ref() {
                    Some(debugger) => debugger.threads()?,
                    None => vec![],
                };
                Reply::Respond(Some(json!({ "threads": threads })))
            }
            "stackTrace" => {
                let args: StackTraceArguments = parse_args(args)?;
                let (frames, total) = self.debugger()?.stack_trace(
                    thread_id(args.thread_id)?,
                    args.start_frame.unwrap_or(0),
                    args.levels.unwrap_or(0),
                )?;
                Reply::Respond(Some(json!({
                    "stackFrames": frames,
                    "totalFrames": total,
                })))
            }
            "continue" => {
                self.debugger()?.continue_execution()?;
                Reply::Respond(Some(json!({ "allThreadsContinued": true })))
            }
            "next" | "stepIn" | "stepOut" => {
                let args: ThreadArguments = parse_args(args)?;
                let kind = match request.command.as_str() {
                    "next" => StepKind::Over,
                    "stepIn" => StepKind::In,
                    _ => StepKind::Out,
                };
                self.debugger()?.step(thread_id(args.thread_id)?, kind)?;
                Reply::Respond(None)
            }
            "pause" => {
                self.debugger()?.pause()?;
                Reply::Respond(None)
            }
            "exceptionInfo" => {
                let args: ThreadArguments = parse_args(args)?;
                let tid = thread_id(args.thread_id)?;
                let info = self
                    .debugger()?
                    .exception_info(tid)
                    .ok_or_else(|| anyhow!("no exception on thread {tid}"))?;
                Reply::Respond(Some(json!({
                    "exceptionId": info.type_name,
                    "description": info.message,
                    "breakMode": info.break_mode,
                    "details": {
                        "typeName": info.type_name,
                        "fullTypeName": info.type_name,
                        "message": info.message,
                    },
                })))
            }
            "cancel" => Reply::Respond(None),
            "terminate" => {
                self.debugger()?.terminate()?;
                Reply::Respond(None)
            }
            "disconnect" => {
                let args: DisconnectArguments = if args.is_null() {
                    DisconnectArguments::default()
                } else {
                    parse_args(args)?
                };
                if let Some(debugger) = self.debugger.as_ref() {
                    let terminate = args.terminate_debuggee.unwrap_or(self.launched);
                    debugger.disconnect(terminate)?;
                }
                Reply::Disconnect
            }
            command => bail!("unsupported command `{command}`"),
        };
        Ok(reply)
    }

    fn set_breakpoints(&mut self, args: &Value) -> anyhow::Result<Value> {
        let args: SetBreakpointsArguments = parse_args(args)?;
        let path = args
            .source
            .path
            .ok_or_else(|| anyhow!("source without path is not supported"))?;
        let requests: Vec<_> = match (args.breakpoints, args.lines) {
            (Some(breakpoints), _) => breakpoints
                .into_iter()
                .map(|bp| {
                    let req = LineBreakpointRequest::new(bp.line);
                    match bp.condition {
                        Some(cond) => req.with_condition(cond),
                        None => req,
                    }
                })
                .collect(),
            (None, Some(lines)) => lines.into_iter().map(LineBreakpointRequest::new).collect(),
            (None, None) => vec![],
        };

        // resolution events are reported by the module load callback
        let (views, _) = self.breakpoints().line.set_breakpoints(&path, &requests)?;
        Ok(json!({ "breakpoints": views }))
    }

    /// Breakpoint engine of the session, outlives a not yet created debugger.
    fn breakpoints(&mut self) -> Arc<Breakpoints> {
        let connector = &self.connector;
        self.breakpoints
            .get_or_insert_with(|| {
                let evaluator = connector
                    .evaluator()
                    .unwrap_or_else(|| Arc::new(NoConditions));
                Arc::new(Breakpoints::new(
                    Arc::new(DebugInfoRegistry::new()),
                    evaluator,
                    &DebuggerConfig::default(),
                ))
            })
            .clone()
    }

    fn create_debugger(&mut self, args: &Value) -> anyhow::Result<()> {
        if self.debugger.is_some() {
            bail!("debug session already started");
        }
        let config = DebuggerConfig::from_launch_args(args);
        let name = args
            .get("program")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut builder = DebuggerBuilder::new()
            .with_config(config)
            .with_sink(self.output.clone() as Arc<dyn EventSink>)
            .with_process_name(name);
        if let Some(loader) = self.connector.symbol_loader() {
            builder = builder.with_symbol_loader(loader);
        }
        if let Some(unwinder) = self.connector.native_unwinder() {
            builder = builder.with_native_unwinder(unwinder);
        }
        let debugger = builder.with_breakpoints(self.breakpoints()).build()?;

        self.debugger = Some(debugger);
        Ok(())
    }

    fn launch_debuggee(&mut self, request: &DapRequest) -> anyhow::Result<Option<Value>> {
        let debugger = self
            .debugger
            .as_ref()
            .ok_or_else(|| anyhow!("no active debug session"))?;
        let process = self
            .connector
            .launch(&request.arguments, debugger.managed_callback())?;
        match process {
            Some(process) => debugger.set_process(process),
            None => debugger.callbacks_queue().set_running(),
        }
        log::info!(target: "dap", "debuggee launched");
        Ok(None)
    }
}
