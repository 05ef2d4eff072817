use crate::adapter::breakpoint::{BreakpointResolver, SourceBreakpoint};
use crate::adapter::connect::{self, Topology};
use crate::adapter::coordinator::{Coordinator, Effect, ExceptionFilters, StepMode, ThreadStatus};
use crate::adapter::variables::{self, ScopeEngine, VarRef};
use crate::adapter::{Input, spawn_client_reader, spawn_debuggee_reader};
use crate::dap::args::{AttachArguments, DEFAULT_CONNECT_TIMEOUT, LaunchArguments};
use crate::dap::pathmap::PathMapper;
use crate::dap::protocol::{
    ClientMessage, ClientResponse, DapEvent, DapRequest, DapResponse, DapReverseRequest,
    OutgoingEvent,
};
use crate::dap::transport::{DapReader, DapWriter};
use crate::debuggee::socket::{Closer, DebuggeeChannel, DebuggeeListener};
use crate::debuggee::wire::{self, AdapterMessage, DebuggeeMessage, RequestBody};
use crate::error::Error;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt::Display;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::time::Duration;
use strum_macros::IntoStaticStr;

/// Session lifecycle, `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Running,
    Terminating,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Connect timeout in seconds for requests that do not set `connectTimeout`.
    pub connect_timeout: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

struct DebuggeeLink {
    writer: Box<dyn Write + Send>,
    closer: Closer,
}

/// Debuggee connection that is being set up, `request` is answered when it is done.
enum Connecting {
    /// `runInTerminal` sent, the client has not answered yet.
    AwaitingTerminal {
        request: DapRequest,
        listener: DebuggeeListener,
        /// The `run` wrapper connects here when the debuggee exits.
        exit: DebuggeeListener,
        timeout: Duration,
        terminal_seq: i64,
    },
    /// A helper thread accepts or connects.
    Waiting { request: DapRequest, generation: u64 },
}

/// Client request waiting for a debuggee reply.
enum Pending {
    Forward(DapRequest),
    Variables { request: DapRequest, thread_id: i64 },
    SetVariable { request: DapRequest, thread_id: i64 },
    Evaluate { request: DapRequest, thread_id: i64 },
}

impl Pending {
    fn request(&self) -> &DapRequest {
        match self {
            Pending::Forward(request) => request,
            Pending::Variables { request, .. } => request,
            Pending::SetVariable { request, .. } => request,
            Pending::Evaluate { request, .. } => request,
        }
    }
}

pub struct Session {
    options: SessionOptions,
    writer: DapWriter,
    seq: i64,
    state: SessionState,
    inputs: Sender<Input>,
    disconnecting: Arc<AtomicBool>,
    /// Identifies the current debuggee connection, input of older connections is dropped.
    generation: u64,
    topology: Option<Topology>,
    connecting: Option<Connecting>,
    link: Option<DebuggeeLink>,
    mapper: PathMapper,
    resolver: BreakpointResolver,
    coordinator: Coordinator,
    scopes: ScopeEngine,
    pending: HashMap<u64, Pending>,
    next_request_id: u64,
    supports_run_in_terminal: bool,
    configuration_done: bool,
    restarting: bool,
    terminated_sent: bool,
}

impl Session {
    /// Serve one client until it disconnects or its stream ends.
    pub fn run(reader: DapReader, writer: DapWriter, options: SessionOptions) {
        let (inputs, queue) = mpsc::channel();
        let disconnecting = Arc::new(AtomicBool::new(false));
        spawn_client_reader(reader, inputs.clone(), disconnecting.clone());

        let mut session = Session::new(writer, inputs, disconnecting, options);
        for input in queue.iter() {
            session.handle_input(input);
            if session.state == SessionState::Closed {
                break;
            }
        }
        log::info!(target: "adapter", "session finished");
    }

    fn new(
        writer: DapWriter,
        inputs: Sender<Input>,
        disconnecting: Arc<AtomicBool>,
        options: SessionOptions,
    ) -> Self {
        Self {
            options,
            writer,
            seq: 0,
            state: SessionState::Initializing,
            inputs,
            disconnecting,
            generation: 0,
            topology: None,
            connecting: None,
            link: None,
            mapper: PathMapper::default(),
            resolver: BreakpointResolver::new(),
            coordinator: Coordinator::new(),
            scopes: ScopeEngine::new(),
            pending: HashMap::new(),
            next_request_id: 1,
            supports_run_in_terminal: false,
            configuration_done: false,
            restarting: false,
            terminated_sent: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state || self.state == SessionState::Closed {
            return;
        }
        log::info!(target: "adapter", "session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Client(ClientMessage::Request(req)) => self.handle_request(req),
            Input::Client(ClientMessage::Response(resp)) => self.handle_client_response(resp),
            Input::ClientClosed => self.on_client_closed(),
            Input::Debuggee {
                generation,
                message,
            } if generation == self.generation => self.handle_debuggee_message(message),
            Input::DebuggeeClosed { generation } if generation == self.generation => {
                self.on_debuggee_closed()
            }
            Input::DebuggeeConnected { generation, result } => self.on_connected(generation, result),
            Input::Debuggee { generation, .. } | Input::DebuggeeClosed { generation } => {
                log::debug!(target: "adapter", "drop input of stale debuggee connection {generation}");
            }
        }
    }

    // --------------------------------- client requests -------------------------------------------

    fn handle_request(&mut self, req: DapRequest) {
        log::debug!(target: "adapter", "{}: {}", req.seq, req.command);

        if req.command != "disconnect" && self.disconnecting.load(Ordering::SeqCst) {
            self.send_err(&req, Error::Cancelled);
            return;
        }

        let result = match req.command.as_str() {
            "initialize" => self.initialize(&req),
            "launch" => self.launch(&req),
            "attach" => self.attach(&req),
            "restart" => self.restart(&req),
            "disconnect" => self.disconnect(&req),
            "setBreakpoints" => self.set_breakpoints(&req),
            "setExceptionBreakpoints" => self.set_exception_breakpoints(&req),
            "configurationDone" => self.configuration_done(&req),
            "threads" => self.threads(&req),
            "stackTrace" => self.stack_trace(&req),
            "scopes" => self.list_scopes(&req),
            "variables" => self.variables(&req),
            "setVariable" => self.set_variable(&req),
            "evaluate" => self.evaluate(&req),
            "exceptionInfo" => self.exception_info(&req),
            "continue" => self.resume(&req, "continue", StepMode::None),
            "next" => self.resume(&req, "next", StepMode::Over),
            "stepIn" => self.resume(&req, "stepIn", StepMode::In),
            "stepOut" => self.resume(&req, "stepOut", StepMode::Out),
            _ => self.forward(&req),
        };

        if let Err(e) = result {
            log::debug!(target: "adapter", "{} failed: {e}", req.command);
            self.send_err(&req, &e);
            if e.is_fatal() {
                self.on_fatal();
            }
        }
    }

    fn initialize(&mut self, req: &DapRequest) -> Result<(), Error> {
        self.supports_run_in_terminal = req
            .bool_arg("supportsRunInTerminalRequest")
            .unwrap_or(false);
        self.send_success_body(
            req,
            json!({
                "supportsConfigurationDoneRequest": true,
                "supportsConditionalBreakpoints": true,
                "supportsSetVariable": true,
                "supportsRestartRequest": true,
                "supportsTerminateRequest": true,
                "supportTerminateDebuggee": true,
                "supportsExceptionInfoRequest": true,
                "supportsEvaluateForHovers": true,
                "supportsStepBack": false,
                "exceptionBreakpointFilters": ExceptionFilters::capability(),
            }),
        );
        Ok(())
    }

    /// Fail unless the session may start a debuggee connection.
    fn expect_idle(&self) -> Result<(), Error> {
        if self.state != SessionState::Initializing
            || self.connecting.is_some()
            || self.link.is_some()
        {
            return Err(Error::InvalidState(self.state.into()));
        }
        Ok(())
    }

    /// Request arguments with the session wide connect timeout filled in.
    fn with_defaults(&self, arguments: &Value) -> Value {
        let mut arguments = match arguments {
            Value::Object(_) => arguments.clone(),
            _ => json!({}),
        };
        if arguments.get("connectTimeout").is_none() {
            arguments["connectTimeout"] = json!(self.options.connect_timeout);
        }
        arguments
    }

    fn launch(&mut self, req: &DapRequest) -> Result<(), Error> {
        self.expect_idle()?;
        let args = LaunchArguments::from_value(&self.with_defaults(&req.arguments))?;
        self.start_launch(req.clone(), args)
    }

    fn start_launch(&mut self, request: DapRequest, args: LaunchArguments) -> Result<(), Error> {
        if !self.supports_run_in_terminal {
            return Err(Error::InvalidConfiguration(
                "client does not support runInTerminal".into(),
            ));
        }
        let timeout = args.connect_timeout()?;
        let topology = Topology::Launch(args.clone());
        let listener = connect::bind(&topology)?;
        let exit = connect::bind_exit()?;
        let program = std::env::current_exe()?;

        let terminal_seq = self.send_reverse(
            "runInTerminal",
            connect::run_in_terminal_arguments(
                &args,
                &program,
                listener.address(),
                exit.address(),
            ),
        );
        self.mapper = PathMapper::new(topology.path_mappings());
        self.topology = Some(topology);
        self.connecting = Some(Connecting::AwaitingTerminal {
            request,
            listener,
            exit,
            timeout,
            terminal_seq,
        });
        Ok(())
    }

    fn attach(&mut self, req: &DapRequest) -> Result<(), Error> {
        self.expect_idle()?;
        let args = AttachArguments::from_value(&self.with_defaults(&req.arguments))?;
        let timeout = args.connect_timeout()?;
        let topology = Topology::from_attach(args);

        let generation = match &topology {
            Topology::Listen(_) => {
                let listener = connect::bind(&topology)?;
                let generation = self.next_generation();
                connect::spawn_accept(listener, None, timeout, generation, self.inputs.clone());
                generation
            }
            _ => {
                let target = connect::connect_target(&topology)?;
                let generation = self.next_generation();
                connect::spawn_connect(target, timeout, generation, self.inputs.clone());
                generation
            }
        };

        self.mapper = PathMapper::new(topology.path_mappings());
        self.topology = Some(topology);
        self.connecting = Some(Connecting::Waiting {
            request: req.clone(),
            generation,
        });
        Ok(())
    }

    fn restart(&mut self, req: &DapRequest) -> Result<(), Error> {
        match self.topology.clone() {
            Some(Topology::Launch(args)) => {
                if self.connecting.is_some() {
                    return Err(Error::InvalidState(self.state.into()));
                }
                let args = match req.arguments.get("arguments") {
                    Some(new_args) if new_args.is_object() => {
                        LaunchArguments::from_value(&self.with_defaults(new_args))?
                    }
                    _ => args,
                };
                log::info!(target: "adapter", "restart {}", args.playbook);

                self.set_state(SessionState::Terminating);
                self.close_debuggee(true);
                let effects = self.coordinator.reset();
                self.apply(effects);
                self.scopes.clear();
                for bp in self.resolver.reset_positions() {
                    self.send_breakpoint_changed(bp);
                }

                self.set_state(SessionState::Initializing);
                self.restarting = true;
                if let Err(e) = self.start_launch(req.clone(), args) {
                    self.fail_connect(req, e);
                }
                Ok(())
            }
            Some(_) => {
                self.send_err(req, Error::UnsupportedRestart);
                self.set_state(SessionState::Terminating);
                self.shutdown(false);
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn disconnect(&mut self, req: &DapRequest) -> Result<(), Error> {
        let terminate = req.bool_arg("terminateDebuggee").unwrap_or_else(|| {
            self.topology
                .as_ref()
                .is_some_and(Topology::is_launch)
        });
        self.set_state(SessionState::Terminating);
        self.send_success(req);
        self.shutdown(terminate);
        Ok(())
    }

    fn set_breakpoints(&mut self, req: &DapRequest) -> Result<(), Error> {
        let path = req
            .arguments
            .get("source")
            .and_then(|source| source.get("path"))
            .and_then(Value::as_str)
            .ok_or(Error::MissingArgument("setBreakpoints", "source.path"))?;
        let file = self.mapper.to_remote(path);
        let requested = SourceBreakpoint::from_arguments(&req.arguments);
        let modified = req.bool_arg("sourceModified").unwrap_or(false);

        let breakpoints = self
            .resolver
            .set_breakpoints(path, &file, &requested, modified);
        self.send_success_body(req, json!({"breakpoints": breakpoints}));
        Ok(())
    }

    fn set_exception_breakpoints(&mut self, req: &DapRequest) -> Result<(), Error> {
        let ids = req
            .arguments
            .get("filters")
            .and_then(Value::as_array)
            .map(|filters| {
                filters
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect_vec()
            })
            .unwrap_or_default();
        let filters = ExceptionFilters::from_ids(ids.as_slice());
        self.coordinator.set_exception_filters(filters);
        if self.link.is_some() {
            self.send_debuggee(&AdapterMessage::Configure {
                exception_filters: filters.ids(),
            })?;
        }

        let breakpoints = ids.iter().map(|_| json!({"verified": true})).collect_vec();
        self.send_success_body(req, json!({"breakpoints": breakpoints}));
        Ok(())
    }

    fn configuration_done(&mut self, req: &DapRequest) -> Result<(), Error> {
        self.send_debuggee(&AdapterMessage::ConfigurationDone)?;
        self.configuration_done = true;
        self.send_success(req);
        Ok(())
    }

    fn threads(&mut self, req: &DapRequest) -> Result<(), Error> {
        let threads = self.coordinator.threads();
        self.send_success_body(req, json!({"threads": threads}));
        Ok(())
    }

    fn stack_trace(&mut self, req: &DapRequest) -> Result<(), Error> {
        let thread_id = req
            .i64_arg("threadId")
            .ok_or(Error::MissingArgument("stackTrace", "threadId"))?;
        let frames = self.coordinator.stack_trace(thread_id)?;
        let total = frames.len();
        let start = req.i64_arg("startFrame").unwrap_or(0).max(0) as usize;
        let levels = req
            .i64_arg("levels")
            .filter(|levels| *levels > 0)
            .map(|levels| levels as usize)
            .unwrap_or(total);
        let stack_frames = frames
            .iter()
            .skip(start)
            .take(levels)
            .map(|frame| frame.to_dap(&self.mapper))
            .collect_vec();

        self.send_success_body(
            req,
            json!({"stackFrames": stack_frames, "totalFrames": total}),
        );
        Ok(())
    }

    /// Thread id, host and task of a stopped frame.
    fn frame_context(&self, frame_id: i64) -> Result<(i64, String, String), Error> {
        let (thread, frame) = self.coordinator.frame(frame_id)?;
        Ok((thread.id, thread.host.clone(), frame.task.task_id.clone()))
    }

    fn list_scopes(&mut self, req: &DapRequest) -> Result<(), Error> {
        let frame_id = req
            .i64_arg("frameId")
            .ok_or(Error::MissingArgument("scopes", "frameId"))?;
        let (thread_id, _, _) = self.frame_context(frame_id)?;
        let scopes = self.scopes.scopes(thread_id, frame_id);
        self.send_success_body(req, json!({"scopes": scopes}));
        Ok(())
    }

    fn variables(&mut self, req: &DapRequest) -> Result<(), Error> {
        let reference = req
            .i64_arg("variablesReference")
            .ok_or(Error::MissingArgument("variables", "variablesReference"))?;

        match self.scopes.get(reference)?.clone() {
            VarRef::Scope {
                thread_id,
                frame_id,
                scope,
            } => {
                let (_, host, task_id) = self
                    .frame_context(frame_id)
                    .map_err(|_| Error::UnknownVariablesReference(reference))?;
                self.request_debuggee(
                    Pending::Variables {
                        request: req.clone(),
                        thread_id,
                    },
                    RequestBody::Variables {
                        host,
                        task_id,
                        scope,
                    },
                )
            }
            VarRef::Child { thread_id, value } => {
                let variables = self.scopes.render_children(thread_id, &value);
                self.send_success_body(req, json!({"variables": page(variables, req)}));
                Ok(())
            }
        }
    }

    fn set_variable(&mut self, req: &DapRequest) -> Result<(), Error> {
        let reference = req
            .i64_arg("variablesReference")
            .ok_or(Error::MissingArgument("setVariable", "variablesReference"))?;
        let name = req
            .str_arg("name")
            .ok_or(Error::MissingArgument("setVariable", "name"))?;
        let value = req
            .str_arg("value")
            .ok_or(Error::MissingArgument("setVariable", "value"))?;

        match self.scopes.get(reference)?.clone() {
            VarRef::Child { .. } => Err(Error::NestedSetVariable),
            VarRef::Scope {
                thread_id,
                frame_id,
                scope,
            } => {
                let (_, host, task_id) = self
                    .frame_context(frame_id)
                    .map_err(|_| Error::UnknownVariablesReference(reference))?;
                self.request_debuggee(
                    Pending::SetVariable {
                        request: req.clone(),
                        thread_id,
                    },
                    RequestBody::SetVariable {
                        host,
                        task_id,
                        scope,
                        name: name.to_string(),
                        expression: variables::template(value),
                    },
                )
            }
        }
    }

    fn evaluate(&mut self, req: &DapRequest) -> Result<(), Error> {
        let expression = req
            .str_arg("expression")
            .ok_or(Error::MissingArgument("evaluate", "expression"))?;
        let frame_id = req.i64_arg("frameId").ok_or_else(|| {
            Error::Evaluation("expressions can only be evaluated in a stopped frame".into())
        })?;
        let (thread_id, host, task_id) = self.frame_context(frame_id)?;
        self.request_debuggee(
            Pending::Evaluate {
                request: req.clone(),
                thread_id,
            },
            RequestBody::Evaluate {
                host,
                task_id,
                expression: variables::template(expression),
                context: req.str_arg("context").map(ToString::to_string),
            },
        )
    }

    fn exception_info(&mut self, req: &DapRequest) -> Result<(), Error> {
        let thread_id = req
            .i64_arg("threadId")
            .ok_or(Error::MissingArgument("exceptionInfo", "threadId"))?;
        let body = self.coordinator.exception_info(thread_id)?;
        self.send_success_body(req, body);
        Ok(())
    }

    fn resume(&mut self, req: &DapRequest, command: &'static str, mode: StepMode) -> Result<(), Error> {
        let thread_id = req
            .i64_arg("threadId")
            .ok_or(Error::MissingArgument(command, "threadId"))?;
        if self.link.is_none() {
            return Err(Error::NotConnected);
        }
        let effects = self.coordinator.resume(thread_id, mode)?;
        self.scopes.invalidate_thread(thread_id);

        if mode == StepMode::None {
            self.send_success_body(req, json!({"allThreadsContinued": false}));
        } else {
            self.send_success(req);
        }
        self.apply(effects);
        Ok(())
    }

    /// Relay a request the adapter does not handle itself.
    fn forward(&mut self, req: &DapRequest) -> Result<(), Error> {
        self.request_debuggee(
            Pending::Forward(req.clone()),
            RequestBody::Forward {
                command: req.command.clone(),
                arguments: req.arguments.clone(),
            },
        )
    }

    fn request_debuggee(&mut self, pending: Pending, body: RequestBody) -> Result<(), Error> {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.send_debuggee(&AdapterMessage::Request { id, body })?;
        self.pending.insert(id, pending);
        Ok(())
    }

    fn handle_client_response(&mut self, resp: ClientResponse) {
        let expected = matches!(
            &self.connecting,
            Some(Connecting::AwaitingTerminal { terminal_seq, .. }) if *terminal_seq == resp.request_seq
        );
        if !expected {
            log::debug!(target: "adapter", "unexpected {} response {}", resp.command, resp.request_seq);
            return;
        }
        let Some(Connecting::AwaitingTerminal {
            request,
            listener,
            exit,
            timeout,
            ..
        }) = self.connecting.take()
        else {
            return;
        };

        if !resp.success {
            let message = resp.message.unwrap_or_else(|| "unknown error".to_string());
            self.fail_connect(&request, Error::Terminal(message));
            return;
        }
        if let Some(pid) = resp.body.get("processId").and_then(Value::as_i64) {
            log::info!(target: "adapter", "debuggee started with pid {pid}");
        }

        let generation = self.next_generation();
        connect::spawn_accept(
            listener,
            Some(exit),
            timeout,
            generation,
            self.inputs.clone(),
        );
        self.connecting = Some(Connecting::Waiting {
            request,
            generation,
        });
    }

    // --------------------------------- debuggee connection ---------------------------------------

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn on_connected(&mut self, generation: u64, result: Result<DebuggeeChannel, Error>) {
        let waiting = matches!(
            &self.connecting,
            Some(Connecting::Waiting { generation: g, .. }) if *g == generation
        );
        if !waiting {
            if let Ok(channel) = result {
                log::debug!(target: "adapter", "drop stale debuggee connection {generation}");
                channel.closer.close();
            }
            return;
        }
        let Some(Connecting::Waiting { request, .. }) = self.connecting.take() else {
            return;
        };

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_connect(&request, e);
                return;
            }
        };
        let DebuggeeChannel {
            reader,
            writer,
            closer,
        } = channel;
        spawn_debuggee_reader(reader, generation, self.inputs.clone());
        self.link = Some(DebuggeeLink { writer, closer });
        self.terminated_sent = false;
        self.set_state(SessionState::Running);
        self.send_success(&request);

        let filters = self.coordinator.exception_filters();
        let mut result = self.send_debuggee(&AdapterMessage::Configure {
            exception_filters: filters.ids(),
        });
        if self.restarting {
            // the client configured the previous run already and does not do it again
            self.restarting = false;
            if result.is_ok() && self.configuration_done {
                result = self.send_debuggee(&AdapterMessage::ConfigurationDone);
            }
        } else {
            self.send_event(OutgoingEvent::bare("initialized"));
        }
        if let Err(e) = result {
            log::warn!(target: "debuggee", "configure debuggee: {e}");
            self.on_debuggee_closed();
        }
    }

    /// Connection attempt for `request` failed, transport failures end the session.
    fn fail_connect(&mut self, request: &DapRequest, error: Error) {
        log::debug!(target: "adapter", "{} failed: {error}", request.command);
        self.send_err(request, &error);
        self.connecting = None;
        self.topology = None;
        let restarting = std::mem::take(&mut self.restarting);
        if restarting || error.is_fatal() {
            self.set_state(SessionState::Terminating);
            self.send_terminated();
        }
    }

    /// A transport error hit the session outside of a connection attempt.
    fn on_fatal(&mut self) {
        if self.link.is_some() {
            self.on_debuggee_closed();
        } else if self.state == SessionState::Initializing {
            self.connecting = None;
            self.set_state(SessionState::Terminating);
            self.send_terminated();
        }
    }

    fn send_debuggee(&mut self, message: &AdapterMessage) -> Result<(), Error> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;
        log::trace!(target: "debuggee", "-> {message:?}");
        wire::write_frame(&mut link.writer, message)
    }

    fn fail_pending(&mut self) {
        let pending = self.pending.drain().sorted_by_key(|(id, _)| *id).collect_vec();
        for (_, p) in pending {
            self.send_err(p.request(), Error::DebuggeeDisconnected);
        }
    }

    /// Ask the debuggee to go away and drop the connection.
    fn close_debuggee(&mut self, terminate: bool) {
        self.generation += 1;
        if let Some(mut link) = self.link.take() {
            let message = AdapterMessage::Disconnect {
                terminate_debuggee: terminate,
            };
            if let Err(e) = wire::write_frame(&mut link.writer, &message) {
                log::debug!(target: "debuggee", "disconnect not delivered: {e}");
            }
            link.closer.close();
        }
        self.fail_pending();
    }

    fn shutdown(&mut self, terminate: bool) {
        self.close_debuggee(terminate);
        self.connecting = None;
        self.send_terminated();
        self.set_state(SessionState::Closed);
    }

    fn on_debuggee_closed(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        log::info!(target: "adapter", "debuggee connection lost");
        self.generation += 1;
        link.closer.close();
        self.fail_pending();
        self.set_state(SessionState::Terminating);
        self.send_terminated();
    }

    fn on_client_closed(&mut self) {
        let terminate = self
            .topology
            .as_ref()
            .is_some_and(Topology::is_launch);
        self.set_state(SessionState::Closed);
        self.close_debuggee(terminate);
        self.connecting = None;
    }

    // --------------------------------- debuggee messages -----------------------------------------

    fn handle_debuggee_message(&mut self, message: DebuggeeMessage) {
        match message {
            DebuggeeMessage::TasksDiscovered { file, positions } => {
                for bp in self.resolver.insert_positions(&file, positions) {
                    self.send_breakpoint_changed(bp);
                }
            }
            DebuggeeMessage::TaskStart { host, task, parent } => {
                let effects =
                    self.coordinator
                        .on_task_start(&host, task, parent.as_deref(), &self.resolver);
                self.apply(effects);
            }
            DebuggeeMessage::TaskEnd { host, task_id } => {
                self.coordinator.on_task_end(&host, &task_id);
            }
            DebuggeeMessage::HostEnded { host } => {
                if let Some(thread) = self.coordinator.thread_by_host(&host) {
                    let thread_id = thread.id;
                    self.scopes.invalidate_thread(thread_id);
                }
                let effects = self.coordinator.on_host_ended(&host);
                self.apply(effects);
            }
            DebuggeeMessage::Exception {
                host,
                task_id,
                kind,
                result,
            } => {
                let effects = self.coordinator.on_exception(&host, &task_id, kind, &result);
                self.apply(effects);
            }
            DebuggeeMessage::ConditionResult {
                token,
                matched,
                error,
                ..
            } => {
                let effects = self
                    .coordinator
                    .on_condition_result(token, matched, error.as_deref());
                self.apply(effects);
            }
            DebuggeeMessage::Reply {
                id,
                success,
                message,
                body,
            } => self.handle_reply(id, success, message, body),
            DebuggeeMessage::Event { event, body } => match event.as_str() {
                "terminated" => self.send_terminated(),
                "initialized" => {}
                _ => self.send_event(OutgoingEvent { event, body }),
            },
        }
    }

    fn thread_stopped(&self, thread_id: i64) -> bool {
        self.coordinator
            .thread(thread_id)
            .is_ok_and(|t| t.status == ThreadStatus::Stopped)
    }

    fn handle_reply(&mut self, id: u64, success: bool, message: Option<String>, body: Option<Value>) {
        let Some(pending) = self.pending.remove(&id) else {
            log::warn!(target: "debuggee", "reply to unknown request {id}");
            return;
        };
        if !success {
            let message = message.unwrap_or_else(|| "request failed".to_string());
            self.send_err(pending.request(), message);
            return;
        }

        match pending {
            Pending::Forward(request) => self.send_response(&request, true, None, body),
            Pending::Variables { request, thread_id } => {
                if !self.thread_stopped(thread_id) {
                    self.send_err(&request, Error::ThreadNotStopped(thread_id));
                    return;
                }
                let values = body
                    .as_ref()
                    .and_then(|b| b.get("variables"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let variables = self.scopes.render_map(thread_id, &values);
                self.send_success_body(&request, json!({"variables": page(variables, &request)}));
            }
            Pending::SetVariable { request, thread_id } => {
                let value = body
                    .as_ref()
                    .and_then(|b| b.get("value"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let body = self.rendered(thread_id, &value, "value");
                self.send_success_body(&request, body);
            }
            Pending::Evaluate { request, thread_id } => {
                let value = body
                    .as_ref()
                    .and_then(|b| b.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let body = self.rendered(thread_id, &value, "result");
                self.send_success_body(&request, body);
            }
        }
    }

    /// Reply body for a single value under key `key`.
    fn rendered(&mut self, thread_id: i64, value: &Value, key: &str) -> Value {
        let reference = if self.thread_stopped(thread_id) {
            self.scopes.reference_for(thread_id, value)
        } else {
            0
        };
        let mut body = json!({
            "type": variables::type_name(value),
            "variablesReference": reference,
        });
        body[key] = json!(variables::display_value(value));
        body
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Event(event) => self.send_event(event),
                Effect::Send(message) => {
                    if let Err(e) = self.send_debuggee(&message) {
                        log::warn!(target: "debuggee", "send to debuggee: {e}");
                        self.on_debuggee_closed();
                        return;
                    }
                }
            }
        }
    }

    // --------------------------------- client output ---------------------------------------------

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn write<T: Serialize>(&mut self, message: &T) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.writer.write_message(message) {
            log::warn!(target: "dap", "write to client failed: {e}");
            self.on_client_closed();
        }
    }

    fn send_response(
        &mut self,
        request: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        let response = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        self.write(&response);
    }

    fn send_success(&mut self, request: &DapRequest) {
        self.send_response(request, true, None, None);
    }

    fn send_success_body(&mut self, request: &DapRequest, body: Value) {
        self.send_response(request, true, None, Some(body));
    }

    fn send_err(&mut self, request: &DapRequest, error: impl Display) {
        self.send_response(request, false, Some(error.to_string()), None);
    }

    fn send_event(&mut self, event: OutgoingEvent) {
        let event = DapEvent {
            seq: self.next_seq(),
            r#type: "event",
            event: event.event,
            body: event.body,
        };
        self.write(&event);
    }

    fn send_breakpoint_changed(&mut self, breakpoint: Value) {
        self.send_event(OutgoingEvent::new(
            "breakpoint",
            json!({"reason": "changed", "breakpoint": breakpoint}),
        ));
    }

    fn send_terminated(&mut self) {
        if !self.terminated_sent {
            self.terminated_sent = true;
            self.send_event(OutgoingEvent::bare("terminated"));
        }
    }

    fn send_reverse(&mut self, command: &'static str, arguments: Value) -> i64 {
        let seq = self.next_seq();
        self.write(&DapReverseRequest {
            seq,
            r#type: "request",
            command,
            arguments,
        });
        seq
    }
}

/// Apply `start` and `count` of a `variables` request.
fn page(items: Vec<Value>, req: &DapRequest) -> Vec<Value> {
    let start = req.i64_arg("start").unwrap_or(0).max(0) as usize;
    let count = req
        .i64_arg("count")
        .filter(|count| *count > 0)
        .map(|count| count as usize)
        .unwrap_or(usize::MAX);
    items.into_iter().skip(start).take(count).collect()
}
