//! Per-host execution state.
//!
//! Every host the playbook runs on is a DAP thread, thread [`MAIN_THREAD_ID`] stands for the
//! strategy that drives the hosts and never stops. The debuggee reports every task boundary
//! of a host and then waits until the adapter decides whether the host stops or runs on.
//! The coordinator makes that decision, it does no I/O: the result of every operation is a
//! list of [`Effect`]s the session applies in order.

use crate::adapter::breakpoint::BreakpointResolver;
use crate::dap::pathmap::PathMapper;
use crate::dap::protocol::OutgoingEvent;
use crate::debuggee::wire::{AdapterMessage, ExceptionKind, TaskInfo};
use crate::error::Error;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};

pub const MAIN_THREAD_ID: i64 = 1;
pub const MAIN_THREAD_NAME: &str = "main";

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Event for the client.
    Event(OutgoingEvent),
    /// Message for the debuggee.
    Send(AdapterMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Stopped,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    None,
    Over,
    In,
    Out,
}

/// One level of a stopped thread call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: i64,
    pub task: TaskInfo,
}

impl Frame {
    pub fn to_dap(&self, mapper: &PathMapper) -> Value {
        let mut frame = json!({
            "id": self.id,
            "name": self.task.name,
            "line": self.task.line.unwrap_or(0),
            "column": if self.task.line.is_some() { 1 } else { 0 },
        });
        if let Some(file) = &self.task.file {
            let path = mapper.to_local(file);
            let name = std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            frame["source"] = json!({"name": name, "path": path});
        } else {
            frame["presentationHint"] = json!("subtle");
        }
        frame
    }
}

/// Why a thread is stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StopInfo {
    pub reason: &'static str,
    pub description: Option<String>,
    pub text: Option<String>,
    pub exception: Option<ExceptionKind>,
    pub hit_breakpoints: Vec<i64>,
}

impl StopInfo {
    fn new(reason: &'static str) -> Self {
        Self {
            reason,
            description: None,
            text: None,
            exception: None,
            hit_breakpoints: vec![],
        }
    }
}

/// Exception classes that stop a host, configured with `setExceptionBreakpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFilters {
    pub failed: bool,
    pub unreachable: bool,
    pub skipped: bool,
}

impl Default for ExceptionFilters {
    fn default() -> Self {
        Self {
            failed: true,
            unreachable: true,
            skipped: false,
        }
    }
}

impl ExceptionFilters {
    pub const FAILED: &'static str = "on_failed";
    pub const UNREACHABLE: &'static str = "on_unreachable";
    pub const SKIPPED: &'static str = "on_skipped";

    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Self {
        let has = |id: &str| ids.iter().any(|i| i.as_ref() == id);
        Self {
            failed: has(Self::FAILED),
            unreachable: has(Self::UNREACHABLE),
            skipped: has(Self::SKIPPED),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        [
            (self.failed, Self::FAILED),
            (self.unreachable, Self::UNREACHABLE),
            (self.skipped, Self::SKIPPED),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, id)| id.to_string())
        .collect()
    }

    pub fn enabled(&self, kind: ExceptionKind) -> bool {
        match kind {
            ExceptionKind::Failed => self.failed,
            ExceptionKind::Unreachable => self.unreachable,
            ExceptionKind::Skipped => self.skipped,
        }
    }

    /// `exceptionBreakpointFilters` capability.
    pub fn capability() -> Value {
        let defaults = Self::default();
        json!([
            {"filter": Self::FAILED, "label": "Task failed", "default": defaults.failed},
            {"filter": Self::UNREACHABLE, "label": "Host unreachable", "default": defaults.unreachable},
            {"filter": Self::SKIPPED, "label": "Task skipped", "default": defaults.skipped},
        ])
    }
}

#[derive(Debug)]
pub struct HostThread {
    pub id: i64,
    pub host: String,
    pub status: ThreadStatus,
    /// Live task stack, enclosing includes first.
    stack: Vec<TaskInfo>,
    /// Frames visible to the client while stopped, innermost first.
    snapshot: Vec<Frame>,
    step: StepMode,
    /// Include depth of the task the pending step started from.
    step_depth: usize,
    stop: Option<StopInfo>,
}

impl HostThread {
    fn new(id: i64, host: &str) -> Self {
        Self {
            id,
            host: host.to_string(),
            status: ThreadStatus::Running,
            stack: vec![],
            snapshot: vec![],
            step: StepMode::None,
            step_depth: 0,
            stop: None,
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.snapshot
    }

    pub fn stop_info(&self) -> Option<&StopInfo> {
        self.stop.as_ref()
    }

    /// Number of includes the current task sits in.
    fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    fn step_complete(&self, depth: usize) -> bool {
        match self.step {
            StepMode::None => false,
            StepMode::In => true,
            StepMode::Over => depth <= self.step_depth,
            StepMode::Out => depth < self.step_depth,
        }
    }
}

/// Breakpoint conditions waiting for evaluation by the debuggee.
#[derive(Debug)]
struct PendingCheck {
    host: String,
    candidates: VecDeque<(i64, String)>,
}

#[derive(Debug)]
pub struct Coordinator {
    threads: IndexMap<String, HostThread>,
    ids: HashMap<i64, String>,
    /// Frame id to (thread id, index in the snapshot).
    frames: HashMap<i64, (i64, usize)>,
    next_thread_id: i64,
    next_frame_id: i64,
    next_token: u64,
    checks: HashMap<u64, PendingCheck>,
    filters: ExceptionFilters,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            threads: IndexMap::new(),
            ids: HashMap::new(),
            frames: HashMap::new(),
            next_thread_id: MAIN_THREAD_ID + 1,
            next_frame_id: 1,
            next_token: 1,
            checks: HashMap::new(),
            filters: ExceptionFilters::default(),
        }
    }

    pub fn exception_filters(&self) -> ExceptionFilters {
        self.filters
    }

    pub fn set_exception_filters(&mut self, filters: ExceptionFilters) {
        self.filters = filters;
    }

    /// `threads` response body items.
    pub fn threads(&self) -> Vec<Value> {
        let mut threads = vec![json!({"id": MAIN_THREAD_ID, "name": MAIN_THREAD_NAME})];
        threads.extend(
            self.threads
                .values()
                .filter(|t| t.status != ThreadStatus::Terminated)
                .map(|t| json!({"id": t.id, "name": t.host})),
        );
        threads
    }

    pub fn thread(&self, thread_id: i64) -> Result<&HostThread, Error> {
        self.ids
            .get(&thread_id)
            .and_then(|host| self.threads.get(host))
            .ok_or(Error::UnknownThread(thread_id))
    }

    pub fn thread_by_host(&self, host: &str) -> Option<&HostThread> {
        self.threads.get(host)
    }

    fn thread_mut(&mut self, host: &str, effects: &mut Vec<Effect>) -> &mut HostThread {
        if !self.threads.contains_key(host) {
            let id = self.next_thread_id;
            self.next_thread_id += 1;
            self.ids.insert(id, host.to_string());
            self.threads.insert(host.to_string(), HostThread::new(id, host));
            log::debug!(target: "adapter", "new thread {id} for host {host}");
            effects.push(Effect::Event(OutgoingEvent::new(
                "thread",
                json!({"reason": "started", "threadId": id}),
            )));
        }
        &mut self.threads[host]
    }

    /// Host `host` is about to run `task`, `parent` is the include the task comes from.
    pub fn on_task_start(
        &mut self,
        host: &str,
        task: TaskInfo,
        parent: Option<&str>,
        breakpoints: &BreakpointResolver,
    ) -> Vec<Effect> {
        let mut effects = vec![];
        let thread = self.thread_mut(host, &mut effects);

        match thread.status {
            ThreadStatus::Terminated => {
                log::warn!(target: "adapter", "task start for finished host {host}, resume it");
                effects.push(Effect::Send(AdapterMessage::Resume {
                    host: host.to_string(),
                }));
                return effects;
            }
            ThreadStatus::Stopped => {
                log::warn!(target: "adapter", "task start for stopped host {host}");
                let thread_id = thread.id;
                self.invalidate_frames(thread_id);
                let thread = &mut self.threads[host];
                thread.status = ThreadStatus::Running;
                thread.stop = None;
            }
            ThreadStatus::Running => {}
        }

        let thread = &mut self.threads[host];
        // leave include contexts the new task is not part of
        match parent {
            Some(parent) => {
                while let Some(top) = thread.stack.last() {
                    if top.task_id == parent {
                        break;
                    }
                    thread.stack.pop();
                }
            }
            None => thread.stack.clear(),
        }
        let depth = thread.stack.len();
        let location = task.file.clone().zip(task.line);
        thread.stack.push(task);

        if thread.step_complete(depth) {
            effects.extend(self.stop(host, StopInfo::new("step")));
            return effects;
        }

        let Some((file, line)) = location else {
            effects.push(Effect::Send(AdapterMessage::Resume {
                host: host.to_string(),
            }));
            return effects;
        };
        let hits = breakpoints.hits(&file, line);
        let unconditional: Vec<i64> = hits
            .iter()
            .filter(|bp| bp.condition.is_none())
            .map(|bp| bp.id)
            .collect();
        if !unconditional.is_empty() {
            let mut info = StopInfo::new("breakpoint");
            info.hit_breakpoints = unconditional;
            effects.extend(self.stop(host, info));
            return effects;
        }

        let candidates: VecDeque<(i64, String)> = hits
            .iter()
            .filter_map(|bp| bp.condition.clone().map(|c| (bp.id, c)))
            .collect();
        if candidates.is_empty() {
            effects.push(Effect::Send(AdapterMessage::Resume {
                host: host.to_string(),
            }));
        } else {
            effects.extend(self.check_next_condition(PendingCheck {
                host: host.to_string(),
                candidates,
            }));
        }
        effects
    }

    fn check_next_condition(&mut self, check: PendingCheck) -> Vec<Effect> {
        let host = check.host.clone();
        let Some((_, expression)) = check.candidates.front().cloned() else {
            return vec![Effect::Send(AdapterMessage::Resume { host })];
        };
        let token = self.next_token;
        self.next_token += 1;
        self.checks.insert(token, check);
        vec![Effect::Send(AdapterMessage::EvaluateCondition {
            token,
            host,
            expression,
        })]
    }

    /// Debuggee answered a condition evaluation, evaluation errors count as false.
    pub fn on_condition_result(
        &mut self,
        token: u64,
        matched: Option<bool>,
        error: Option<&str>,
    ) -> Vec<Effect> {
        let Some(mut check) = self.checks.remove(&token) else {
            log::warn!(target: "adapter", "result for unknown condition token {token}");
            return vec![];
        };
        let Some((bp_id, expression)) = check.candidates.pop_front() else {
            return vec![];
        };
        if let Some(error) = error {
            log::info!(target: "adapter", "condition `{expression}` failed: {error}");
        }
        let still_running = self
            .threads
            .get(&check.host)
            .is_some_and(|t| t.status == ThreadStatus::Running);
        if !still_running {
            return vec![];
        }

        if error.is_none() && matched == Some(true) {
            let mut info = StopInfo::new("breakpoint");
            info.hit_breakpoints = vec![bp_id];
            return self.stop(&check.host, info);
        }
        self.check_next_condition(check)
    }

    /// Current task of the host ended, include tasks stay until their children are done.
    pub fn on_task_end(&mut self, host: &str, task_id: &str) {
        let Some(thread) = self.threads.get_mut(host) else {
            return;
        };
        if thread
            .stack
            .last()
            .is_some_and(|top| top.task_id == task_id && !top.is_include)
        {
            thread.stack.pop();
        }
    }

    pub fn on_host_ended(&mut self, host: &str) -> Vec<Effect> {
        let Some(thread) = self.threads.get_mut(host) else {
            return vec![];
        };
        if thread.status == ThreadStatus::Terminated {
            return vec![];
        }
        thread.status = ThreadStatus::Terminated;
        thread.stack.clear();
        thread.step = StepMode::None;
        thread.stop = None;
        let thread_id = thread.id;
        self.invalidate_frames(thread_id);
        self.checks.retain(|_, c| c.host != host);
        vec![Effect::Event(OutgoingEvent::new(
            "thread",
            json!({"reason": "exited", "threadId": thread_id}),
        ))]
    }

    /// Host hit a failure class. The debuggee already applied `ignore_errors`, rescue blocks
    /// and similar rules, only the exception filters are left to check.
    pub fn on_exception(
        &mut self,
        host: &str,
        task_id: &str,
        kind: ExceptionKind,
        result: &Value,
    ) -> Vec<Effect> {
        let mut effects = vec![];
        let filters = self.filters;
        let thread = self.thread_mut(host, &mut effects);
        if thread.status != ThreadStatus::Running || !filters.enabled(kind) {
            effects.push(Effect::Send(AdapterMessage::Resume {
                host: host.to_string(),
            }));
            return effects;
        }
        if thread.stack.last().is_none_or(|top| top.task_id != task_id) {
            log::debug!(target: "adapter", "exception of task {task_id} is not on top of the {host} stack");
        }

        let (description, details) = describe_exception(kind, result);
        let mut info = StopInfo::new("exception");
        info.text = Some(format!("{description}\n{details}"));
        info.description = Some(description.to_string());
        info.exception = Some(kind);
        effects.extend(self.stop(host, info));
        effects
    }

    fn stop(&mut self, host: &str, info: StopInfo) -> Vec<Effect> {
        let mut frame_id = self.next_frame_id;
        let thread = &mut self.threads[host];
        thread.status = ThreadStatus::Stopped;
        thread.step = StepMode::None;
        thread.snapshot = thread
            .stack
            .iter()
            .rev()
            .map(|task| {
                let frame = Frame {
                    id: frame_id,
                    task: task.clone(),
                };
                frame_id += 1;
                frame
            })
            .collect();
        self.next_frame_id = frame_id;
        for (idx, frame) in thread.snapshot.iter().enumerate() {
            self.frames.insert(frame.id, (thread.id, idx));
        }

        let mut body = json!({
            "reason": info.reason,
            "threadId": thread.id,
            "allThreadsStopped": false,
            "preserveFocusHint": false,
        });
        if let Some(description) = &info.description {
            body["description"] = json!(description);
        }
        if let Some(text) = &info.text {
            body["text"] = json!(text);
        }
        if !info.hit_breakpoints.is_empty() {
            body["hitBreakpointIds"] = json!(info.hit_breakpoints);
        }
        log::info!(target: "adapter", "host {host} stopped: {}", info.reason);
        thread.stop = Some(info);
        vec![Effect::Event(OutgoingEvent::new("stopped", body))]
    }

    fn invalidate_frames(&mut self, thread_id: i64) {
        self.frames.retain(|_, (owner, _)| *owner != thread_id);
        if let Some(thread) = self.ids.get(&thread_id).and_then(|h| self.threads.get_mut(h)) {
            thread.snapshot.clear();
        }
    }

    /// Let a stopped thread run with `mode`, fails without state change when the thread
    /// is not stopped.
    pub fn resume(&mut self, thread_id: i64, mode: StepMode) -> Result<Vec<Effect>, Error> {
        if thread_id == MAIN_THREAD_ID {
            return Err(Error::ThreadNotStopped(thread_id));
        }
        let thread = self.thread(thread_id)?;
        if thread.status != ThreadStatus::Stopped {
            return Err(Error::ThreadNotStopped(thread_id));
        }
        let host = thread.host.clone();

        self.invalidate_frames(thread_id);
        let thread = &mut self.threads[&host];
        thread.step_depth = thread.depth();
        thread.step = mode;
        thread.status = ThreadStatus::Running;
        thread.stop = None;
        log::debug!(target: "adapter", "host {host} resumed with {mode:?}");

        Ok(vec![
            Effect::Send(AdapterMessage::Resume { host }),
            Effect::Event(OutgoingEvent::new(
                "continued",
                json!({"threadId": thread_id, "allThreadsContinued": false}),
            )),
        ])
    }

    /// Frames of a stopped thread, innermost first.
    pub fn stack_trace(&self, thread_id: i64) -> Result<&[Frame], Error> {
        if thread_id == MAIN_THREAD_ID {
            return Err(Error::ThreadNotStopped(thread_id));
        }
        let thread = self.thread(thread_id)?;
        if thread.status != ThreadStatus::Stopped {
            return Err(Error::ThreadNotStopped(thread_id));
        }
        Ok(thread.frames())
    }

    /// Frame of a stopped thread by id, with the owning thread.
    pub fn frame(&self, frame_id: i64) -> Result<(&HostThread, &Frame), Error> {
        let (thread_id, idx) = self
            .frames
            .get(&frame_id)
            .ok_or(Error::UnknownFrame(frame_id))?;
        let thread = self.thread(*thread_id)?;
        let frame = thread
            .snapshot
            .get(*idx)
            .ok_or(Error::UnknownFrame(frame_id))?;
        Ok((thread, frame))
    }

    /// `exceptionInfo` body for a thread stopped on an exception.
    pub fn exception_info(&self, thread_id: i64) -> Result<Value, Error> {
        let thread = self.thread(thread_id)?;
        let info = thread
            .stop
            .as_ref()
            .filter(|_| thread.status == ThreadStatus::Stopped)
            .ok_or(Error::ThreadNotStopped(thread_id))?;
        let Some(kind) = info.exception else {
            return Err(Error::Evaluation(format!(
                "thread {thread_id} is not stopped on an exception"
            )));
        };
        let filter = match kind {
            ExceptionKind::Failed => ExceptionFilters::FAILED,
            ExceptionKind::Unreachable => ExceptionFilters::UNREACHABLE,
            ExceptionKind::Skipped => ExceptionFilters::SKIPPED,
        };
        Ok(json!({
            "exceptionId": filter,
            "description": info.text,
            "breakMode": "always",
            "details": {"message": info.description},
        }))
    }

    /// Forget all hosts, used before the playbook runs again.
    pub fn reset(&mut self) -> Vec<Effect> {
        let effects = self
            .threads
            .values()
            .filter(|t| t.status != ThreadStatus::Terminated)
            .map(|t| {
                Effect::Event(OutgoingEvent::new(
                    "thread",
                    json!({"reason": "exited", "threadId": t.id}),
                ))
            })
            .collect();
        self.threads.clear();
        self.ids.clear();
        self.frames.clear();
        self.checks.clear();
        effects
    }
}

/// Title and details of an exception stop built from the task result.
pub fn describe_exception(kind: ExceptionKind, result: &Value) -> (&'static str, String) {
    let field = |name: &str| {
        result
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };
    match kind {
        ExceptionKind::Failed | ExceptionKind::Unreachable => {
            let title = if kind == ExceptionKind::Failed {
                "Task failed"
            } else {
                "Host unreachable"
            };
            let mut details = field("msg")
                .or_else(|| field("stdout"))
                .unwrap_or("Unknown error")
                .to_string();
            if let Some(exception) = field("exception") {
                details.push_str("\n\n");
                details.push_str(exception);
            }
            (title, details)
        }
        ExceptionKind::Skipped => {
            let mut details = field("skip_reason").unwrap_or("Unknown reason").to_string();
            if let Some(condition) = field("false_condition") {
                details.push_str("\n\nFalse condition: ");
                details.push_str(condition);
            }
            ("Task skipped", details)
        }
    }
}
