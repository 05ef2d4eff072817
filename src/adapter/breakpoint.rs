//! Source breakpoints and the task position index they resolve against.
//!
//! Task positions of a file arrive from the debuggee when the file is loaded, statically at
//! playbook start or later when an include is processed. A requested line snaps to the
//! closest known task at or before it. Lines of container constructs (block headers,
//! `rescue`/`always` sections) have no position of their own and snap to the preceding task.

use crate::debuggee::wire::PositionInfo;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};

pub const MSG_NOT_LOADED: &str = "File not loaded in current playbook.";
pub const MSG_NO_TASK: &str = "No task at or before this line.";
pub const MSG_NOT_BREAKABLE: &str = "Breakpoint cannot be set here.";
pub const MSG_SOURCE_MODIFIED: &str = "Cannot set breakpoint on modified source.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Unverified,
    Verified,
    /// Resolves to a position that never runs as a task (static import, role list).
    Invalid,
}

/// Known task start, indexed by file and line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPosition {
    pub task_id: String,
    pub breakable: bool,
}

/// Result of snapping a requested line to the position index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub line: Option<i64>,
    pub state: Verification,
    pub message: Option<&'static str>,
}

/// Breakpoint as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBreakpoint {
    pub line: i64,
    pub condition: Option<String>,
}

impl SourceBreakpoint {
    /// Parse `breakpoints` of a `setBreakpoints` request, empty conditions are dropped.
    pub fn from_arguments(arguments: &Value) -> Vec<Self> {
        let Some(list) = arguments.get("breakpoints").and_then(Value::as_array) else {
            return arguments
                .get("lines")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_i64)
                        .map(|line| SourceBreakpoint {
                            line,
                            condition: None,
                        })
                        .collect()
                })
                .unwrap_or_default();
        };
        list.iter()
            .filter_map(|bp| {
                let line = bp.get("line").and_then(Value::as_i64)?;
                let condition = bp
                    .get("condition")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(ToString::to_string);
                Some(SourceBreakpoint { line, condition })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: i64,
    /// Path in terms of the client.
    pub source_path: String,
    pub line: i64,
    pub condition: Option<String>,
    pub resolution: Resolution,
    source_modified: bool,
}

impl Breakpoint {
    pub fn verified(&self) -> bool {
        self.resolution.state == Verification::Verified
    }

    pub fn to_dap(&self) -> Value {
        let mut bp = json!({
            "id": self.id,
            "verified": self.verified(),
            "line": self.resolution.line.unwrap_or(self.line),
            "source": {"path": self.source_path},
        });
        if let Some(msg) = self.resolution.message {
            bp["message"] = json!(msg);
        }
        match self.resolution.state {
            Verification::Unverified => bp["reason"] = json!("pending"),
            Verification::Invalid => bp["reason"] = json!("failed"),
            Verification::Verified => {}
        }
        bp
    }
}

pub struct BreakpointResolver {
    /// Ordered task positions per debuggee file.
    index: HashMap<String, BTreeMap<i64, TaskPosition>>,
    /// Breakpoints per debuggee file.
    breakpoints: IndexMap<String, Vec<Breakpoint>>,
    next_id: i64,
}

impl Default for BreakpointResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointResolver {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            breakpoints: IndexMap::new(),
            next_id: 1,
        }
    }

    /// Snap `line` of `file` to the greatest known task position at or before it.
    pub fn resolve(&self, file: &str, line: i64) -> Resolution {
        let Some(positions) = self.index.get(file).filter(|p| !p.is_empty()) else {
            return Resolution {
                line: None,
                state: Verification::Unverified,
                message: Some(MSG_NOT_LOADED),
            };
        };
        match positions.range(..=line).next_back() {
            None => Resolution {
                line: None,
                state: Verification::Unverified,
                message: Some(MSG_NO_TASK),
            },
            Some((&pos_line, pos)) if !pos.breakable => Resolution {
                line: Some(pos_line),
                state: Verification::Invalid,
                message: Some(MSG_NOT_BREAKABLE),
            },
            Some((&pos_line, _)) => Resolution {
                line: Some(pos_line),
                state: Verification::Verified,
                message: None,
            },
        }
    }

    fn resolve_breakpoint(&self, file: &str, bp: &Breakpoint) -> Resolution {
        if bp.source_modified {
            return Resolution {
                line: None,
                state: Verification::Unverified,
                message: Some(MSG_SOURCE_MODIFIED),
            };
        }
        self.resolve(file, bp.line)
    }

    /// Replace all breakpoints of a source, return their DAP representation in request order.
    ///
    /// Breakpoints that stay on the same line keep their ids.
    pub fn set_breakpoints(
        &mut self,
        source_path: &str,
        file: &str,
        requested: &[SourceBreakpoint],
        source_modified: bool,
    ) -> Vec<Value> {
        let previous = self.breakpoints.shift_remove(file).unwrap_or_default();

        let mut new_bps = Vec::with_capacity(requested.len());
        for req in requested {
            let reused = previous
                .iter()
                .find(|old| old.line == req.line && !new_bps.iter().any(|b: &Breakpoint| b.id == old.id))
                .map(|old| old.id);
            let id = reused.unwrap_or_else(|| {
                let id = self.next_id;
                self.next_id += 1;
                id
            });

            let mut bp = Breakpoint {
                id,
                source_path: source_path.to_string(),
                line: req.line,
                condition: req.condition.clone(),
                resolution: Resolution {
                    line: None,
                    state: Verification::Unverified,
                    message: None,
                },
                source_modified,
            };
            bp.resolution = self.resolve_breakpoint(file, &bp);
            new_bps.push(bp);
        }

        let result = new_bps.iter().map(Breakpoint::to_dap).collect();
        if !new_bps.is_empty() {
            self.breakpoints.insert(file.to_string(), new_bps);
        }
        result
    }

    /// Add discovered task positions of a file. Positions already known are immutable and
    /// are not overwritten.
    ///
    /// Return DAP representation of every breakpoint whose resolution changed.
    pub fn insert_positions(
        &mut self,
        file: &str,
        positions: impl IntoIterator<Item = PositionInfo>,
    ) -> Vec<Value> {
        let index = self.index.entry(file.to_string()).or_default();
        for pos in positions {
            index.entry(pos.line).or_insert(TaskPosition {
                task_id: pos.task_id,
                breakable: pos.breakable,
            });
        }
        self.revalidate(Some(file))
    }

    /// Forget all task positions, used when the playbook runs again from scratch.
    ///
    /// Return DAP representation of every breakpoint whose resolution changed.
    pub fn reset_positions(&mut self) -> Vec<Value> {
        self.index.clear();
        self.revalidate(None)
    }

    fn revalidate(&mut self, only_file: Option<&str>) -> Vec<Value> {
        let mut changed = vec![];
        let files: Vec<String> = self
            .breakpoints
            .keys()
            .filter(|f| only_file.is_none_or(|only| only == f.as_str()))
            .cloned()
            .collect();
        for file in files {
            let resolutions: Vec<Resolution> = self.breakpoints[&file]
                .iter()
                .map(|bp| self.resolve_breakpoint(&file, bp))
                .collect();
            if let Some(bps) = self.breakpoints.get_mut(&file) {
                for (bp, resolution) in bps.iter_mut().zip(resolutions) {
                    if bp.resolution != resolution {
                        bp.resolution = resolution;
                        changed.push(bp.to_dap());
                    }
                }
            }
        }
        changed
    }

    /// Verified breakpoints that resolve exactly to `line` of `file`.
    pub fn hits(&self, file: &str, line: i64) -> Vec<&Breakpoint> {
        self.breakpoints
            .get(file)
            .map(|bps| {
                bps.iter()
                    .filter(|bp| bp.verified() && bp.resolution.line == Some(line))
                    .collect()
            })
            .unwrap_or_default()
    }
}
