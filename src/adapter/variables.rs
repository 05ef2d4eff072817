//! Variable references handed to the client for stopped frames.
//!
//! A frame exposes four scopes. Scope contents live in the debuggee and are fetched on
//! every `variables` request; nested containers of a fetched snapshot get their own
//! references that are answered locally. All references of a thread die when it resumes.

use crate::debuggee::wire::ScopeKind;
use crate::error::Error;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use strum::IntoEnumIterator;

#[derive(Debug, Clone, PartialEq)]
pub enum VarRef {
    /// Top level scope of a frame, contents come from the debuggee.
    Scope {
        thread_id: i64,
        frame_id: i64,
        scope: ScopeKind,
    },
    /// Container value from an already fetched snapshot.
    Child { thread_id: i64, value: Value },
}

impl VarRef {
    pub fn thread_id(&self) -> i64 {
        match self {
            VarRef::Scope { thread_id, .. } => *thread_id,
            VarRef::Child { thread_id, .. } => *thread_id,
        }
    }
}

#[derive(Debug)]
pub struct ScopeEngine {
    next_ref: i64,
    refs: HashMap<i64, VarRef>,
    scope_refs: HashMap<(i64, ScopeKind), i64>,
}

impl Default for ScopeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeEngine {
    pub fn new() -> Self {
        Self {
            next_ref: 1,
            refs: HashMap::new(),
            scope_refs: HashMap::new(),
        }
    }

    fn alloc(&mut self, var: VarRef) -> i64 {
        let id = self.next_ref;
        self.next_ref += 1;
        self.refs.insert(id, var);
        id
    }

    /// `scopes` response body items of a stopped frame, always in the same order.
    pub fn scopes(&mut self, thread_id: i64, frame_id: i64) -> Vec<Value> {
        ScopeKind::iter()
            .map(|scope| {
                let reference = match self.scope_refs.get(&(frame_id, scope)) {
                    Some(r) => *r,
                    None => {
                        let r = self.alloc(VarRef::Scope {
                            thread_id,
                            frame_id,
                            scope,
                        });
                        self.scope_refs.insert((frame_id, scope), r);
                        r
                    }
                };
                let mut body = json!({
                    "name": scope.title(),
                    "variablesReference": reference,
                    "expensive": scope.expensive(),
                });
                if scope == ScopeKind::TaskVariables {
                    body["presentationHint"] = json!("locals");
                }
                body
            })
            .collect()
    }

    pub fn get(&self, reference: i64) -> Result<&VarRef, Error> {
        self.refs
            .get(&reference)
            .ok_or(Error::UnknownVariablesReference(reference))
    }

    /// Render named values as DAP variables, containers get child references.
    pub fn render_map(&mut self, thread_id: i64, values: &Map<String, Value>) -> Vec<Value> {
        values
            .iter()
            .map(|(name, value)| self.variable(thread_id, name, value))
            .collect()
    }

    /// Render children of a container value.
    pub fn render_children(&mut self, thread_id: i64, value: &Value) -> Vec<Value> {
        match value {
            Value::Object(map) => self.render_map(thread_id, map),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.variable(thread_id, &i.to_string(), item))
                .collect(),
            _ => vec![],
        }
    }

    /// Child reference of a value, 0 for scalars.
    pub fn reference_for(&mut self, thread_id: i64, value: &Value) -> i64 {
        match value {
            Value::Object(m) if !m.is_empty() => self.alloc(VarRef::Child {
                thread_id,
                value: value.clone(),
            }),
            Value::Array(a) if !a.is_empty() => self.alloc(VarRef::Child {
                thread_id,
                value: value.clone(),
            }),
            _ => 0,
        }
    }

    fn variable(&mut self, thread_id: i64, name: &str, value: &Value) -> Value {
        let reference = self.reference_for(thread_id, value);
        let mut var = json!({
            "name": name,
            "value": display_value(value),
            "type": type_name(value),
            "variablesReference": reference,
        });
        match value {
            Value::Object(m) if reference != 0 => var["namedVariables"] = json!(m.len()),
            Value::Array(a) if reference != 0 => var["indexedVariables"] = json!(a.len()),
            _ => {}
        }
        var
    }

    /// Drop every reference that belongs to a thread.
    pub fn invalidate_thread(&mut self, thread_id: i64) {
        self.refs.retain(|_, v| v.thread_id() != thread_id);
        let refs = &self.refs;
        self.scope_refs.retain(|_, r| refs.contains_key(r));
    }

    pub fn clear(&mut self) {
        self.refs.clear();
        self.scope_refs.clear();
    }
}

/// Wrap raw user input into a template expression.
pub fn template(raw: &str) -> String {
    format!("{{{{ {raw} }}}}")
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Short text form of a value.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Array(a) if a.is_empty() => "[]".to_string(),
        Value::Array(a) => format!("[…] ({} items)", a.len()),
        Value::Object(m) if m.is_empty() => "{}".to_string(),
        Value::Object(m) => format!("{{…}} ({} items)", m.len()),
    }
}
