// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::{HandlerError, VariableError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Int,
    Float,
    Text,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::Int => write!(f, "int"),
            VarType::Float => write!(f, "float"),
            VarType::Text => write!(f, "text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i32),
    Float(f32),
    Text(String),
}

impl Value {
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Int(_) => VarType::Int,
            Value::Float(_) => VarType::Float,
            Value::Text(_) => VarType::Text,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Whether a variable is only visible to direct peers or advertised in the
/// global catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Global,
}

/// Reads and writes the value behind a published variable.
///
/// Handlers are called with the dispatcher's registry lock held and must not
/// call back into the dispatcher.
pub trait VariableHandler: Send + Sync {
    fn get(&self) -> Result<Value, HandlerError>;

    fn set(&self, value: &Value) -> Result<(), HandlerError>;
}

/// Handler that simply stores the last value written.
#[derive(Debug)]
pub struct ValueCell(Mutex<Value>);

impl ValueCell {
    pub fn new(value: impl Into<Value>) -> Self {
        ValueCell(Mutex::new(value.into()))
    }
}

impl VariableHandler for ValueCell {
    fn get(&self) -> Result<Value, HandlerError> {
        Ok(self.0.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn set(&self, value: &Value) -> Result<(), HandlerError> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        Ok(())
    }
}

type Getter = Box<dyn Fn() -> Result<Value, HandlerError> + Send + Sync>;
type Setter = Box<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;

/// Handler built from closures, for values that live elsewhere (node state,
/// device registers).
pub struct FnHandler {
    get: Getter,
    set: Option<Setter>,
}

impl FnHandler {
    pub fn getter<G>(get: G) -> Self
    where
        G: Fn() -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            get: Box::new(get),
            set: None,
        }
    }

    pub fn with_setter<S>(mut self, set: S) -> Self
    where
        S: Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.set = Some(Box::new(set));
        self
    }
}

impl VariableHandler for FnHandler {
    fn get(&self) -> Result<Value, HandlerError> {
        (self.get)()
    }

    fn set(&self, value: &Value) -> Result<(), HandlerError> {
        match &self.set {
            Some(set) => set(value),
            None => Err(HandlerError::from("no setter")),
        }
    }
}

/// Public description of a variable, exchanged in variable lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarInfo {
    pub node: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    #[serde(default)]
    pub scope: Scope,
    pub get: bool,
    pub set: bool,
}

/// Payload of `VSET`/`VREPLY` messages. An empty `node` means "the receiving
/// node" for sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarValue {
    #[serde(default)]
    pub node: String,
    pub name: String,
    pub value: Value,
}

impl VarValue {
    pub fn new(node: impl Into<String>, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone)]
pub struct Variable {
    info: VarInfo,
    handler: Arc<dyn VariableHandler>,
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable").field("info", &self.info).finish()
    }
}

impl Variable {
    /// A readable, read-only variable holding `value` in a [`ValueCell`].
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let var_type = value.var_type();
        Self::with_handler(name, var_type, Arc::new(ValueCell::new(value)))
    }

    pub fn with_handler(
        name: impl Into<String>,
        var_type: VarType,
        handler: Arc<dyn VariableHandler>,
    ) -> Self {
        Self {
            info: VarInfo {
                node: String::new(),
                name: name.into(),
                var_type,
                scope: Scope::Local,
                get: true,
                set: false,
            },
            handler,
        }
    }

    pub fn readable(mut self, get: bool) -> Self {
        self.info.get = get;
        self
    }

    pub fn settable(mut self, set: bool) -> Self {
        self.info.set = set;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.info.scope = scope;
        self
    }

    pub fn info(&self) -> &VarInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn bind(&mut self, node: &str) {
        node.clone_into(&mut self.info.node);
    }

    pub(crate) fn read(&self) -> Result<Value, VariableError> {
        if !self.info.get {
            return Err(VariableError::NotReadable(self.info.name.clone()));
        }
        let value = self.handler.get().map_err(|e| VariableError::Handler {
            name: self.info.name.clone(),
            reason: e.0,
        })?;
        self.check_type(&value)?;
        Ok(value)
    }

    pub(crate) fn write(&self, value: &Value) -> Result<(), VariableError> {
        if !self.info.set {
            return Err(VariableError::NotWritable(self.info.name.clone()));
        }
        self.check_type(value)?;
        self.handler.set(value).map_err(|e| VariableError::Handler {
            name: self.info.name.clone(),
            reason: e.0,
        })
    }

    fn check_type(&self, value: &Value) -> Result<(), VariableError> {
        if value.var_type() != self.info.var_type {
            return Err(VariableError::TypeMismatch {
                name: self.info.name.clone(),
                expected: self.info.var_type,
                actual: value.var_type(),
            });
        }
        Ok(())
    }
}
