// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::variable::VarType;
use thiserror::Error;

/// Frame could not be turned into a [`Message`](crate::Message). Raised before
/// any handler sees the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("empty request name")]
    EmptyRequest,

    #[error("invalid parameter count: {0}")]
    InvalidParamCount(i64),

    #[error("declared {declared} parameters but frame carries {actual}")]
    ParamCountMismatch { declared: i64, actual: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node '{0}' is not reachable")]
    Unreachable(String),

    #[error("connection to '{0}' is closed")]
    Closed(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VariableError {
    #[error("variable '{0}' not found")]
    NotFound(String),

    #[error("variable '{0}' is not readable")]
    NotReadable(String),

    #[error("variable '{0}' is not writable")]
    NotWritable(String),

    #[error("variable '{name}' belongs to '{owner}', not '{requested}'")]
    WrongNode {
        name: String,
        owner: String,
        requested: String,
    },

    #[error("variable '{name}' holds {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: VarType,
        actual: VarType,
    },

    #[error("handler for '{name}' failed: {reason}")]
    Handler { name: String, reason: String },

    #[error("malformed variable payload: {0}")]
    Malformed(String),
}

/// Failure reported by a [`VariableHandler`](crate::VariableHandler).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("handler failed: {0}")]
    Handler(String),
}
