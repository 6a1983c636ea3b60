// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::state::WorkerState;
use slc_nsm::VariableError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures of a [`ProcessSupervisor`](crate::ProcessSupervisor).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("[{0}] no executable configured")]
    NotConfigured(String),

    #[error("[{name}] failed to spawn {executable}: {source}")]
    Spawn {
        name: String,
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("[{name}] not ready after {}s", timeout.as_secs_f32())]
    NotReady { name: String, timeout: Duration },

    #[error("[{name}] exited during load ({status})")]
    Exited { name: String, status: String },

    #[error("[{0}] is not running")]
    NotRunning(String),

    #[error("[{name}] i/o error: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Failures of a [`SubprocessController`](crate::SubprocessController).
///
/// Wait failures carry the last status line reported by the worker.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("[{name}] failed to spawn {executable}: {source}")]
    Spawn {
        name: String,
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("[{name}] failed to start listener: {source}")]
    Listener {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("status block {path}: {source}")]
    StatusBlock {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("worker cannot {op} while {state}")]
    InvalidState { op: &'static str, state: WorkerState },

    #[error("timed out after {}s waiting for {target}: {last}", timeout.as_secs_f32())]
    Timeout {
        target: WorkerState,
        timeout: Duration,
        last: String,
    },

    #[error("worker in {state}: {last}")]
    Failed { state: WorkerState, last: String },

    #[error("aborted while waiting for {target}: {last}")]
    Aborted { target: WorkerState, last: String },
}

/// Failure reported by a high-voltage device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("channel {channel} rejected request: {reason}")]
    Rejected { channel: String, reason: String },
}

/// Failure of a state-machine hook. Every variant turns the node to its
/// error state and is sent back as the text of the `ERROR` reply.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("{command} requires {expected} parameter(s), got {actual}")]
    MissingParams {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Variable(#[from] VariableError),
}

impl From<&str> for HookError {
    fn from(s: &str) -> Self {
        HookError::Failed(s.to_string())
    }
}

impl From<String> for HookError {
    fn from(s: String) -> Self {
        HookError::Failed(s)
    }
}
