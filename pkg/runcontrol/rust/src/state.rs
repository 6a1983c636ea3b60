// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::str::FromStr;

/// Lifecycle of a supervised worker, as seen by its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// No worker, or the last one was aborted.
    Unconfigured,
    /// Spawned, waiting for the worker to report ready.
    Loading,
    Ready,
    Starting,
    Running,
    /// Run held by a pause request; the worker counts no events.
    Paused,
    Stopping,
    Error,
    /// Only left through an abort.
    Fatal,
}

impl WorkerState {
    pub const ALL: [WorkerState; 9] = [
        WorkerState::Unconfigured,
        WorkerState::Loading,
        WorkerState::Ready,
        WorkerState::Starting,
        WorkerState::Running,
        WorkerState::Paused,
        WorkerState::Stopping,
        WorkerState::Error,
        WorkerState::Fatal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Unconfigured => "unconfigured",
            WorkerState::Loading => "loading",
            WorkerState::Ready => "ready",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
            WorkerState::Fatal => "fatal",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, WorkerState::Error | WorkerState::Fatal)
    }

    /// Value stored in the status block.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<WorkerState> {
        usize::try_from(code)
            .ok()
            .and_then(|i| WorkerState::ALL.get(i).copied())
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown worker state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for WorkerState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        WorkerState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
