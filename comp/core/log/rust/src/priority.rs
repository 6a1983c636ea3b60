// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Severity attached to every log line a node or worker emits.
///
/// Ordering follows severity, so `p >= Priority::Error` selects the
/// priorities that force a run into a failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown log priority: {0:?}")]
pub struct ParsePriorityError(pub String);

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Debug,
        Priority::Info,
        Priority::Notice,
        Priority::Warning,
        Priority::Error,
        Priority::Fatal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Debug => "debug",
            Priority::Info => "info",
            Priority::Notice => "notice",
            Priority::Warning => "warning",
            Priority::Error => "error",
            Priority::Fatal => "fatal",
        }
    }

    /// Level used when the entry goes through the `log` facade. `log` has no
    /// notice or fatal level, so they fold into their nearest neighbour.
    pub fn level(self) -> log::Level {
        match self {
            Priority::Debug => log::Level::Debug,
            Priority::Info | Priority::Notice => log::Level::Info,
            Priority::Warning => log::Level::Warn,
            Priority::Error | Priority::Fatal => log::Level::Error,
        }
    }

    /// Numeric code carried as the first parameter of a relayed `LOG` message.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Priority> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Priority::ALL.get(i).copied())
    }

    pub fn is_error(self) -> bool {
        self >= Priority::Error
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Priority::Debug),
            "info" => Ok(Priority::Info),
            "notice" => Ok(Priority::Notice),
            "warning" | "warn" => Ok(Priority::Warning),
            "error" => Ok(Priority::Error),
            "fatal" => Ok(Priority::Fatal),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}
