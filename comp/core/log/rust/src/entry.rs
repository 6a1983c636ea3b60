// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::Priority;
use std::fmt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// One log line as collected from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub node: String,
    pub priority: Priority,
    pub message: String,
    pub date: OffsetDateTime,
}

impl LogEntry {
    pub fn new(node: impl Into<String>, priority: Priority, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            priority,
            message: message.into(),
            date: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_date(mut self, date: OffsetDateTime) -> Self {
        self.date = date;
        self
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(self.date)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} | {}",
            self.timestamp(),
            self.node,
            self.priority.as_str().to_ascii_uppercase(),
            self.message
        )
    }
}

pub(crate) fn format_timestamp(date: OffsetDateTime) -> String {
    date.format(&Rfc3339)
        .unwrap_or_else(|_| date.unix_timestamp().to_string())
}
