// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::LogEntry;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogStoreError {
    #[error("log table unavailable: {0}")]
    TableUnavailable(String),

    #[error("failed to write log entry: {0}")]
    Write(String),
}

/// Backend that persists collected log entries (the logging database).
///
/// Callers only log failures; a broken store never stops a node.
pub trait LogStore: Send + Sync {
    fn create_table(&self) -> Result<(), LogStoreError>;

    fn write_log(&self, entry: &LogEntry) -> Result<(), LogStoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    table: bool,
    fail_writes: bool,
    entries: Vec<LogEntry>,
}

/// In-process store, used by single-host setups and tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Make every subsequent write fail, to simulate a database outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_writes = fail;
    }
}

impl LogStore for MemoryLogStore {
    fn create_table(&self) -> Result<(), LogStoreError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .table = true;
        Ok(())
    }

    fn write_log(&self, entry: &LogEntry) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.table {
            return Err(LogStoreError::TableUnavailable("create_table not called".into()));
        }
        if inner.fail_writes {
            return Err(LogStoreError::Write("store is failing writes".into()));
        }
        inner.entries.push(entry.clone());
        Ok(())
    }
}
