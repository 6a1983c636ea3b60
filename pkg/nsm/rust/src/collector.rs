// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::message::request;
use crate::{CommandHandler, DispatchError, Dispatcher, Message};
use log::{debug, warn};
use slc_log::{LogEntry, LogStore, Priority};
use std::sync::Arc;

/// Receives `LOG` messages relayed by other nodes and persists them.
pub struct LogCollector {
    store: Arc<dyn LogStore>,
}

impl LogCollector {
    /// Prepares the store's table once. A failure is logged and the collector
    /// keeps running; writes will then fail and be logged individually.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        if let Err(e) = store.create_table() {
            warn!("[logcollector] failed to prepare log table: {e}");
        }
        Self { store }
    }

    pub fn install(self: Arc<Self>, dispatcher: &Dispatcher) {
        dispatcher.register_command(request::LOG, self);
    }

    fn entry_from(msg: &Message) -> LogEntry {
        let priority = msg
            .param(0)
            .and_then(Priority::from_code)
            .unwrap_or(Priority::Info);
        LogEntry::new(msg.node(), priority, msg.data())
    }
}

impl CommandHandler for LogCollector {
    fn handle(&self, msg: &Message, _dispatcher: &Dispatcher) -> Result<bool, DispatchError> {
        let entry = Self::entry_from(msg);
        debug!("[logcollector] {entry}");
        if let Err(e) = self.store.write_log(&entry) {
            warn!("[logcollector] dropped entry from {}: {e}", entry.node);
            return Ok(false);
        }
        Ok(true)
    }
}
