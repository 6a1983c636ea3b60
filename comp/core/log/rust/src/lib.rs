// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Logging primitives shared by every slow-control node: message priorities,
//! log entries as relayed over the control bus, the `log` backend used by the
//! daemons, and the interface of the log database.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::dbg_macro)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod entry;
mod logger;
mod priority;
mod store;

pub use entry::LogEntry;
pub use logger::{NodeLogger, init};
pub use priority::{ParsePriorityError, Priority};
pub use store::{LogStore, LogStoreError, MemoryLogStore};
