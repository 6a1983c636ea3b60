// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Control-bus layer of a slow-control node: message framing, command
//! routing, and the published-variable registry with change subscriptions.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::dbg_macro)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod collector;
mod dispatcher;
mod errors;
mod message;
mod registry;
mod transport;
mod variable;

pub use collector::LogCollector;
pub use dispatcher::{CommandHandler, Dispatch, Dispatcher, spawn_receive_loop};
pub use errors::{DispatchError, HandlerError, ProtocolError, TransportError, VariableError};
pub use message::{MAX_PARAMS, Message, request};
pub use registry::VariableRegistry;
pub use transport::{Endpoint, LocalBus, Transport};
pub use variable::{
    FnHandler, Scope, Value, ValueCell, VarInfo, VarType, VarValue, Variable, VariableHandler,
};
