// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Command-driven node state machines and the supervision of the worker
//! processes they drive.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::dbg_macro)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod hv;
mod listener;
pub mod node;
pub mod process;
pub mod rc;
pub mod state;
pub mod status_block;
pub mod worker;

pub use controller::SubprocessController;
pub use engine::{Hooks, NodeHandle, Rule, StateMachine, Vocabulary};
pub use errors::{ControllerError, DeviceError, HookError, SupervisorError};
pub use node::{Node, Role};
pub use process::ProcessSupervisor;
pub use state::WorkerState;
