// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Run-control vocabulary: the boot/load/start/stop cycle of a readout node.

use crate::engine::{Hooks, Legal, NodeHandle, Rule, StateMachine, Vocabulary};
use crate::errors::HookError;
use slc_nsm::{Dispatcher, Message};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RcState {
    NotReady,
    Ready,
    Running,
    Paused,
    Error,
    Fatal,
    Booting,
    Loading,
    Starting,
    Stopping,
    Pausing,
    Resuming,
    Recovering,
    Aborting,
}

impl RcState {
    pub fn as_str(self) -> &'static str {
        match self {
            RcState::NotReady => "NOTREADY",
            RcState::Ready => "READY",
            RcState::Running => "RUNNING",
            RcState::Paused => "PAUSED",
            RcState::Error => "ERROR",
            RcState::Fatal => "FATAL",
            RcState::Booting => "BOOTING",
            RcState::Loading => "LOADING",
            RcState::Starting => "STARTING",
            RcState::Stopping => "STOPPING",
            RcState::Pausing => "PAUSING",
            RcState::Resuming => "RESUMING",
            RcState::Recovering => "RECOVERING",
            RcState::Aborting => "ABORTING",
        }
    }
}

impl fmt::Display for RcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod command {
    pub const BOOT: &str = "BOOT";
    pub const LOAD: &str = "LOAD";
    pub const START: &str = "START";
    pub const STOP: &str = "STOP";
    pub const PAUSE: &str = "PAUSE";
    pub const RESUME: &str = "RESUME";
    pub const RECOVER: &str = "RECOVER";
    pub const ABORT: &str = "ABORT";
}

use RcState::*;

static RULES: [Rule<RcState>; 8] = [
    Rule {
        command: command::BOOT,
        legal: Legal::From(&[NotReady]),
        transitional: Some(Booting),
        next: NotReady,
        idempotent: false,
    },
    Rule {
        command: command::LOAD,
        legal: Legal::From(&[NotReady]),
        transitional: Some(Loading),
        next: Ready,
        idempotent: false,
    },
    Rule {
        command: command::START,
        legal: Legal::From(&[Ready]),
        transitional: Some(Starting),
        next: Running,
        idempotent: false,
    },
    Rule {
        command: command::STOP,
        legal: Legal::From(&[Running, Paused]),
        transitional: Some(Stopping),
        next: Ready,
        idempotent: false,
    },
    Rule {
        command: command::PAUSE,
        legal: Legal::From(&[Running]),
        transitional: Some(Pausing),
        next: Paused,
        idempotent: false,
    },
    Rule {
        command: command::RESUME,
        legal: Legal::From(&[Paused]),
        transitional: Some(Resuming),
        next: Running,
        idempotent: false,
    },
    Rule {
        command: command::RECOVER,
        legal: Legal::From(&[Error]),
        transitional: Some(Recovering),
        next: Ready,
        idempotent: false,
    },
    Rule {
        command: command::ABORT,
        legal: Legal::Any,
        transitional: Some(Aborting),
        next: NotReady,
        idempotent: false,
    },
];

/// Run-control vocabulary marker.
#[derive(Debug)]
pub struct RunControl;

impl Vocabulary for RunControl {
    type State = RcState;

    const STATE_VARIABLE: &'static str = "rcstate";
    const INITIAL: RcState = NotReady;
    const ERROR: RcState = Error;

    fn rules() -> &'static [Rule<RcState>] {
        &RULES
    }

    fn is_transitional(state: RcState) -> bool {
        matches!(
            state,
            Booting | Loading | Starting | Stopping | Pausing | Resuming | Recovering | Aborting
        )
    }

    fn is_error(state: RcState) -> bool {
        matches!(state, Error | Fatal)
    }
}

pub type RcNode = NodeHandle<RunControl>;

/// One method per run-control command. Defaults succeed without doing
/// anything.
pub trait RcHooks: Send + Sync {
    fn boot(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn load(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn start(&self, _exp: u32, _run: u32, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn stop(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn pause(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn resume(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn recover(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    fn abort(&self, _node: &RcNode) -> Result<(), HookError> {
        Ok(())
    }

    /// ABORT received while another command may still be running. Cut that
    /// command short without waiting for it; [`RcHooks::abort`] follows once it
    /// has returned.
    fn interrupt(&self, _node: &RcNode) {}

    fn on_ok(&self, _msg: &Message, _node: &RcNode) {}

    fn on_error(&self, _msg: &Message, _node: &RcNode) {}

    fn on_fatal(&self, _msg: &Message, _node: &RcNode) {}
}

struct RcAdapter<H>(Arc<H>);

impl<H: RcHooks> Hooks<RunControl> for RcAdapter<H> {
    fn run(
        &self,
        command: &str,
        _from: RcState,
        msg: &Message,
        node: &RcNode,
    ) -> Result<(), HookError> {
        let hooks = &self.0;
        match command {
            command::BOOT => hooks.boot(node),
            command::LOAD => hooks.load(node),
            command::START => {
                let (exp, run) = run_numbers(msg)?;
                hooks.start(exp, run, node)
            }
            command::STOP => hooks.stop(node),
            command::PAUSE => hooks.pause(node),
            command::RESUME => hooks.resume(node),
            command::RECOVER => hooks.recover(node),
            command::ABORT => hooks.abort(node),
            other => Err(HookError::Failed(format!("no hook for {other}"))),
        }
    }

    fn interrupt(&self, command: &str, node: &RcNode) {
        if command == command::ABORT {
            self.0.interrupt(node);
        }
    }

    fn on_ok(&self, msg: &Message, node: &RcNode) {
        self.0.on_ok(msg, node);
    }

    fn on_error(&self, msg: &Message, node: &RcNode) {
        self.0.on_error(msg, node);
    }

    fn on_fatal(&self, msg: &Message, node: &RcNode) {
        self.0.on_fatal(msg, node);
    }
}

fn run_numbers(msg: &Message) -> Result<(u32, u32), HookError> {
    let missing = || HookError::MissingParams {
        command: command::START.to_string(),
        expected: 2,
        actual: msg.params().len(),
    };
    let exp = msg.param(0).ok_or_else(missing)?;
    let run = msg.param(1).ok_or_else(missing)?;
    let exp = u32::try_from(exp).map_err(|_| HookError::Failed(format!("bad experiment number {exp}")))?;
    let run = u32::try_from(run).map_err(|_| HookError::Failed(format!("bad run number {run}")))?;
    Ok((exp, run))
}

/// Install a run-control state machine driven by `hooks` on `dispatcher`.
pub fn install<H: RcHooks + 'static>(
    dispatcher: Arc<Dispatcher>,
    hooks: Arc<H>,
) -> Arc<StateMachine<RunControl>> {
    StateMachine::install(dispatcher, Arc::new(RcAdapter(hooks)))
}
