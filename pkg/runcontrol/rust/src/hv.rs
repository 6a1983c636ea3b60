// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! High-voltage vocabulary and the hook set that drives an [`HvDevice`].

use crate::config::{HvChannelConfig, HvConfig};
use crate::engine::{Hooks, Legal, NodeHandle, Rule, StateMachine, Vocabulary};
use crate::errors::{DeviceError, HookError};
use log::{debug, info};
use slc_nsm::{Dispatcher, FnHandler, HandlerError, Message, Value, VarType, Variable};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvState {
    Off,
    Standby,
    Standby2,
    Standby3,
    Peak,
    Error,
    Configuring,
    TurningOn,
    TurningOff,
    RampingUp,
    RampingDown,
}

/// Powered levels, lowest first.
const LEVELS: [HvState; 4] = [
    HvState::Standby,
    HvState::Standby2,
    HvState::Standby3,
    HvState::Peak,
];

impl HvState {
    pub fn as_str(self) -> &'static str {
        match self {
            HvState::Off => "OFF",
            HvState::Standby => "STANDBY",
            HvState::Standby2 => "STANDBY2",
            HvState::Standby3 => "STANDBY3",
            HvState::Peak => "PEAK",
            HvState::Error => "ERROR",
            HvState::Configuring => "CONFIGURING",
            HvState::TurningOn => "TURNINGON",
            HvState::TurningOff => "TURNINGOFF",
            HvState::RampingUp => "RAMPINGUP",
            HvState::RampingDown => "RAMPINGDOWN",
        }
    }

    /// Position among the powered levels, `None` when not powered.
    pub fn level(self) -> Option<usize> {
        LEVELS.iter().position(|s| *s == self)
    }
}

impl fmt::Display for HvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod command {
    pub const CONFIGURE: &str = "CONFIGURE";
    pub const TURNON: &str = "TURNON";
    pub const TURNOFF: &str = "TURNOFF";
    pub const STANDBY: &str = "STANDBY";
    pub const STANDBY2: &str = "STANDBY2";
    pub const STANDBY3: &str = "STANDBY3";
    pub const PEAK: &str = "PEAK";
    pub const RAMPUP: &str = "RAMPUP";
    pub const RAMPDOWN: &str = "RAMPDOWN";
    pub const RECOVER: &str = "RECOVER";
}

use HvState::*;

const POWERED: &[HvState] = &[Standby, Standby2, Standby3, Peak];

static RULES: [Rule<HvState>; 10] = [
    Rule {
        command: command::CONFIGURE,
        legal: Legal::From(&[Off, Error]),
        transitional: Some(Configuring),
        next: Off,
        idempotent: false,
    },
    Rule {
        command: command::TURNON,
        legal: Legal::From(&[Off, Standby]),
        transitional: Some(TurningOn),
        next: Standby,
        idempotent: true,
    },
    Rule {
        command: command::TURNOFF,
        legal: Legal::From(&[Standby, Standby2, Standby3, Peak, Error]),
        transitional: Some(TurningOff),
        next: Off,
        idempotent: false,
    },
    Rule {
        command: command::STANDBY,
        legal: Legal::From(POWERED),
        transitional: Some(RampingDown),
        next: Standby,
        idempotent: true,
    },
    Rule {
        command: command::STANDBY2,
        legal: Legal::From(&[Standby, Standby2, Standby3]),
        transitional: None,
        next: Standby2,
        idempotent: true,
    },
    Rule {
        command: command::STANDBY3,
        legal: Legal::From(&[Standby2, Standby3, Peak]),
        transitional: None,
        next: Standby3,
        idempotent: true,
    },
    Rule {
        command: command::PEAK,
        legal: Legal::From(&[Standby3, Peak]),
        transitional: Some(RampingUp),
        next: Peak,
        idempotent: true,
    },
    Rule {
        command: command::RAMPUP,
        legal: Legal::From(&[Standby, Standby2, Standby3]),
        transitional: Some(RampingUp),
        next: Peak,
        idempotent: false,
    },
    Rule {
        command: command::RAMPDOWN,
        legal: Legal::From(&[Standby2, Standby3, Peak]),
        transitional: Some(RampingDown),
        next: Standby,
        idempotent: false,
    },
    Rule {
        command: command::RECOVER,
        legal: Legal::From(&[Error]),
        transitional: None,
        next: Off,
        idempotent: false,
    },
];

/// High-voltage vocabulary marker.
#[derive(Debug)]
pub struct HighVoltage;

impl Vocabulary for HighVoltage {
    type State = HvState;

    const STATE_VARIABLE: &'static str = "hvstate";
    const INITIAL: HvState = Off;
    const ERROR: HvState = Error;

    fn rules() -> &'static [Rule<HvState>] {
        &RULES
    }

    fn is_transitional(state: HvState) -> bool {
        matches!(
            state,
            Configuring | TurningOn | TurningOff | RampingUp | RampingDown
        )
    }

    fn is_error(state: HvState) -> bool {
        state == Error
    }
}

pub type HvNode = NodeHandle<HighVoltage>;

/// One method per high-voltage command. `from` is the stable state the
/// command was accepted in.
pub trait HvHooks: Send + Sync {
    fn configure(&self, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    fn turn_on(&self, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    fn turn_off(&self, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    /// Move to `level` (one of the powered states).
    fn set_level(&self, _level: HvState, _from: HvState, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    /// Step one level up; the hook sets the reached level itself.
    fn ramp_up(&self, _from: HvState, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    /// Step one level down; the hook sets the reached level itself.
    fn ramp_down(&self, _from: HvState, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    fn recover(&self, _node: &HvNode) -> Result<(), HookError> {
        Ok(())
    }

    fn on_ok(&self, _msg: &Message, _node: &HvNode) {}

    fn on_error(&self, _msg: &Message, _node: &HvNode) {}

    fn on_fatal(&self, _msg: &Message, _node: &HvNode) {}
}

struct HvAdapter<H>(Arc<H>);

impl<H: HvHooks> Hooks<HighVoltage> for HvAdapter<H> {
    fn run(
        &self,
        command: &str,
        from: HvState,
        _msg: &Message,
        node: &HvNode,
    ) -> Result<(), HookError> {
        let hooks = &self.0;
        match command {
            command::CONFIGURE => hooks.configure(node),
            command::TURNON => hooks.turn_on(node),
            command::TURNOFF => hooks.turn_off(node),
            command::STANDBY => hooks.set_level(Standby, from, node),
            command::STANDBY2 => hooks.set_level(Standby2, from, node),
            command::STANDBY3 => hooks.set_level(Standby3, from, node),
            command::PEAK => hooks.set_level(Peak, from, node),
            command::RAMPUP => hooks.ramp_up(from, node),
            command::RAMPDOWN => hooks.ramp_down(from, node),
            command::RECOVER => hooks.recover(node),
            other => Err(HookError::Failed(format!("no hook for {other}"))),
        }
    }

    fn on_ok(&self, msg: &Message, node: &HvNode) {
        self.0.on_ok(msg, node);
    }

    fn on_error(&self, msg: &Message, node: &HvNode) {
        self.0.on_error(msg, node);
    }

    fn on_fatal(&self, msg: &Message, node: &HvNode) {
        self.0.on_fatal(msg, node);
    }
}

/// Install a high-voltage state machine driven by `hooks` on `dispatcher`.
pub fn install<H: HvHooks + 'static>(
    dispatcher: Arc<Dispatcher>,
    hooks: Arc<H>,
) -> Arc<StateMachine<HighVoltage>> {
    StateMachine::install(dispatcher, Arc::new(HvAdapter(hooks)))
}

/// Address of one high-voltage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HvChannel {
    pub crate_id: u32,
    pub slot: u32,
    pub channel: u32,
}

impl HvChannel {
    pub fn new(crate_id: u32, slot: u32, channel: u32) -> Self {
        Self {
            crate_id,
            slot,
            channel,
        }
    }
}

impl fmt::Display for HvChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.crate_id, self.slot, self.channel)
    }
}

/// Power-supply backend.
pub trait HvDevice: Send + Sync {
    fn set_switch(&self, channel: HvChannel, on: bool) -> Result<(), DeviceError>;

    fn set_voltage(&self, channel: HvChannel, volts: f32) -> Result<(), DeviceError>;

    fn read_voltage(&self, channel: HvChannel) -> Result<f32, DeviceError>;

    fn read_switch(&self, channel: HvChannel) -> Result<bool, DeviceError>;

    /// Ramp rates in V/s. Devices without programmable ramps ignore them.
    fn set_ramp(&self, _channel: HvChannel, _up: f32, _down: f32) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SimChannel {
    on: bool,
    demand: f32,
    ramp_up: f32,
    ramp_down: f32,
}

#[derive(Debug, Default)]
struct SimState {
    channels: BTreeMap<HvChannel, SimChannel>,
    offline: bool,
    rejecting: Option<HvChannel>,
}

/// In-memory power supply: outputs follow their demand instantly while
/// switched on.
#[derive(Debug, Default)]
pub struct SimulatedHvDevice {
    inner: Mutex<SimState>,
}

impl SimulatedHvDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the crate controller were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make writes to `channel` fail.
    pub fn reject(&self, channel: Option<HvChannel>) {
        self.lock().rejecting = channel;
    }

    pub fn ramp_rates(&self, channel: HvChannel) -> Option<(f32, f32)> {
        self.lock()
            .channels
            .get(&channel)
            .map(|c| (c.ramp_up, c.ramp_down))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
        channel: HvChannel,
        f: impl FnOnce(&mut SimChannel),
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.offline {
            return Err(DeviceError::Unreachable("simulated crate offline".into()));
        }
        if state.rejecting == Some(channel) {
            return Err(DeviceError::Rejected {
                channel: channel.to_string(),
                reason: "interlock".into(),
            });
        }
        f(state.channels.entry(channel).or_default());
        Ok(())
    }

    fn read(&self, channel: HvChannel) -> Result<SimChannel, DeviceError> {
        let state = self.lock();
        if state.offline {
            return Err(DeviceError::Unreachable("simulated crate offline".into()));
        }
        Ok(state.channels.get(&channel).copied().unwrap_or_default())
    }
}

impl HvDevice for SimulatedHvDevice {
    fn set_switch(&self, channel: HvChannel, on: bool) -> Result<(), DeviceError> {
        self.write(channel, |c| c.on = on)
    }

    fn set_voltage(&self, channel: HvChannel, volts: f32) -> Result<(), DeviceError> {
        self.write(channel, |c| c.demand = volts)
    }

    fn read_voltage(&self, channel: HvChannel) -> Result<f32, DeviceError> {
        let c = self.read(channel)?;
        Ok(if c.on { c.demand } else { 0.0 })
    }

    fn read_switch(&self, channel: HvChannel) -> Result<bool, DeviceError> {
        Ok(self.read(channel)?.on)
    }

    fn set_ramp(&self, channel: HvChannel, up: f32, down: f32) -> Result<(), DeviceError> {
        self.write(channel, |c| {
            c.ramp_up = up;
            c.ramp_down = down;
        })
    }
}

/// Hook set applying per-level demand voltages to the configured channels.
pub struct HvControl {
    channels: Vec<HvChannelConfig>,
    device: Arc<dyn HvDevice>,
}

impl HvControl {
    pub fn new(config: &HvConfig, device: Arc<dyn HvDevice>) -> Self {
        Self {
            channels: config.channels.clone(),
            device,
        }
    }

    fn address(cfg: &HvChannelConfig) -> HvChannel {
        HvChannel::new(cfg.crate_id, cfg.slot, cfg.channel)
    }

    fn demand(cfg: &HvChannelConfig, level: HvState) -> f32 {
        match level {
            Standby2 => cfg.standby2,
            Standby3 => cfg.standby3,
            Peak => cfg.peak,
            _ => cfg.standby,
        }
    }

    /// Publish `hv[i].vmon` (monitored voltage) and `hv[i].switch` for every
    /// channel, plus `hv.nchannels`.
    pub fn publish(&self, dispatcher: &Dispatcher) {
        dispatcher.register_variable(Variable::new("hv.nchannels", self.channels.len() as i32));
        for (i, cfg) in self.channels.iter().enumerate() {
            let channel = Self::address(cfg);
            let device = Arc::clone(&self.device);
            dispatcher.register_variable(Variable::with_handler(
                format!("hv[{i}].vmon"),
                VarType::Float,
                Arc::new(FnHandler::getter(move || {
                    device
                        .read_voltage(channel)
                        .map(Value::Float)
                        .map_err(|e| HandlerError(e.to_string()))
                })),
            ));
            let device = Arc::clone(&self.device);
            dispatcher.register_variable(Variable::with_handler(
                format!("hv[{i}].switch"),
                VarType::Int,
                Arc::new(FnHandler::getter(move || {
                    device
                        .read_switch(channel)
                        .map(|on| Value::Int(i32::from(on)))
                        .map_err(|e| HandlerError(e.to_string()))
                })),
            ));
        }
    }

    fn apply(&self, level: HvState, node: &HvNode) -> Result<(), HookError> {
        for cfg in &self.channels {
            let channel = Self::address(cfg);
            let volts = Self::demand(cfg, level);
            self.device.set_voltage(channel, volts)?;
            debug!("[{}] {channel} demand {volts} V", node.name());
        }
        info!("[{}] {} channel(s) at {level}", node.name(), self.channels.len());
        Ok(())
    }

    fn switch_all(&self, on: bool) -> Result<(), HookError> {
        for cfg in &self.channels {
            self.device.set_switch(Self::address(cfg), on)?;
        }
        Ok(())
    }
}

impl HvHooks for HvControl {
    fn configure(&self, node: &HvNode) -> Result<(), HookError> {
        if self.channels.is_empty() {
            return Err(HookError::Failed("no channels configured".into()));
        }
        for cfg in &self.channels {
            let channel = Self::address(cfg);
            self.device.set_ramp(channel, cfg.ramp_up, cfg.ramp_down)?;
            self.device.read_switch(channel)?;
        }
        node.reply(&format!("configured {} channel(s)", self.channels.len()));
        Ok(())
    }

    fn turn_on(&self, node: &HvNode) -> Result<(), HookError> {
        self.apply(Standby, node)?;
        self.switch_all(true)
    }

    fn turn_off(&self, _node: &HvNode) -> Result<(), HookError> {
        self.switch_all(false)
    }

    fn set_level(&self, level: HvState, from: HvState, node: &HvNode) -> Result<(), HookError> {
        if node.state() == from {
            let direction = if from.level() < level.level() {
                RampingUp
            } else {
                RampingDown
            };
            node.set_state(direction);
        }
        self.apply(level, node)
    }

    fn ramp_up(&self, from: HvState, node: &HvNode) -> Result<(), HookError> {
        let target = from
            .level()
            .and_then(|i| LEVELS.get(i + 1))
            .copied()
            .ok_or_else(|| HookError::Failed(format!("cannot ramp up from {from}")))?;
        self.apply(target, node)?;
        node.set_state(target);
        Ok(())
    }

    fn ramp_down(&self, from: HvState, node: &HvNode) -> Result<(), HookError> {
        let target = from
            .level()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| LEVELS.get(i))
            .copied()
            .ok_or_else(|| HookError::Failed(format!("cannot ramp down from {from}")))?;
        self.apply(target, node)?;
        node.set_state(target);
        Ok(())
    }

    fn recover(&self, _node: &HvNode) -> Result<(), HookError> {
        self.switch_all(false)
    }
}
