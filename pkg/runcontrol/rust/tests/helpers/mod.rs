// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal;
use nix::unistd::Pid;
use slc_nsm::{Dispatcher, Endpoint, LocalBus, Message, Transport, spawn_receive_loop};
use slc_runcontrol::StateMachine;
use slc_runcontrol::config::WorkerConfig;
use slc_runcontrol::rc::{RcState, RunControl};
use slc_runcontrol::worker::WorkerRunControl;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const NODE: &str = "CPR5001";
pub const RC: &str = "RC";

pub fn mock_worker() -> &'static str {
    env!("CARGO_BIN_EXE_slc-mock-worker")
}

/// Worker config running the mock worker in `mode`, with its status block
/// in `dir`.
pub fn mock_worker_config(dir: &Path, mode: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(mock_worker());
    config.env.insert("MOCK_WORKER_MODE".into(), mode.into());
    config.status_dir = dir.to_path_buf();
    config.load_timeout = 5;
    config.start_timeout = 5;
    config.stop_timeout = 5;
    config.monitor_period_ms = 100;
    config
}

/// A run-control node on a local bus with its receive loop running, plus
/// the endpoint of the run-control master that talks to it.
pub struct NodeHarness {
    pub bus: LocalBus,
    pub rc: Endpoint,
    pub hooks: Arc<WorkerRunControl>,
    pub machine: Arc<StateMachine<RunControl>>,
    receive_loop: Option<JoinHandle<()>>,
}

impl NodeHarness {
    pub fn start(hooks: WorkerRunControl) -> Self {
        let bus = LocalBus::new();
        let rc = bus.attach(RC);
        let dispatcher = Arc::new(Dispatcher::new(NODE, Arc::new(bus.clone())));
        let hooks = Arc::new(hooks);
        let machine = Arc::clone(&hooks)
            .install(Arc::clone(&dispatcher))
            .expect("failed to install run control");
        let receive_loop = spawn_receive_loop(dispatcher, bus.attach(NODE))
            .expect("failed to start receive loop");
        Self {
            bus,
            rc,
            hooks,
            machine,
            receive_loop: Some(receive_loop),
        }
    }

    /// Send `command` from the master and wait for the node's reply.
    pub fn command(&self, command: &str, params: &[i32]) -> Message {
        let frame = Message::new(command)
            .from_node(RC)
            .with_params(params)
            .encode()
            .expect("failed to encode command");
        self.bus.send(NODE, &frame).expect("node unreachable");
        self.reply(DEFAULT_TIMEOUT)
            .unwrap_or_else(|| panic!("no reply to {command}"))
    }

    /// Send `command` without expecting a reply.
    pub fn post(&self, command: &str) {
        let frame = Message::new(command).from_node(RC).encode().unwrap();
        self.bus.send(NODE, &frame).expect("node unreachable");
    }

    pub fn events(&self) -> u32 {
        self.hooks.controller().events()
    }

    pub fn reply(&self, timeout: Duration) -> Option<Message> {
        self.rc
            .recv_timeout(timeout)
            .expect("master endpoint closed")
            .map(|frame| Message::decode(&frame).expect("malformed reply"))
    }

    pub fn state(&self) -> RcState {
        self.machine.state()
    }

    pub fn wait_for_state(&self, state: RcState, timeout: Duration) -> bool {
        wait_until(timeout, || self.state() == state)
    }
}

impl Drop for NodeHarness {
    fn drop(&mut self) {
        self.hooks.shutdown();
        self.bus.detach(NODE);
        if let Some(handle) = self.receive_loop.take() {
            let _ = handle.join();
        }
    }
}

/// Poll `condition` every 50ms until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Write a YAML process config file into `dir` with the given `name`.
pub fn write_config(dir: &Path, name: &str, yaml: &str) {
    let path = dir.join(format!("{name}.yaml"));
    std::fs::write(&path, yaml)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn kill_pid(pid: u32) {
    signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGKILL)
        .unwrap_or_else(|e| panic!("failed to kill {pid}: {e}"));
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}
