// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ProcessConfig;
use crate::errors::SupervisorError;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One auxiliary child process of a node: what to run and, once loaded, the
/// running instance.
#[derive(Debug)]
pub struct ProcessSupervisor {
    name: String,
    index: u32,
    executable: Option<PathBuf>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    ready_path: Option<PathBuf>,
    stop_timeout: Duration,
    child: Option<Child>,
    /// Set on spawn, cleared by abort.
    loaded: bool,
}

impl ProcessSupervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            executable: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            ready_path: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            child: None,
            loaded: false,
        }
    }

    pub fn from_config(name: &str, index: u32, config: &ProcessConfig) -> Self {
        let mut sup = Self::new(name);
        sup.configure(name, index);
        sup.set_executable(&config.command);
        for arg in &config.args {
            sup.add_argument(arg);
        }
        for (k, v) in &config.env {
            sup.set_env(k, v);
        }
        if let Some(ref path) = config.ready_path {
            sup.set_ready_path(path);
        }
        if let Some(secs) = config.stop_timeout {
            sup.set_stop_timeout(Duration::from_secs(secs));
        }
        sup
    }

    pub fn configure(&mut self, name: &str, index: u32) {
        self.name = name.to_string();
        self.index = index;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_executable(&mut self, path: impl Into<PathBuf>) {
        self.executable = Some(path.into());
    }

    pub fn clear_arguments(&mut self) {
        self.args.clear();
    }

    pub fn add_argument(&mut self, value: impl Into<String>) {
        self.args.push(value.into());
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// File whose appearance marks the process as ready.
    pub fn set_ready_path(&mut self, path: impl Into<PathBuf>) {
        self.ready_path = Some(path.into());
    }

    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Reaps the child if it exited since the last call.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("[{}] exited with {status}", self.name);
                self.child = None;
                false
            }
            Err(e) => {
                warn!("[{}] failed to poll: {e}", self.name);
                false
            }
        }
    }

    /// Spawn the configured executable, replacing a previous instance.
    /// Returns the new pid.
    pub fn load(&mut self, timeout: Duration) -> Result<u32, SupervisorError> {
        if self.is_alive() {
            info!("[{}] replacing running instance", self.name);
            self.abort();
        }
        self.loaded = false;
        let executable = self
            .executable
            .clone()
            .ok_or_else(|| SupervisorError::NotConfigured(self.name.clone()))?;

        let mut cmd = Command::new(&executable);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.name.clone(),
            executable: executable.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(
            "[{}] spawned (pid={pid}, cmd={})",
            self.name,
            executable.display()
        );
        self.child = Some(child);
        self.loaded = true;

        if let Some(ready) = self.ready_path.clone() {
            self.wait_ready(&ready, timeout)?;
        }
        Ok(pid)
    }

    fn wait_ready(&mut self, ready: &Path, timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if ready.exists() {
                debug!("[{}] ready ({})", self.name, ready.display());
                return Ok(());
            }
            if let Some(child) = self.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                self.child = None;
                return Err(SupervisorError::Exited {
                    name: self.name.clone(),
                    status: status.to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::NotReady {
                    name: self.name.clone(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Tell the process a run begins, as a `start <exp> <run>` line on stdin.
    pub fn start(&mut self, exp: u32, run: u32) -> Result<(), SupervisorError> {
        self.write_line(&format!("start {exp} {run}"))
    }

    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        self.write_line("stop")
    }

    pub fn pause(&mut self) -> Result<(), SupervisorError> {
        self.write_line("pause")
    }

    pub fn resume(&mut self) -> Result<(), SupervisorError> {
        self.write_line("resume")
    }

    /// True if the loaded instance is gone without an abort, whoever
    /// noticed the exit first. Cleared by the next load or abort.
    pub fn has_died(&mut self) -> bool {
        self.loaded && !self.is_alive()
    }

    fn write_line(&mut self, line: &str) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Err(SupervisorError::NotRunning(self.name.clone()));
        }
        let name = self.name.clone();
        let stdin = self
            .child
            .as_mut()
            .and_then(|c| c.stdin.as_mut())
            .ok_or_else(|| SupervisorError::NotRunning(name.clone()))?;
        writeln!(stdin, "{line}")
            .and_then(|()| stdin.flush())
            .map_err(|source| SupervisorError::Io { name, source })?;
        debug!("[{}] sent '{line}'", self.name);
        Ok(())
    }

    pub fn send_signal(&self, sig: Signal) {
        if let Some(pid) = self.pid()
            && let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig)
        {
            warn!("[{}] failed to send {sig}: {e}", self.name);
        }
    }

    /// SIGTERM, then SIGKILL after the stop timeout. Safe to call when the
    /// process is already gone.
    pub fn abort(&mut self) {
        self.loaded = false;
        if let Some(mut child) = self.child.take() {
            terminate(&self.name, &mut child, self.stop_timeout);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Wait for `child` to exit until `deadline`. Returns true if it did.
fn wait_until(child: &mut Child, deadline: Instant) -> bool {
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => thread::sleep(POLL_INTERVAL),
        }
    }
}

/// SIGTERM `child`, wait up to `stop_timeout`, then SIGKILL it.
pub(crate) fn terminate(name: &str, child: &mut Child, stop_timeout: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("[{name}] already exited with {status}");
        return;
    }
    info!("[{name}] sending SIGTERM");
    if let Err(e) = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        warn!("[{name}] failed to send SIGTERM: {e}");
    }
    if wait_until(child, Instant::now() + stop_timeout) {
        return;
    }
    warn!(
        "[{name}] stop timeout ({}s) reached, sending SIGKILL",
        stop_timeout.as_secs()
    );
    if let Err(e) = child.kill() {
        warn!("[{name}] failed to send SIGKILL: {e}");
    }
    if !wait_until(child, Instant::now() + SIGKILL_TIMEOUT) {
        warn!("[{name}] still running after SIGKILL, giving up");
    }
}

/// Send SIGTERM to every running process first, then wait for each one in
/// turn within its own stop timeout.
pub fn shutdown_all(processes: &mut [ProcessSupervisor]) {
    for proc in processes.iter_mut() {
        if proc.is_alive() {
            info!("[{}] sending SIGTERM", proc.name);
            proc.send_signal(Signal::SIGTERM);
        }
    }
    for proc in processes.iter_mut() {
        proc.abort();
    }
}
