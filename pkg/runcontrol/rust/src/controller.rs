// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::WorkerConfig;
use crate::errors::ControllerError;
use crate::listener;
use crate::process::{self, DEFAULT_STOP_TIMEOUT};
use crate::state::WorkerState;
use crate::status_block::{Field, Request, STATUS_BLOCK_ENV, StatusBlock};
use log::{debug, info, warn};
use slc_log::Priority;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Called for every status line the worker reports, outside the controller
/// lock.
pub type Observer = Arc<dyn Fn(Priority, &str, WorkerState) + Send + Sync>;

#[derive(Debug)]
pub(crate) struct SupervisedRun {
    pub(crate) state: WorkerState,
    pub(crate) last_message: String,
    pub(crate) exp: u32,
    pub(crate) run: u32,
    /// Bumped by every abort.
    pub(crate) epoch: u64,
}

/// State shared between a controller, its listener and its waiters.
pub(crate) struct Shared {
    pub(crate) name: String,
    run: Mutex<SupervisedRun>,
    pub(crate) changed: Condvar,
    observer: Mutex<Option<Observer>>,
}

impl Shared {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            run: Mutex::new(SupervisedRun {
                state: WorkerState::Unconfigured,
                last_message: String::new(),
                exp: 0,
                run: 0,
                epoch: 0,
            }),
            changed: Condvar::new(),
            observer: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SupervisedRun> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn observer(&self) -> Option<Observer> {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_observer(&self, observer: Observer) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }
}

/// Runs one worker process through load/start/stop, with a status block for
/// run numbers and a listener thread turning the worker's output into
/// state changes. All methods take `&self`; `abort` may be called from any
/// thread while another one waits.
pub struct SubprocessController {
    shared: Arc<Shared>,
    executable: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    status_path: PathBuf,
    stop_timeout: Duration,
    worker: Mutex<Option<Child>>,
    block: Mutex<Option<StatusBlock>>,
}

impl SubprocessController {
    pub fn new(name: &str, executable: impl Into<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared::new(name)),
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            status_path: std::env::temp_dir().join(format!("{name}.status")),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            worker: Mutex::new(None),
            block: Mutex::new(None),
        }
    }

    pub fn from_config(name: &str, config: &WorkerConfig) -> Self {
        let mut controller = Self::new(name, &config.executable);
        controller.args = config.args.clone();
        controller.env.extend(config.env.clone());
        controller.status_path = config.status_dir.join(format!("{name}.status"));
        controller
    }

    pub fn add_argument(&mut self, value: impl Into<String>) {
        self.args.push(value.into());
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn set_status_path(&mut self, path: impl Into<PathBuf>) {
        self.status_path = path.into();
    }

    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(Priority, &str, WorkerState) + Send + Sync + 'static,
    {
        self.shared.set_observer(Arc::new(observer));
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    pub fn last_message(&self) -> String {
        self.shared.lock().last_message.clone()
    }

    /// Experiment and run number of the current (or last) run.
    pub fn run_numbers(&self) -> (u32, u32) {
        let run = self.shared.lock();
        (run.exp, run.run)
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker().as_ref().map(Child::id)
    }

    pub fn is_alive(&self) -> bool {
        let mut worker = self.worker();
        let Some(child) = worker.as_mut() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Event counter maintained by the worker.
    pub fn events(&self) -> u32 {
        self.block()
            .as_ref()
            .map(|b| b.get(Field::Events))
            .unwrap_or(0)
    }

    fn worker(&self) -> MutexGuard<'_, Option<Child>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn block(&self) -> MutexGuard<'_, Option<StatusBlock>> {
        self.block.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace any previous worker with a fresh one and wait until it
    /// reports `ready`. On failure the state is left as the worker last
    /// reported it.
    pub fn load(&self, timeout: Duration) -> Result<(), ControllerError> {
        self.abort();
        let block =
            StatusBlock::create(&self.status_path).map_err(|source| ControllerError::StatusBlock {
                path: self.status_path.display().to_string(),
                source,
            })?;
        let epoch = {
            let mut run = self.shared.lock();
            run.state = WorkerState::Loading;
            run.last_message.clear();
            run.exp = 0;
            run.run = 0;
            run.epoch
        };
        self.shared.changed.notify_all();

        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .envs(&self.env)
            .env(STATUS_BLOCK_ENV, &self.status_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                {
                    let mut run = self.shared.lock();
                    run.state = WorkerState::Error;
                    run.last_message = format!("failed to spawn: {source}");
                }
                self.shared.changed.notify_all();
                return Err(ControllerError::Spawn {
                    name: self.name().to_string(),
                    executable: self.executable.display().to_string(),
                    source,
                });
            }
        };
        info!(
            "[{}] spawned (pid={}, cmd={})",
            self.name(),
            child.id(),
            self.executable.display()
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            // An abort that bumped the epoch before this point found no
            // worker to kill; one that bumps it later finds this child.
            let mut worker = self.worker();
            let current = self.shared.lock().epoch;
            if current != epoch {
                drop(worker);
                info!("[{}] aborted during spawn", self.name());
                process::terminate(self.name(), &mut child, self.stop_timeout);
                return Err(ControllerError::Aborted {
                    target: WorkerState::Ready,
                    last: self.last_message(),
                });
            }
            *self.block() = Some(block);
            *worker = Some(child);
        }

        if let Some(stdout) = stdout {
            listener::spawn(Arc::clone(&self.shared), epoch, stdout).map_err(|source| {
                ControllerError::Listener {
                    name: self.name().to_string(),
                    source,
                }
            })?;
        }
        if let Some(stderr) = stderr
            && let Err(e) = listener::drain(self.name().to_string(), stderr)
        {
            warn!("[{}] stderr will not be logged: {e}", self.name());
        }

        self.wait_epoch(WorkerState::Ready, timeout, epoch)
    }

    /// Post a start request with the run numbers and wait for `running`.
    pub fn start(&self, exp: u32, run: u32, timeout: Duration) -> Result<(), ControllerError> {
        let epoch = {
            let mut current = self.shared.lock();
            if current.state != WorkerState::Ready {
                return Err(ControllerError::InvalidState {
                    op: "start",
                    state: current.state,
                });
            }
            current.state = WorkerState::Starting;
            current.exp = exp;
            current.run = run;
            current.epoch
        };
        self.shared.changed.notify_all();
        if let Some(block) = self.block().as_ref() {
            block.set(Field::ExpNo, exp);
            block.set(Field::RunNo, run);
            block.set(Field::SubNo, 0);
            block.post_request(Request::Start);
        }
        info!("[{}] starting run {exp}.{run}", self.name());
        self.wait_epoch(WorkerState::Running, timeout, epoch)
    }

    /// Post a pause request and wait for the worker to report `paused`.
    pub fn pause(&self, timeout: Duration) -> Result<(), ControllerError> {
        self.request(Request::Pause, "pause", &[WorkerState::Running], WorkerState::Paused, timeout)
    }

    /// Post a resume request and wait for `running`.
    pub fn resume(&self, timeout: Duration) -> Result<(), ControllerError> {
        self.request(Request::Resume, "resume", &[WorkerState::Paused], WorkerState::Running, timeout)
    }

    fn request(
        &self,
        request: Request,
        op: &'static str,
        from: &[WorkerState],
        target: WorkerState,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let epoch = {
            let run = self.shared.lock();
            if !from.contains(&run.state) {
                return Err(ControllerError::InvalidState {
                    op,
                    state: run.state,
                });
            }
            run.epoch
        };
        if let Some(block) = self.block().as_ref() {
            block.post_request(request);
        }
        info!("[{}] {op} requested", self.name());
        self.wait_epoch(target, timeout, epoch)
    }

    /// Post a stop request and wait for the worker to be `ready` again.
    pub fn stop(&self, timeout: Duration) -> Result<(), ControllerError> {
        let epoch = {
            let mut run = self.shared.lock();
            if !matches!(
                run.state,
                WorkerState::Running | WorkerState::Starting | WorkerState::Paused
            ) {
                return Err(ControllerError::InvalidState {
                    op: "stop",
                    state: run.state,
                });
            }
            run.state = WorkerState::Stopping;
            run.epoch
        };
        self.shared.changed.notify_all();
        if let Some(block) = self.block().as_ref() {
            block.post_request(Request::Stop);
        }
        info!("[{}] stopping", self.name());
        self.wait_epoch(WorkerState::Ready, timeout, epoch)
    }

    /// Wake every waiter, forget the current run and terminate the worker.
    /// Safe to call at any time, from any thread, any number of times.
    pub fn abort(&self) {
        let epoch = {
            let mut run = self.shared.lock();
            run.epoch += 1;
            run.state = WorkerState::Unconfigured;
            run.epoch
        };
        self.shared.changed.notify_all();
        if let Some(block) = self.block().as_ref() {
            block.clear();
        }
        let child = self.worker().take();
        if let Some(mut child) = child {
            process::terminate(self.name(), &mut child, self.stop_timeout);
        }
        debug!("[{}] aborted (epoch {epoch})", self.name());
    }

    /// Block until the worker reaches `target`. Fails early when it reports
    /// an error or the controller is aborted; a timeout is always a failure.
    pub fn wait_for(&self, target: WorkerState, timeout: Duration) -> Result<(), ControllerError> {
        let epoch = self.shared.lock().epoch;
        self.wait_epoch(target, timeout, epoch)
    }

    fn wait_epoch(
        &self,
        target: WorkerState,
        timeout: Duration,
        epoch: u64,
    ) -> Result<(), ControllerError> {
        let guard = self.shared.lock();
        let (run, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |run| {
                run.epoch == epoch && run.state != target && !run.state.is_error()
            })
            .unwrap_or_else(PoisonError::into_inner);
        let last = run.last_message.clone();
        if run.epoch != epoch {
            Err(ControllerError::Aborted { target, last })
        } else if run.state == target {
            Ok(())
        } else if run.state.is_error() {
            Err(ControllerError::Failed {
                state: run.state,
                last,
            })
        } else {
            Err(ControllerError::Timeout {
                target,
                timeout,
                last,
            })
        }
    }
}

impl Drop for SubprocessController {
    fn drop(&mut self) {
        self.abort();
    }
}
