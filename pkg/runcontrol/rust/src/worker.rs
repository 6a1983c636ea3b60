// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Run control of a node whose work is done by a supervised worker process.

use crate::config::{ProcessConfig, WorkerConfig};
use crate::controller::SubprocessController;
use crate::engine::{StateMachine, Vocabulary};
use crate::errors::HookError;
use crate::process::{self, ProcessSupervisor};
use crate::rc::{self, RcHooks, RcNode, RcState, RunControl};
use crate::state::WorkerState;
use log::{debug, error, info, warn};
use slc_log::Priority;
use slc_nsm::{Dispatcher, FnHandler, Value, VarType, Variable};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

pub struct WorkerRunControl {
    name: String,
    config: WorkerConfig,
    controller: Arc<SubprocessController>,
    auxiliary: Mutex<Vec<ProcessSupervisor>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl WorkerRunControl {
    pub fn new(name: &str, config: WorkerConfig) -> Self {
        let controller = SubprocessController::from_config(name, &config);
        Self {
            name: name.to_string(),
            config,
            controller: Arc::new(controller),
            auxiliary: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Processes loaded before the worker and aborted with it, in order.
    pub fn with_auxiliary(self, configs: &[(String, ProcessConfig)]) -> Self {
        {
            let mut aux = self.auxiliary();
            for (index, (name, config)) in configs.iter().enumerate() {
                aux.push(ProcessSupervisor::from_config(name, index as u32, config));
            }
        }
        self
    }

    pub fn controller(&self) -> &Arc<SubprocessController> {
        &self.controller
    }

    /// Pids of the auxiliary processes that are currently alive.
    pub fn auxiliary_pids(&self) -> Vec<u32> {
        self.auxiliary()
            .iter_mut()
            .filter_map(|p| if p.is_alive() { p.pid() } else { None })
            .collect()
    }

    fn auxiliary(&self) -> MutexGuard<'_, Vec<ProcessSupervisor>> {
        self.auxiliary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the worker variables, install the run-control machine, route
    /// worker failures into the node state and start the liveness monitor.
    pub fn install(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
    ) -> io::Result<Arc<StateMachine<RunControl>>> {
        self.publish(&dispatcher);
        let machine = rc::install(dispatcher, Arc::clone(&self));
        let node = machine.node().clone();
        self.controller.set_observer(move |priority, text, state| {
            if priority >= Priority::Warning {
                node.log(priority, text);
            }
            match state {
                WorkerState::Fatal => node.force_state(RcState::Fatal),
                WorkerState::Error if !RunControl::is_error(node.state()) => {
                    node.force_state(RcState::Error)
                }
                _ => {}
            }
        });
        self.spawn_monitor(machine.node().clone())?;
        Ok(machine)
    }

    fn spawn_monitor(self: &Arc<Self>, node: RcNode) -> io::Result<()> {
        let this = Arc::downgrade(self);
        let shutting_down = Arc::clone(&self.shutting_down);
        let period = self.config.monitor_period();
        let handle = thread::Builder::new()
            .name(format!("{}-monitor", self.name))
            .spawn(move || {
                loop {
                    thread::park_timeout(period);
                    if shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(this) = this.upgrade() else {
                        break;
                    };
                    this.check_liveness(&node);
                }
                debug!("[{}] liveness monitor stopped", node.name());
            })?;
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// While a run is in progress, a dead worker or auxiliary process puts
    /// the node in ERROR.
    fn check_liveness(&self, node: &RcNode) {
        let state = node.state();
        if !matches!(state, RcState::Running | RcState::Paused) {
            return;
        }
        let mut down = Vec::new();
        if !self.controller.is_alive() {
            down.push(self.name.clone());
        }
        // A command hook holding the list means the run is changing anyway.
        let aux = match self.auxiliary.try_lock() {
            Ok(aux) => Some(aux),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut aux) = aux {
            for p in aux.iter_mut() {
                if p.has_died() {
                    down.push(p.name().to_string());
                }
            }
        }
        if down.is_empty() {
            return;
        }
        if node.transition(state, RcState::Error) {
            node.log(Priority::Error, &format!("{} down while {state}", down.join(", ")));
        }
    }

    /// Stop the liveness monitor and terminate the worker and every
    /// auxiliary process.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handle = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("[{}] liveness monitor panicked", self.name);
            }
        }
        self.abort_all();
    }

    fn publish(&self, dispatcher: &Dispatcher) {
        let c = Arc::clone(&self.controller);
        dispatcher.register_variable(Variable::with_handler(
            "nevents",
            VarType::Int,
            Arc::new(FnHandler::getter(move || {
                Ok(Value::Int(i32::try_from(c.events()).unwrap_or(i32::MAX)))
            })),
        ));
        let c = Arc::clone(&self.controller);
        dispatcher.register_variable(Variable::with_handler(
            "worker.state",
            VarType::Text,
            Arc::new(FnHandler::getter(move || Ok(Value::Text(c.state().to_string())))),
        ));
        let c = Arc::clone(&self.controller);
        dispatcher.register_variable(Variable::with_handler(
            "worker.msg",
            VarType::Text,
            Arc::new(FnHandler::getter(move || Ok(Value::Text(c.last_message())))),
        ));
        let c = Arc::clone(&self.controller);
        dispatcher.register_variable(Variable::with_handler(
            "runno",
            VarType::Int,
            Arc::new(FnHandler::getter(move || {
                let (_, run) = c.run_numbers();
                Ok(Value::Int(i32::try_from(run).unwrap_or(i32::MAX)))
            })),
        ));
    }

    fn abort_all(&self) {
        self.controller.abort();
        process::shutdown_all(&mut self.auxiliary());
    }
}

impl RcHooks for WorkerRunControl {
    fn boot(&self, node: &RcNode) -> Result<(), HookError> {
        if !Path::new(&self.config.executable).exists() {
            return Err(HookError::Failed(format!(
                "worker executable {} not found",
                self.config.executable
            )));
        }
        node.reply(&format!("worker {}", self.config.executable));
        Ok(())
    }

    fn load(&self, _node: &RcNode) -> Result<(), HookError> {
        for aux in self.auxiliary().iter_mut() {
            aux.load(self.config.load_wait())?;
        }
        self.controller.load(self.config.load_wait())?;
        Ok(())
    }

    fn start(&self, exp: u32, run: u32, _node: &RcNode) -> Result<(), HookError> {
        self.controller.start(exp, run, self.config.start_wait())?;
        for aux in self.auxiliary().iter_mut() {
            if let Err(e) = aux.start(exp, run) {
                warn!("[{}] {e}", self.name);
            }
        }
        Ok(())
    }

    fn stop(&self, _node: &RcNode) -> Result<(), HookError> {
        self.controller.stop(self.config.stop_wait())?;
        for aux in self.auxiliary().iter_mut() {
            if let Err(e) = aux.stop() {
                warn!("[{}] {e}", self.name);
            }
        }
        Ok(())
    }

    fn pause(&self, _node: &RcNode) -> Result<(), HookError> {
        self.controller.pause(self.config.start_wait())?;
        for aux in self.auxiliary().iter_mut() {
            if let Err(e) = aux.pause() {
                warn!("[{}] {e}", self.name);
            }
        }
        Ok(())
    }

    fn resume(&self, _node: &RcNode) -> Result<(), HookError> {
        self.controller.resume(self.config.start_wait())?;
        for aux in self.auxiliary().iter_mut() {
            if let Err(e) = aux.resume() {
                warn!("[{}] {e}", self.name);
            }
        }
        Ok(())
    }

    fn recover(&self, node: &RcNode) -> Result<(), HookError> {
        self.abort_all();
        self.load(node)
    }

    fn abort(&self, _node: &RcNode) -> Result<(), HookError> {
        self.abort_all();
        Ok(())
    }

    fn interrupt(&self, node: &RcNode) {
        info!("[{}] abort requested in {}", self.name, node.state());
        self.controller.abort();
    }
}
