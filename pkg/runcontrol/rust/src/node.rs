// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! A node assembled from its configuration file.

use crate::config::{self, NodeConfig, ProcessConfig};
use crate::engine::StateMachine;
use crate::hv::{self, HighVoltage, HvControl, HvDevice};
use crate::rc::RunControl;
use crate::worker::WorkerRunControl;
use anyhow::{Context, Result, bail};
use log::info;
use slc_nsm::{Dispatcher, Endpoint, Transport, spawn_receive_loop};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

/// What a node does behind its dispatcher.
pub enum Role {
    /// Run control driving a worker process.
    Worker {
        hooks: Arc<WorkerRunControl>,
        machine: Arc<StateMachine<RunControl>>,
    },
    HighVoltage {
        machine: Arc<StateMachine<HighVoltage>>,
    },
    /// Only serves variables and relayed messages.
    Passive,
}

pub struct Node {
    dispatcher: Arc<Dispatcher>,
    role: Role,
}

impl Node {
    /// Build the node described by `config`. A node drives either a worker
    /// or high-voltage channels, never both; `device` is required for the
    /// latter.
    pub fn from_config(
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        device: Option<Arc<dyn HvDevice>>,
    ) -> Result<Node> {
        let dispatcher = Arc::new(Dispatcher::new(&config.node, transport));
        dispatcher.set_log_node(config.log_node.clone());

        let role = match (&config.worker, &config.hv) {
            (Some(_), Some(_)) => {
                bail!("{}: a node cannot have both a worker and hv", config.node)
            }
            (Some(worker), None) => {
                let auxiliary = auxiliary_configs(config)?;
                let hooks = Arc::new(
                    WorkerRunControl::new(&config.node.to_ascii_lowercase(), worker.clone())
                        .with_auxiliary(&auxiliary),
                );
                let machine = Arc::clone(&hooks)
                    .install(Arc::clone(&dispatcher))
                    .with_context(|| format!("{}: starting liveness monitor", config.node))?;
                Role::Worker { hooks, machine }
            }
            (None, Some(hv_config)) => {
                let Some(device) = device else {
                    bail!("{}: hv channels configured without a device", config.node);
                };
                let control = Arc::new(HvControl::new(hv_config, device));
                control.publish(&dispatcher);
                let machine = hv::install(Arc::clone(&dispatcher), control);
                Role::HighVoltage { machine }
            }
            (None, None) => Role::Passive,
        };
        info!("[{}] node configured", config.node);
        Ok(Node { dispatcher, role })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Start receiving on `endpoint`.
    pub fn serve(&self, endpoint: Endpoint) -> std::io::Result<JoinHandle<()>> {
        spawn_receive_loop(Arc::clone(&self.dispatcher), endpoint)
    }

    /// Terminate every process the node supervises.
    pub fn shutdown(&self) {
        if let Role::Worker { hooks, .. } = &self.role {
            hooks.shutdown();
        }
    }
}

fn auxiliary_configs(config: &NodeConfig) -> Result<Vec<(String, ProcessConfig)>> {
    let dir = match &config.process_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir: PathBuf = config::config_dir();
            if !dir.is_dir() {
                return Ok(Vec::new());
            }
            dir
        }
    };
    config::load_configs(&dir)
}
