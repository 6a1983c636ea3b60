// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_DIR: &str = "/etc/slc/processes.d";

fn default_load_timeout() -> u64 {
    30
}

fn default_run_timeout() -> u64 {
    10
}

fn default_monitor_period_ms() -> u64 {
    1000
}

fn default_status_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_ramp() -> f32 {
    10.0
}

/// Top-level configuration of one node.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub node: String,
    /// Node that collects this node's log entries.
    pub log_node: Option<String>,
    pub worker: Option<WorkerConfig>,
    pub hv: Option<HvConfig>,
    /// Auxiliary process configs of a worker node. Defaults to
    /// [`config_dir`] when that directory exists.
    pub process_dir: Option<PathBuf>,
}

/// Worker process driven by a run-control node. Timeouts are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
    #[serde(default = "default_load_timeout")]
    pub load_timeout: u64,
    #[serde(default = "default_run_timeout")]
    pub start_timeout: u64,
    #[serde(default = "default_run_timeout")]
    pub stop_timeout: u64,
    /// Period of the liveness check while a run is in progress.
    #[serde(default = "default_monitor_period_ms")]
    pub monitor_period_ms: u64,
}

impl WorkerConfig {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            status_dir: default_status_dir(),
            load_timeout: default_load_timeout(),
            start_timeout: default_run_timeout(),
            stop_timeout: default_run_timeout(),
            monitor_period_ms: default_monitor_period_ms(),
        }
    }

    pub fn load_wait(&self) -> Duration {
        Duration::from_secs(self.load_timeout)
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_secs(self.start_timeout)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }
}

/// High-voltage channels handled by one node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HvConfig {
    #[serde(default)]
    pub channels: Vec<HvChannelConfig>,
}

/// One channel with its demand voltage per level and ramp rates (V/s).
#[derive(Debug, Clone, Deserialize)]
pub struct HvChannelConfig {
    #[serde(rename = "crate")]
    pub crate_id: u32,
    pub slot: u32,
    pub channel: u32,
    pub standby: f32,
    pub standby2: f32,
    pub standby3: f32,
    pub peak: f32,
    #[serde(default = "default_ramp")]
    pub ramp_up: f32,
    #[serde(default = "default_ramp")]
    pub ramp_down: f32,
}

/// Auxiliary process started alongside the worker, one file per process in
/// the process config directory.
#[derive(Debug, Deserialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub ready_path: Option<String>,
    pub stop_timeout: Option<u64>,
}

pub fn config_dir() -> PathBuf {
    std::env::var("SLC_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

pub fn load_node_config(path: &Path) -> Result<NodeConfig> {
    let config: NodeConfig = read_yaml(path)?;
    if config.node.trim().is_empty() {
        bail!("{}: node name must not be empty", path.display());
    }
    Ok(config)
}

/// Parse every `*.yaml`/`*.yml` file of `dir` as one auxiliary process,
/// named after the file stem, in file-name order. A file that cannot be read
/// or parsed is skipped with a warning; only an unreadable directory fails.
pub fn load_configs(dir: &Path) -> Result<Vec<(String, ProcessConfig)>> {
    let mut configs = Vec::new();
    for path in yaml_files(dir)? {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!("skipping {}: file name is not UTF-8", path.display());
            continue;
        };
        match read_yaml::<ProcessConfig>(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!("skipping {}: {e:#}", path.display()),
        }
    }
    debug!("{} process config(s) in {}", configs.len(), dir.display());
    Ok(configs)
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read config directory: {}", dir.display()))?
    {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => warn!("skipping unreadable entry in {}: {e}", dir.display()),
        }
    }
    paths.retain(|p| {
        matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
    });
    paths.sort();
    Ok(paths)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_full_node_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
node: CPR5001
log_node: LOGCOLLECTOR
process_dir: /etc/slc/cpr5001.d
worker:
  executable: /usr/bin/basf2
  args: ["--steering", "hlt.py"]
  env:
    RUN_TYPE: physics
  status_dir: /dev/shm
  load_timeout: 60
hv:
  channels:
    - crate: 0
      slot: 3
      channel: 7
      standby: 500
      standby2: 1200
      standby3: 1800
      peak: 2300
      ramp_up: 25
"#;
        let path = dir.path().join("cpr5001.yaml");
        fs::write(&path, yaml).unwrap();

        let cfg = load_node_config(&path).unwrap();
        assert_eq!(cfg.node, "CPR5001");
        assert_eq!(cfg.log_node.as_deref(), Some("LOGCOLLECTOR"));

        let worker = cfg.worker.unwrap();
        assert_eq!(worker.args, vec!["--steering", "hlt.py"]);
        assert_eq!(worker.env.get("RUN_TYPE").unwrap(), "physics");
        assert_eq!(worker.status_dir, PathBuf::from("/dev/shm"));
        assert_eq!(worker.load_wait(), Duration::from_secs(60));
        assert_eq!(worker.start_wait(), Duration::from_secs(10));
        assert_eq!(worker.stop_wait(), Duration::from_secs(10));
        assert_eq!(worker.monitor_period(), Duration::from_secs(1));
        assert_eq!(cfg.process_dir, Some(PathBuf::from("/etc/slc/cpr5001.d")));

        let hv = cfg.hv.unwrap();
        assert_eq!(hv.channels.len(), 1);
        let ch = &hv.channels[0];
        assert_eq!((ch.crate_id, ch.slot, ch.channel), (0, 3, 7));
        assert_eq!(ch.peak, 2300.0);
        assert_eq!(ch.ramp_up, 25.0);
        assert_eq!(ch.ramp_down, 10.0);
    }

    #[test]
    fn test_parse_minimal_node_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hv.yaml");
        fs::write(&path, "node: HVCTRL\n").unwrap();
        let cfg = load_node_config(&path).unwrap();
        assert!(cfg.worker.is_none());
        assert!(cfg.hv.is_none());
        assert!(cfg.log_node.is_none());
        assert!(cfg.process_dir.is_none());
    }

    #[test]
    fn test_empty_node_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "node: '  '\n").unwrap();
        let err = load_node_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("node name"));
    }

    #[test]
    fn test_missing_node_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_node_config(&dir.path().join("none.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading"));
    }

    #[test]
    fn test_load_configs_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zeta.yaml"), "command: /bin/z\n").unwrap();
        fs::write(dir.path().join("alpha.yml"), "command: /bin/a\nstop_timeout: 2\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();

        let configs = load_configs(dir.path()).unwrap();
        let names: Vec<_> = configs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(configs[0].1.stop_timeout, Some(2));
    }

    #[test]
    fn test_load_configs_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.yaml"), "command: /bin/true\n").unwrap();
        fs::write(dir.path().join("bad.yaml"), "args: [unterminated\n").unwrap();

        let configs = load_configs(dir.path()).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, "good");
    }

    #[test]
    fn test_load_configs_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_configs(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_config_dir_env_override() {
        temp_env::with_var("SLC_CONFIG_DIR", Some("/opt/slc/procs"), || {
            assert_eq!(config_dir(), PathBuf::from("/opt/slc/procs"));
        });
        temp_env::with_var_unset("SLC_CONFIG_DIR", || {
            assert_eq!(config_dir(), PathBuf::from(DEFAULT_CONFIG_DIR));
        });
    }
}
