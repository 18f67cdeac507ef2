// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Default location of the orchestrator configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rvn/rvn.toml";

/// Configuration for the rvn orchestrator.
///
/// Every table and every key within a table is optional; anything omitted
/// takes the value a stock host installation uses.
#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hypervisor: Hypervisor,
    pub paths: Paths,
    pub liveness: Liveness,
    pub configure: Configure,
}

/// How to reach the local virtualization control endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Hypervisor {
    /// Connection URI handed to `virsh -c`.
    pub uri: String,
    /// The `virsh` binary to invoke.
    pub virsh: PathBuf,
}
impl Default for Hypervisor {
    fn default() -> Self {
        Self { uri: "qemu:///system".to_string(), virsh: "virsh".into() }
    }
}

/// Well-known host paths.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Paths {
    /// Persisted subnet table shared by every topology on the host.
    pub runtime: PathBuf,
    /// Directory backing the configuration-state store.
    pub state_dir: PathBuf,
    /// Base image cache.
    pub image_dir: PathBuf,
    /// Private key the configuration runner logs in with.
    pub ssh_key: PathBuf,
    /// Directory NFS export fragments are written into.
    pub exports_dir: PathBuf,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            runtime: "/var/rvn/run".into(),
            state_dir: "/var/rvn/state".into(),
            image_dir: "/var/rvn/img".into(),
            ssh_key: "/var/rvn/ssh/rvn".into(),
            exports_dir: "/etc/exports.d".into(),
        }
    }
}

/// Backoff applied while waiting for an external endpoint to come up.
///
/// There is deliberately no limit on total elapsed time: the endpoints are
/// local daemons which are expected to eventually become available.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Liveness {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}
impl Default for Liveness {
    fn default() -> Self {
        Self { initial_interval_ms: 100, max_interval_ms: 5000 }
    }
}
impl Liveness {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Host configuration runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Configure {
    /// Upper bound on concurrently running per-host configuration tasks.
    pub max_parallel: usize,
    /// Playbook runner binary.
    pub runner: PathBuf,
    /// Remote user the runner logs in as.
    pub user: String,
    /// Password used for privilege escalation on the guest.
    pub become_pass: String,
}
impl Default for Configure {
    fn default() -> Self {
        Self {
            max_parallel: 16,
            runner: "ansible-playbook".into(),
            user: "rvn".to_string(),
            become_pass: "rvn".to_string(),
        }
    }
}

/// Errors which may be returned when parsing the orchestrator configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configure.max_parallel must be at least 1")]
    ZeroParallelism,

    #[error("liveness.{0} must be at least 1 ms")]
    ZeroInterval(&'static str),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}

/// Like [`parse`], but a file which does not exist yields the defaults.
pub fn parse_or_default<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(contents) => from_str(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn from_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    if cfg.configure.max_parallel == 0 {
        return Err(ParseError::ZeroParallelism);
    }
    if cfg.liveness.initial_interval_ms == 0 {
        return Err(ParseError::ZeroInterval("initial_interval_ms"));
    }
    if cfg.liveness.max_interval_ms == 0 {
        return Err(ParseError::ZeroInterval("max_interval_ms"));
    }
    Ok(cfg)
}
