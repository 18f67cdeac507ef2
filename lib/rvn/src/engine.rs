// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The orchestrator: one [`Engine`] per process, driving the lifecycle,
//! status and configuration operations for any testbed workspace.

use std::path::PathBuf;
use std::sync::Arc;

use rvn_config_toml::Config;
use slog::{o, Logger};
use thiserror::Error;

use crate::configure::runner::{AnsibleRunner, ConfigRunner};
use crate::host::{HostOps, HostOpsError, SystemHostOps};
use crate::hypervisor::{
    ConnectionManager, Connector, HypervisorError, VirshConnector,
};
use crate::liveness::LivenessPolicy;
use crate::store::{ConfigStates, FileStore, StateStore, StoreError};
use crate::subnet::{SubnetAllocator, SubnetError};
use crate::synth::ImageError;
use crate::topology::TopologyError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Subnet(#[from] SubnetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    HostOps(#[from] HostOpsError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render base configuration for {host}: {source}")]
    BaseConfig {
        host: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),

    #[error("no topology has been built in {0}")]
    NotBuilt(PathBuf),

    #[error("host {host} is not part of topology {topology}")]
    UnknownHost { topology: String, host: String },

    #[error("request names topology {requested} but {actual} is built here")]
    TopologyMismatch { requested: String, actual: String },
}

/// A domain or network operation that failed while its peers went ahead.
#[derive(Debug, Error)]
#[error("{resource}: {error}")]
pub struct ResourceError {
    pub resource: String,
    #[source]
    pub error: HypervisorError,
}

/// Any one failure collected by a multi-resource operation.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("{what}: {source}")]
    Host {
        what: String,
        #[source]
        source: HostOpsError,
    },

    #[error("configuration state of {host}: {source}")]
    State {
        host: String,
        #[source]
        source: StoreError,
    },
}

impl Failure {
    pub(crate) fn resource(
        resource: impl Into<String>,
        error: HypervisorError,
    ) -> Self {
        Failure::Resource(ResourceError { resource: resource.into(), error })
    }

    pub(crate) fn host(what: impl Into<String>, source: HostOpsError) -> Self {
        Failure::Host { what: what.into(), source }
    }
}

/// The external collaborators an [`Engine`] drives.
pub struct Collaborators {
    pub connector: Box<dyn Connector>,
    pub store: Arc<dyn StateStore>,
    pub host: Arc<dyn HostOps>,
    pub runner: Arc<dyn ConfigRunner>,
}

impl Collaborators {
    /// The production set: `virsh`, the file-backed state store, and real
    /// host commands.
    pub fn system(cfg: &Config, log: &Logger) -> Self {
        Self {
            connector: Box::new(VirshConnector::new(
                &cfg.hypervisor,
                log.new(o!("component" => "virsh")),
            )),
            store: Arc::new(FileStore::new(&cfg.paths.state_dir)),
            host: Arc::new(SystemHostOps::new(
                &cfg.paths.exports_dir,
                log.new(o!("component" => "host")),
            )),
            runner: Arc::new(AnsibleRunner::new(
                &cfg.configure,
                &cfg.paths.ssh_key,
                log.new(o!("component" => "ansible")),
            )),
        }
    }
}

pub struct Engine {
    pub(crate) conn: Arc<ConnectionManager>,
    pub(crate) states: ConfigStates,
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) runner: Arc<dyn ConfigRunner>,
    pub(crate) subnets: SubnetAllocator,
    pub(crate) image_dir: PathBuf,
    pub(crate) max_parallel: usize,
    pub(crate) log: Logger,
}

impl Engine {
    pub fn new(cfg: &Config, parts: Collaborators, log: Logger) -> Self {
        let policy = LivenessPolicy::from(&cfg.liveness);
        Self {
            conn: Arc::new(ConnectionManager::new(
                parts.connector,
                policy,
                log.new(o!("component" => "connection")),
            )),
            states: ConfigStates::new(
                parts.store,
                policy,
                log.new(o!("component" => "state_store")),
            ),
            host: parts.host,
            runner: parts.runner,
            subnets: SubnetAllocator::new(&cfg.paths.runtime),
            image_dir: cfg.paths.image_dir.clone(),
            max_parallel: cfg.configure.max_parallel.max(1),
            log: log.new(o!("component" => "engine")),
        }
    }

    pub fn from_config(cfg: &Config, log: Logger) -> Self {
        let parts = Collaborators::system(cfg, &log);
        Self::new(cfg, parts, log)
    }

    pub(crate) fn topology_log(&self, topology: &str) -> Logger {
        self.log.new(o!("topology" => topology.to_string()))
    }
}
