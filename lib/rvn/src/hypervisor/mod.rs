// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtualization control endpoint.
//!
//! Domains and networks are addressed by qualified name. A name that the
//! endpoint does not know is reported as [`HypervisorError::NotFound`], which
//! callers use as the "lookup failed" signal.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

mod connection;
#[cfg(test)]
pub(crate) mod fake;
mod virsh;

pub use connection::ConnectionManager;
pub use virsh::{Virsh, VirshConnector};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    Domain,
    Network,
}

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("{kind} {name} does not exist")]
    NotFound { kind: ResourceKind, name: String },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected output from {command}: {output:?}")]
    Parse { command: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }
}

/// Run state of a domain as the endpoint reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    /// Shutting down; still active.
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Whether the domain currently holds a running instance.
    pub fn is_active(self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::Crashed)
    }
}

/// One guest interface and the addresses leased to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceAddresses {
    pub name: String,
    pub mac: String,
    pub addrs: Vec<IpAddr>,
}

/// Name-addressed domain and network primitives.
pub trait Hypervisor: Send + Sync {
    /// Cheap health check of the underlying connection.
    fn is_alive(&self) -> bool;

    /// Defines (or redefines) a persistent domain from its XML description.
    fn define_domain(&self, name: &str, xml: &str) -> Result<(), HypervisorError>;
    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError>;
    fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;
    /// Forcibly stops a running domain.
    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;
    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;
    /// Graceful ACPI power-button shutdown.
    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError>;
    fn reboot_domain(&self, name: &str) -> Result<(), HypervisorError>;
    /// Hard reset, for firmware that ignores graceful reboot requests.
    fn reset_domain(&self, name: &str) -> Result<(), HypervisorError>;
    /// Interfaces with addresses from the management network's DHCP leases.
    fn domain_interfaces(
        &self,
        name: &str,
    ) -> Result<Vec<InterfaceAddresses>, HypervisorError>;
    fn domain_vnc_port(&self, name: &str) -> Result<Option<u16>, HypervisorError>;

    fn define_network(&self, name: &str, xml: &str) -> Result<(), HypervisorError>;
    fn network_active(&self, name: &str) -> Result<bool, HypervisorError>;
    fn start_network(&self, name: &str) -> Result<(), HypervisorError>;
    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError>;
    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError>;
    fn network_bridge(&self, name: &str) -> Result<String, HypervisorError>;
}

/// Establishes connections to the endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn Hypervisor>, HypervisorError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inactive_states() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Paused.is_active());
        assert!(DomainState::Shutdown.is_active());
        assert!(!DomainState::Shutoff.is_active());
        assert!(!DomainState::Crashed.is_active());
    }

    #[test]
    fn not_found_is_distinguished() {
        let e = HypervisorError::NotFound {
            kind: ResourceKind::Network,
            name: "lab_test".into(),
        };
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "network lab_test does not exist");
        let e = HypervisorError::Command {
            command: "virsh start".into(),
            stderr: "boom".into(),
        };
        assert!(!e.is_not_found());
    }
}
