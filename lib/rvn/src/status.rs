// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live view of a built topology.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::Serialize;
use slog::{warn, Logger};

use crate::engine::{Engine, LifecycleError};
use crate::hypervisor::{ConnectionManager, DomainState, Hypervisor};
use crate::store::{ConfigState, ConfigStates};
use crate::subnet::SubnetAllocator;
use crate::topology::Topology;
use crate::workspace::Workspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomState {
    // Sic; consumers match on this exact string.
    #[serde(rename = "non-existant")]
    NonExistent,
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
    Off,
}

impl From<DomainState> for DomState {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::NoState => DomState::NoState,
            DomainState::Running => DomState::Running,
            DomainState::Blocked => DomState::Blocked,
            DomainState::Paused => DomState::Paused,
            DomainState::Shutdown => DomState::Shutdown,
            DomainState::Shutoff => DomState::Off,
            DomainState::Crashed => DomState::Crashed,
            DomainState::PmSuspended => DomState::Suspended,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    #[serde(rename = "non-existant")]
    NonExistent,
}

/// Snapshot of one host. Addresses and configuration state are only
/// gathered for running hosts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DomStatus {
    pub name: String,
    pub state: DomState,
    pub config_state: ConfigState,
    #[serde(rename = "IP")]
    pub ip: Option<IpAddr>,
    pub macs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TopologyStatus {
    pub nodes: BTreeMap<String, DomStatus>,
    pub switches: BTreeMap<String, DomStatus>,
    pub links: BTreeMap<String, LinkState>,
    #[serde(rename = "mgmtip", skip_serializing_if = "Option::is_none")]
    pub management_ip: Option<Ipv4Addr>,
}

/// Owned handles for observing a topology, so status can be gathered on a
/// blocking thread.
#[derive(Clone)]
pub(crate) struct Observer {
    conn: Arc<ConnectionManager>,
    states: ConfigStates,
    subnets: SubnetAllocator,
    log: Logger,
}

impl Engine {
    pub(crate) fn observer(&self) -> Observer {
        Observer {
            conn: self.conn.clone(),
            states: self.states.clone(),
            subnets: self.subnets.clone(),
            log: self.log.clone(),
        }
    }

    /// Status of the topology built in `ws`, or `None` if nothing is built.
    pub fn status(
        &self,
        ws: &Workspace,
    ) -> Result<Option<TopologyStatus>, LifecycleError> {
        match ws.load_topology()? {
            Some(topo) => self.observer().topology_status(&topo).map(Some),
            None => Ok(None),
        }
    }

    /// Status of a single host of the topology built in `ws`.
    pub fn host_status(
        &self,
        ws: &Workspace,
        host: &str,
    ) -> Result<DomStatus, LifecycleError> {
        let topo = topology_with_host(ws, host)?;
        Ok(self.observer().host_status(&topo, host))
    }

    /// [`Engine::host_status`] for async callers. The endpoint is queried on
    /// the blocking pool.
    pub async fn observe_host(
        &self,
        ws: &Workspace,
        host: &str,
    ) -> Result<DomStatus, LifecycleError> {
        let topo = topology_with_host(ws, host)?;
        let observer = self.observer();
        let host = host.to_string();
        let status = tokio::task::spawn_blocking(move || {
            observer.host_status(&topo, &host)
        })
        .await?;
        Ok(status)
    }
}

fn topology_with_host(
    ws: &Workspace,
    host: &str,
) -> Result<Topology, LifecycleError> {
    let topo = ws
        .load_topology()?
        .ok_or_else(|| LifecycleError::NotBuilt(ws.source_dir().to_path_buf()))?;
    if topo.host(host).is_none() {
        return Err(LifecycleError::UnknownHost {
            topology: topo.name.clone(),
            host: host.to_string(),
        });
    }
    Ok(topo)
}

impl Observer {
    pub(crate) fn topology_status(
        &self,
        topo: &Topology,
    ) -> Result<TopologyStatus, LifecycleError> {
        let hv = self.conn.ensure_healthy();
        let mut status = TopologyStatus::default();
        for host in &topo.nodes {
            status
                .nodes
                .insert(host.name.clone(), self.dom_status(&*hv, topo, &host.name));
        }
        for host in &topo.switches {
            status.switches.insert(
                host.name.clone(),
                self.dom_status(&*hv, topo, &host.name),
            );
        }
        for link in &topo.links {
            let state = match hv.network_active(&topo.qualify(&link.name)) {
                Ok(true) => LinkState::Up,
                Ok(false) => LinkState::Down,
                Err(_) => LinkState::NonExistent,
            };
            status.links.insert(link.name.clone(), state);
        }
        status.management_ip =
            self.subnets.lookup(&topo.name)?.map(|s| s.gateway());
        Ok(status)
    }

    fn host_status(&self, topo: &Topology, host: &str) -> DomStatus {
        let hv = self.conn.ensure_healthy();
        self.dom_status(&*hv, topo, host)
    }

    fn dom_status(
        &self,
        hv: &dyn Hypervisor,
        topo: &Topology,
        host: &str,
    ) -> DomStatus {
        let mut status = DomStatus {
            name: host.to_string(),
            state: DomState::NonExistent,
            config_state: ConfigState::Unset,
            ip: None,
            macs: Vec::new(),
        };
        let qname = topo.qualify(host);
        let Ok(state) = hv.domain_state(&qname) else {
            return status;
        };
        status.state = state.into();
        if state != DomainState::Running {
            return status;
        }

        match hv.domain_interfaces(&qname) {
            Ok(ifaces) => {
                status.ip = ifaces.first().and_then(|i| i.addrs.first()).copied();
                status.macs = ifaces.into_iter().map(|i| i.mac).collect();
            }
            Err(e) => warn!(self.log, "failed to read interface leases";
                "domain" => &qname, "error" => %e),
        }

        self.states.ensure_healthy();
        status.config_state = match self.states.get(&topo.name, host) {
            Ok(s) => s,
            Err(e) => {
                warn!(self.log, "failed to read configuration state";
                    "host" => host, "error" => %e);
                ConfigState::Unset
            }
        };
        status
    }
}
