// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-in for the virtualization endpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use super::{
    Connector, DomainState, Hypervisor, HypervisorError, InterfaceAddresses,
    ResourceKind,
};

#[derive(Clone, Debug)]
pub struct FakeDomain {
    pub xml: String,
    pub state: DomainState,
    pub vnc_display: u16,
    pub lease: InterfaceAddresses,
}

#[derive(Clone, Debug)]
pub struct FakeNetwork {
    pub xml: String,
    pub active: bool,
    pub bridge: String,
}

#[derive(Debug)]
struct Inner {
    alive: bool,
    domains: BTreeMap<String, FakeDomain>,
    networks: BTreeMap<String, FakeNetwork>,
    fail_start: BTreeSet<String>,
    next_id: u16,
    calls: Vec<String>,
}

#[derive(Debug)]
pub struct FakeHypervisor {
    inner: Mutex<Inner>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                alive: true,
                domains: BTreeMap::new(),
                networks: BTreeMap::new(),
                fail_start: BTreeSet::new(),
                next_id: 0,
                calls: Vec::new(),
            }),
        }
    }
}

fn not_found(kind: ResourceKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound { kind, name: name.to_string() }
}

fn invalid(op: &str, why: &str) -> HypervisorError {
    HypervisorError::Command { command: op.to_string(), stderr: why.to_string() }
}

impl FakeHypervisor {
    pub fn set_alive(&self, alive: bool) {
        self.inner.lock().unwrap().alive = alive;
    }

    /// Makes every later start of `name` fail.
    pub fn fail_start(&self, name: &str) {
        self.inner.lock().unwrap().fail_start.insert(name.to_string());
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.inner.lock().unwrap().domains.get(name).cloned()
    }

    pub fn network(&self, name: &str) -> Option<FakeNetwork> {
        self.inner.lock().unwrap().networks.get(name).cloned()
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().domains.keys().cloned().collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        if let Some(d) = self.inner.lock().unwrap().domains.get_mut(name) {
            d.state = state;
        }
    }

    /// Every mutating call made so far, as `"<op> <name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn connector(self: &Arc<Self>) -> Box<dyn Connector> {
        Box::new(FakeConnector(self.clone()))
    }

    fn with_domain<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{op} {name}"));
        let dom = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        f(dom)
    }

    fn with_network<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut FakeNetwork) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{op} {name}"));
        let net = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| not_found(ResourceKind::Network, name))?;
        f(net)
    }
}

impl Hypervisor for FakeHypervisor {
    fn is_alive(&self) -> bool {
        self.inner.lock().unwrap().alive
    }

    fn define_domain(&self, name: &str, xml: &str) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("define_domain {name}"));
        if let Some(d) = inner.domains.get_mut(name) {
            d.xml = xml.to_string();
            return Ok(());
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let [hi, lo] = id.to_be_bytes();
        inner.domains.insert(
            name.to_string(),
            FakeDomain {
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                vnc_display: id,
                lease: InterfaceAddresses {
                    name: "vnet0".to_string(),
                    mac: format!("52:54:00:00:{hi:02x}:{lo:02x}"),
                    addrs: vec![IpAddr::V4(Ipv4Addr::new(172, 22, hi, lo))],
                },
            },
        );
        Ok(())
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        self.inner
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))
    }

    fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let fail = self.inner.lock().unwrap().fail_start.contains(name);
        self.with_domain("start_domain", name, |d| {
            if d.state.is_active() {
                return Err(invalid("start", "domain is already active"));
            }
            if fail {
                return Err(invalid("start", "injected failure"));
            }
            d.state = DomainState::Running;
            Ok(())
        })
    }

    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_domain("destroy_domain", name, |d| {
            if !d.state.is_active() {
                return Err(invalid("destroy", "domain is not running"));
            }
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("undefine_domain {name}"));
        inner
            .domains
            .remove(name)
            .map(drop)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_domain("shutdown_domain", name, |d| {
            if !d.state.is_active() {
                return Err(invalid("shutdown", "domain is not running"));
            }
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn reboot_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_domain("reboot_domain", name, |d| {
            if !d.state.is_active() {
                return Err(invalid("reboot", "domain is not running"));
            }
            Ok(())
        })
    }

    fn reset_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_domain("reset_domain", name, |d| {
            if !d.state.is_active() {
                return Err(invalid("reset", "domain is not running"));
            }
            Ok(())
        })
    }

    fn domain_interfaces(
        &self,
        name: &str,
    ) -> Result<Vec<InterfaceAddresses>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        let d = inner
            .domains
            .get(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        if d.state == DomainState::Running {
            Ok(vec![d.lease.clone()])
        } else {
            Ok(vec![])
        }
    }

    fn domain_vnc_port(&self, name: &str) -> Result<Option<u16>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        let d = inner
            .domains
            .get(name)
            .ok_or_else(|| not_found(ResourceKind::Domain, name))?;
        Ok(d.state.is_active().then(|| 5900 + d.vnc_display))
    }

    fn define_network(&self, name: &str, xml: &str) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("define_network {name}"));
        if let Some(n) = inner.networks.get_mut(name) {
            n.xml = xml.to_string();
            return Ok(());
        }
        inner.next_id += 1;
        let bridge = format!("virbr{}", inner.next_id);
        inner.networks.insert(
            name.to_string(),
            FakeNetwork { xml: xml.to_string(), active: false, bridge },
        );
        Ok(())
    }

    fn network_active(&self, name: &str) -> Result<bool, HypervisorError> {
        self.inner
            .lock()
            .unwrap()
            .networks
            .get(name)
            .map(|n| n.active)
            .ok_or_else(|| not_found(ResourceKind::Network, name))
    }

    fn start_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_network("start_network", name, |n| {
            if n.active {
                return Err(invalid("net-start", "network is already active"));
            }
            n.active = true;
            Ok(())
        })
    }

    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.with_network("destroy_network", name, |n| {
            if !n.active {
                return Err(invalid("net-destroy", "network is not active"));
            }
            n.active = false;
            Ok(())
        })
    }

    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("undefine_network {name}"));
        inner
            .networks
            .remove(name)
            .map(drop)
            .ok_or_else(|| not_found(ResourceKind::Network, name))
    }

    fn network_bridge(&self, name: &str) -> Result<String, HypervisorError> {
        self.inner
            .lock()
            .unwrap()
            .networks
            .get(name)
            .map(|n| n.bridge.clone())
            .ok_or_else(|| not_found(ResourceKind::Network, name))
    }
}

struct FakeConnector(Arc<FakeHypervisor>);

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
        Ok(self.0.clone())
    }
}
