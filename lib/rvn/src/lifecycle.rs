// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciling synthesized definitions with the virtualization endpoint.
//!
//! Every operation walks the topology's hosts and links in document order.
//! Failures on individual resources are collected and reported once every
//! peer has been attempted; nothing is rolled back.

use std::path::Path;

use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};

use crate::engine::{Engine, Failure, LifecycleError, ResourceError};
use crate::host::{nfs, playbook};
use crate::hypervisor::Hypervisor;
use crate::subnet::ManagementSubnet;
use crate::synth::{self, base_image_path, ImageError};
use crate::topology::{Topology, TEST_NETWORK};
use crate::workspace::Workspace;

#[derive(Debug)]
pub struct CreateReport {
    pub topology: String,
    pub subnet: ManagementSubnet,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default)]
pub struct LaunchReport {
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default)]
pub struct DestroyReport {
    pub failures: Vec<Failure>,
}

/// Hosts to power-cycle, as received over a control surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootRequest {
    pub topo: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RebootReport {
    /// Netboot hosts, hard reset.
    pub reset: Vec<String>,
    pub rebooted: Vec<String>,
    /// Names with no host in the topology or no domain behind them.
    pub skipped: Vec<String>,
    pub failures: Vec<ResourceError>,
}

fn write_file(path: &Path, data: &str) -> Result<(), LifecycleError> {
    std::fs::write(path, data).map_err(|source| LifecycleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Stops and undefines `name` if it exists, then defines it afresh.
fn redefine_domain(
    hv: &dyn Hypervisor,
    log: &Logger,
    name: &str,
    xml: &str,
) -> Result<(), ResourceError> {
    let fail = |error| ResourceError { resource: name.to_string(), error };
    match hv.domain_state(name) {
        Ok(state) => {
            if state.is_active() {
                if let Err(e) = hv.destroy_domain(name) {
                    warn!(log, "failed to stop domain before redefining";
                        "domain" => name, "error" => %e);
                }
            }
            hv.undefine_domain(name).map_err(fail)?;
            debug!(log, "removed stale domain"; "domain" => name);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(fail(e)),
    }
    hv.define_domain(name, xml).map_err(fail)
}

fn redefine_network(
    hv: &dyn Hypervisor,
    log: &Logger,
    name: &str,
    xml: &str,
) -> Result<(), ResourceError> {
    let fail = |error| ResourceError { resource: name.to_string(), error };
    match hv.network_active(name) {
        Ok(active) => {
            if active {
                if let Err(e) = hv.destroy_network(name) {
                    warn!(log, "failed to stop network before redefining";
                        "network" => name, "error" => %e);
                }
            }
            hv.undefine_network(name).map_err(fail)?;
            debug!(log, "removed stale network"; "network" => name);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(fail(e)),
    }
    hv.define_network(name, xml).map_err(fail)
}

impl Engine {
    fn require_topology(
        &self,
        ws: &Workspace,
    ) -> Result<Topology, LifecycleError> {
        ws.load_topology()?
            .ok_or_else(|| LifecycleError::NotBuilt(ws.source_dir().to_path_buf()))
    }

    /// Builds `topo` into `ws`, replacing whatever was built there before.
    pub fn create(
        &self,
        ws: &Workspace,
        mut topo: Topology,
    ) -> Result<CreateReport, LifecycleError> {
        let log = self.topology_log(&topo.name);
        let bases = topo
            .hosts()
            .map(|(_, h)| {
                Ok((h.name.clone(), base_image_path(&self.image_dir, &h.image)?))
            })
            .collect::<Result<Vec<_>, ImageError>>()?;
        let hv = self.conn.ensure_healthy();

        let subnet = self.subnets.allocate(&topo.name)?;
        info!(log, "allocated management subnet"; "subnet" => subnet.cidr());
        topo.mgmt_ip = Some(subnet.gateway());
        topo.dir = Some(ws.source_dir().to_path_buf());
        topo.resolve_links()?;

        std::fs::create_dir_all(ws.work_dir()).map_err(|source| {
            LifecycleError::Io { path: ws.work_dir().to_path_buf(), source }
        })?;

        let mut failures = Vec::new();
        for (name, base) in &bases {
            let instance = ws.instance_image_path(name);
            if let Err(e) = self.host.create_instance_image(base, &instance) {
                warn!(log, "failed to create instance image";
                    "host" => name, "error" => %e);
                failures.push(Failure::host(
                    format!("instance image for {name}"),
                    e,
                ));
            }
        }

        let synthesis =
            synth::synthesize(&topo, subnet, |h| ws.instance_image_path(&h.name));
        for net in &synthesis.networks {
            let xml = net.to_xml();
            write_file(&ws.network_xml_path(&net.name), &xml)?;
            if let Err(e) = redefine_network(&*hv, &log, &net.name, &xml) {
                warn!(log, "failed to define network"; "error" => %e);
                failures.push(e.into());
            }
        }
        for (_, dom) in &synthesis.domains {
            let xml = dom.to_xml();
            write_file(&ws.domain_xml_path(&dom.name), &xml)?;
            if let Err(e) = redefine_domain(&*hv, &log, &dom.name, &xml) {
                warn!(log, "failed to define domain"; "error" => %e);
                failures.push(e.into());
            }
        }

        let exports = nfs::render_exports(&topo, subnet);
        if !exports.is_empty() {
            if let Err(e) = self.host.install_exports(&topo.name, &exports) {
                warn!(log, "failed to export mounts"; "error" => %e);
                failures.push(Failure::host("nfs exports", e));
            }
        }
        for (_, host) in topo.hosts().filter(|(_, h)| !h.is_netboot()) {
            let config = playbook::render_base_config(host, subnet).map_err(
                |source| LifecycleError::BaseConfig {
                    host: host.name.clone(),
                    source,
                },
            )?;
            write_file(&ws.base_config_path(&host.name), &config)?;
        }

        topo.save(ws.topology_path())?;
        info!(log, "topology built"; "failures" => failures.len());
        Ok(CreateReport { topology: topo.name.clone(), subnet, failures })
    }

    /// Starts every inactive network, then every inactive domain.
    pub fn launch(&self, ws: &Workspace) -> Result<LaunchReport, LifecycleError> {
        let Some(topo) = ws.load_topology()? else {
            return Ok(LaunchReport::default());
        };
        let log = self.topology_log(&topo.name);
        let hv = self.conn.ensure_healthy();
        let mut failures = Vec::new();

        let networks = std::iter::once(TEST_NETWORK)
            .chain(topo.links.iter().map(|l| l.name.as_str()));
        for local in networks {
            let name = topo.qualify(local);
            match hv.network_active(&name) {
                Ok(true) => {}
                Ok(false) => match hv.start_network(&name) {
                    Ok(()) => {
                        info!(log, "started network"; "network" => &name);
                        self.open_network(&*hv, &name, local == TEST_NETWORK)
                            .unwrap_or_else(|f| failures.push(f));
                    }
                    Err(e) => failures.push(Failure::resource(name, e)),
                },
                Err(e) => failures.push(Failure::resource(name, e)),
            }
        }

        for (_, host) in topo.hosts() {
            let name = topo.qualify(&host.name);
            match hv.domain_state(&name) {
                Ok(state) if state.is_active() => {}
                Ok(_) => match hv.start_domain(&name) {
                    Ok(()) => info!(log, "started domain"; "domain" => &name),
                    Err(e) => failures.push(Failure::resource(name, e)),
                },
                Err(e) => failures.push(Failure::resource(name, e)),
            }
        }

        for f in &failures {
            warn!(log, "launch failure"; "error" => %f);
        }
        Ok(LaunchReport { failures })
    }

    fn open_network(
        &self,
        hv: &dyn Hypervisor,
        name: &str,
        management: bool,
    ) -> Result<(), Failure> {
        let bridge = hv
            .network_bridge(name)
            .map_err(|e| Failure::resource(name, e))?;
        let res = if management {
            self.host.allow_management_services(&bridge)
        } else {
            self.host.allow_link_forwarding(&bridge)
        };
        res.map_err(|e| Failure::host(format!("firewall for {name}"), e))
    }

    fn close_network(
        &self,
        hv: &dyn Hypervisor,
        name: &str,
        management: bool,
    ) -> Result<(), Failure> {
        let bridge = hv
            .network_bridge(name)
            .map_err(|e| Failure::resource(name, e))?;
        let res = if management {
            self.host.remove_management_services(&bridge)
        } else {
            self.host.remove_link_forwarding(&bridge)
        };
        res.map_err(|e| Failure::host(format!("firewall for {name}"), e))
    }

    /// Requests an ACPI shutdown of every active domain. Networks stay up.
    pub fn shutdown(
        &self,
        ws: &Workspace,
    ) -> Result<ShutdownReport, LifecycleError> {
        let Some(topo) = ws.load_topology()? else {
            return Ok(ShutdownReport::default());
        };
        let log = self.topology_log(&topo.name);
        let hv = self.conn.ensure_healthy();
        let mut failures = Vec::new();

        for (_, host) in topo.hosts() {
            let name = topo.qualify(&host.name);
            match hv.domain_state(&name) {
                Ok(state) if state.is_active() => {
                    match hv.shutdown_domain(&name) {
                        Ok(()) => {
                            info!(log, "shutting down"; "domain" => &name)
                        }
                        Err(e) => failures.push(Failure::resource(name, e)),
                    }
                }
                Ok(_) => {}
                Err(e) => failures.push(Failure::resource(name, e)),
            }
        }
        Ok(ShutdownReport { failures })
    }

    /// Tears down everything the topology holds: domains, networks and
    /// their firewall rules, configuration state, the subnet, NFS exports
    /// and the working directory.
    pub fn destroy(
        &self,
        ws: &Workspace,
    ) -> Result<DestroyReport, LifecycleError> {
        let Some(topo) = ws.load_topology()? else {
            return Ok(DestroyReport::default());
        };
        let log = self.topology_log(&topo.name);
        let hv = self.conn.ensure_healthy();
        self.states.ensure_healthy();
        let mut failures = Vec::new();

        for (_, host) in topo.hosts() {
            let name = topo.qualify(&host.name);
            if let Err(e) = remove_domain(&*hv, &name) {
                failures.push(Failure::resource(name, e));
            }
            if let Err(source) = self.states.clear(&topo.name, &host.name) {
                failures.push(Failure::State { host: host.name.clone(), source });
            }
        }

        let networks = topo
            .links
            .iter()
            .map(|l| l.name.as_str())
            .chain(std::iter::once(TEST_NETWORK));
        for local in networks {
            let name = topo.qualify(local);
            match hv.network_active(&name) {
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    failures.push(Failure::resource(name, e));
                    continue;
                }
                Ok(active) => {
                    self.close_network(&*hv, &name, local == TEST_NETWORK)
                        .unwrap_or_else(|f| failures.push(f));
                    let res = if active {
                        hv.destroy_network(&name)
                    } else {
                        Ok(())
                    };
                    if let Err(e) = res.and_then(|()| hv.undefine_network(&name)) {
                        failures.push(Failure::resource(name, e));
                    }
                }
            }
        }

        if !nfs::export_dirs(&topo).is_empty() {
            if let Err(e) = self.host.remove_exports(&topo.name) {
                failures.push(Failure::host("nfs exports", e));
            }
        }

        if let Some(subnet) = self.subnets.free(&topo.name)? {
            info!(log, "freed management subnet"; "subnet" => subnet.cidr());
        }

        match std::fs::remove_dir_all(ws.work_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LifecycleError::Io {
                    path: ws.work_dir().to_path_buf(),
                    source,
                })
            }
        }
        info!(log, "topology destroyed"; "failures" => failures.len());
        Ok(DestroyReport { failures })
    }

    /// Replaces one host's domain with a fresh instance, leaving the rest of
    /// the topology alone.
    pub fn wipe(&self, ws: &Workspace, host: &str) -> Result<(), LifecycleError> {
        let topo = self.require_topology(ws)?;
        let h = topo.host(host).ok_or_else(|| LifecycleError::UnknownHost {
            topology: topo.name.clone(),
            host: host.to_string(),
        })?;
        let log = self.topology_log(&topo.name);
        let hv = self.conn.ensure_healthy();
        let name = topo.qualify(host);
        let base = base_image_path(&self.image_dir, &h.image)?;

        remove_domain(&*hv, &name)?;
        self.host.create_instance_image(&base, &ws.instance_image_path(host))?;

        let xml = synth::domain(&topo, h, ws.instance_image_path(host)).to_xml();
        write_file(&ws.domain_xml_path(&name), &xml)?;
        hv.define_domain(&name, &xml)?;
        hv.start_domain(&name)?;
        self.states.clear(&topo.name, host)?;
        info!(log, "wiped host"; "host" => host);
        Ok(())
    }

    pub fn reboot(
        &self,
        ws: &Workspace,
        request: &RebootRequest,
    ) -> Result<RebootReport, LifecycleError> {
        let topo = self.require_topology(ws)?;
        if request.topo != topo.name {
            return Err(LifecycleError::TopologyMismatch {
                requested: request.topo.clone(),
                actual: topo.name,
            });
        }
        let log = self.topology_log(&topo.name);
        let hv = self.conn.ensure_healthy();
        let mut report = RebootReport::default();

        for node in &request.nodes {
            let Some(host) = topo.host(node) else {
                warn!(log, "reboot of unknown host skipped"; "host" => node);
                report.skipped.push(node.clone());
                continue;
            };
            let name = topo.qualify(node);
            // Firmware that netboots ignores the graceful request.
            let (res, done) = if host.is_netboot() {
                (hv.reset_domain(&name), &mut report.reset)
            } else {
                (hv.reboot_domain(&name), &mut report.rebooted)
            };
            match res {
                Ok(()) => done.push(node.clone()),
                Err(e) if e.is_not_found() => report.skipped.push(node.clone()),
                Err(error) => {
                    report.failures.push(ResourceError { resource: name, error })
                }
            }
        }
        Ok(report)
    }

    /// VNC port of a host's console, if its domain is running.
    pub fn domain_vnc_port(
        &self,
        ws: &Workspace,
        host: &str,
    ) -> Result<Option<u16>, LifecycleError> {
        let topo = self.require_topology(ws)?;
        if topo.host(host).is_none() {
            return Err(LifecycleError::UnknownHost {
                topology: topo.name.clone(),
                host: host.to_string(),
            });
        }
        let hv = self.conn.ensure_healthy();
        Ok(hv.domain_vnc_port(&topo.qualify(host))?)
    }
}

/// Stops and undefines a domain; one that does not exist is already gone.
fn remove_domain(
    hv: &dyn Hypervisor,
    name: &str,
) -> Result<(), crate::hypervisor::HypervisorError> {
    let state = match hv.domain_state(name) {
        Ok(state) => state,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if state.is_active() {
        hv.destroy_domain(name)?;
    }
    hv.undefine_domain(name)
}
