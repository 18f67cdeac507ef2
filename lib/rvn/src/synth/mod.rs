// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compilation of a topology into hypervisor resource definitions.
//!
//! Synthesis is a pure function of the topology, its management subnet, and
//! where instance images live: the same inputs always produce the same
//! definitions, in the same order.

use std::path::PathBuf;

use crate::subnet::ManagementSubnet;
use crate::topology::{Host, Link, Platform, Topology, TEST_NETWORK};

pub mod domain;
pub mod image;
pub mod network;
pub mod xml;

pub use domain::{CpuDef, CpuMode, DiskDef, DomainDef, InterfaceDef, KernelBoot};
pub use image::{base_image_path, ImageError, ImageRef};
pub use network::{NetworkDef, NetworkKind};

/// Every definition belonging to one topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Synthesis {
    /// One per host: nodes, then switches.
    pub domains: Vec<(String, DomainDef)>,
    /// The management network first, then one per link.
    pub networks: Vec<NetworkDef>,
}

/// Synthesizes the whole topology.
///
/// Links must already be resolved (see [`Topology::resolve_links`]) so each
/// host's interfaces come out in port order.
pub fn synthesize(
    topo: &Topology,
    subnet: ManagementSubnet,
    instance_image: impl Fn(&Host) -> PathBuf,
) -> Synthesis {
    let domains = topo
        .hosts()
        .map(|(_, h)| (h.name.clone(), domain(topo, h, instance_image(h))))
        .collect();
    let networks = std::iter::once(management_network(topo, subnet))
        .chain(topo.links.iter().map(|l| link_network(topo, l)))
        .collect();
    Synthesis { domains, networks }
}

pub fn management_network(
    topo: &Topology,
    subnet: ManagementSubnet,
) -> NetworkDef {
    NetworkDef {
        name: topo.qualify(TEST_NETWORK),
        local: TEST_NETWORK.to_string(),
        kind: NetworkKind::Management {
            domain: format!("{}.net", topo.name),
            subnet,
        },
    }
}

pub fn link_network(topo: &Topology, link: &Link) -> NetworkDef {
    NetworkDef {
        name: topo.qualify(&link.name),
        local: link.name.clone(),
        kind: NetworkKind::Link,
    }
}

/// The domain definition for one host, backed by `image`.
pub fn domain(topo: &Topology, host: &Host, image: PathBuf) -> DomainDef {
    let plat = host.defaults();

    let mut interfaces = Vec::with_capacity(host.ports().len() + 1);
    if !host.no_testnet {
        interfaces.push(InterfaceDef {
            network: topo.qualify(TEST_NETWORK),
            model: plat.nic_model.to_string(),
            boot_order: None,
        });
    }
    for port in host.ports() {
        let boot_order = if host.is_netboot() {
            topo.link(&port.link).and_then(Link::boot_order)
        } else {
            None
        };
        interfaces.push(InterfaceDef {
            network: topo.qualify(&port.link),
            model: plat.nic_model.to_string(),
            boot_order,
        });
    }

    let mode = if plat.accelerated() {
        CpuMode::HostPassthrough
    } else {
        CpuMode::Custom(host.cpu.model.clone())
    };

    DomainDef {
        name: topo.qualify(&host.name),
        domain_type: plat.domain_type.to_string(),
        arch: host.arch.clone(),
        machine: host.machine.clone(),
        apic: host.platform == Platform::X86_64,
        cpu: CpuDef {
            mode,
            sockets: host.cpu.sockets,
            cores: host.cpu.cores,
            threads: host.cpu.threads,
        },
        memory: host.memory.capacity.value,
        memory_unit: host.memory.capacity.unit.clone(),
        boot: KernelBoot {
            kernel: host.kernel.clone(),
            initrd: host.initrd.clone(),
            cmdline: host.cmdline.clone(),
        },
        disk: DiskDef { path: image, bus: plat.disk_bus.to_string() },
        interfaces,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TOPO: &str = r#"{
        "name": "lab",
        "nodes": [
            {"name": "h", "cpu": {"sockets": 2, "cores": 2}},
            {"name": "pxe", "os": "netboot", "no-testnet": true},
            {"name": "pi", "platform": "arm64"}
        ],
        "switches": [{"name": "sw"}],
        "links": [
            {"name": "A", "endpoints": [
                {"name": "h", "port": 0}, {"name": "sw", "port": 0}]},
            {"name": "B", "endpoints": [
                {"name": "h", "port": 2}, {"name": "sw", "port": 1}]},
            {"name": "C", "endpoints": [
                {"name": "h", "port": 1}, {"name": "sw", "port": 2}]},
            {"name": "boot", "endpoints": [
                {"name": "pxe", "port": 0}, {"name": "sw", "port": 3}],
                "props": {"boot": 1}},
            {"name": "data", "endpoints": [
                {"name": "pxe", "port": 1}, {"name": "pi", "port": 0}],
                "props": {"boot": "never"}}
        ]
    }"#;

    fn synth() -> Synthesis {
        let mut topo = Topology::from_json(TOPO.as_bytes()).unwrap();
        topo.resolve_links().unwrap();
        synthesize(&topo, ManagementSubnet::new(3), |h| {
            PathBuf::from(format!("/work/{}.qcow2", h.name))
        })
    }

    fn dom<'a>(s: &'a Synthesis, name: &str) -> &'a DomainDef {
        &s.domains.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn interfaces_follow_port_order() {
        let s = synth();
        let nets: Vec<_> = dom(&s, "h")
            .interfaces
            .iter()
            .map(|i| i.network.as_str())
            .collect();
        assert_eq!(nets, vec!["lab_test", "lab_A", "lab_C", "lab_B"]);

        let xml = dom(&s, "h").to_xml();
        let a = xml.find("network=\"lab_A\"").unwrap();
        let c = xml.find("network=\"lab_C\"").unwrap();
        let b = xml.find("network=\"lab_B\"").unwrap();
        assert!(xml.find("network=\"lab_test\"").unwrap() < a);
        assert!(a < c && c < b);
    }

    #[test]
    fn netboot_hosts_get_numeric_boot_hints_only() {
        let s = synth();
        let pxe = dom(&s, "pxe");
        // Opted out of the management network.
        assert_eq!(pxe.interfaces.len(), 2);
        assert_eq!(pxe.interfaces[0].network, "lab_boot");
        assert_eq!(pxe.interfaces[0].boot_order, Some(1));
        assert_eq!(pxe.interfaces[1].boot_order, None);
        assert!(pxe.to_xml().contains("<boot order=\"1\"/>"));

        // The switch shares the boot link but is not netbooted.
        assert!(dom(&s, "sw").interfaces.iter().all(|i| i.boot_order.is_none()));
    }

    #[test]
    fn domain_contents() {
        let s = synth();
        let h = dom(&s, "h");
        assert_eq!(h.name, "lab_h");
        assert_eq!(h.vcpus(), 4);
        assert_eq!(h.cpu.mode, CpuMode::HostPassthrough);
        let xml = h.to_xml();
        assert!(xml.starts_with("<domain type=\"kvm\">"));
        assert!(xml.contains("<memory unit=\"GB\">4</memory>"));
        assert!(xml.contains("<vcpu>4</vcpu>"));
        assert!(xml.contains("<apic/>"));
        assert!(xml.contains("<source file=\"/work/h.qcow2\"/>"));
        assert!(xml.contains("<target dev=\"vda\" bus=\"virtio\"/>"));
        assert!(xml.contains("autoport=\"yes\""));

        let pi = dom(&s, "pi");
        assert_eq!(pi.domain_type, "qemu");
        assert_eq!(pi.cpu.mode, CpuMode::Custom("cortex-a57".into()));
        let xml = pi.to_xml();
        assert!(xml.contains("arch=\"aarch64\" machine=\"virt\""));
        assert!(!xml.contains("<apic/>"));
    }

    #[test]
    fn networks() {
        let s = synth();
        let names: Vec<_> = s.networks.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["lab_test", "lab_A", "lab_B", "lab_C", "lab_boot", "lab_data"]
        );
        assert!(s.networks[0].is_management());

        let mgmt = s.networks[0].to_xml();
        assert!(mgmt.contains("<forward mode=\"nat\"/>"));
        assert!(mgmt.contains("<domain name=\"lab.net\" localOnly=\"yes\"/>"));
        assert!(mgmt.contains("address=\"172.22.3.1\" netmask=\"255.255.255.0\""));
        assert!(mgmt.contains("start=\"172.22.3.2\" end=\"172.22.3.254\""));

        let link = s.networks[1].to_xml();
        assert!(link.contains("<bridge stp=\"off\" delay=\"0\"/>"));
        assert!(!link.contains("forward"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        assert_eq!(synth(), synth());
    }

    #[test]
    fn kernel_boot_is_optional() {
        let mut topo = Topology::from_json(
            br#"{"name": "k", "nodes": [{"name": "n",
                "kernel": "/boot/vmlinuz", "cmdline": "console=ttyS0"}]}"#,
        )
        .unwrap();
        topo.resolve_links().unwrap();
        let d = domain(&topo, &topo.nodes[0], PathBuf::from("/w/n"));
        let xml = d.to_xml();
        assert!(xml.contains("<kernel>/boot/vmlinuz</kernel>"));
        assert!(xml.contains("<cmdline>console=ttyS0</cmdline>"));
        assert!(!xml.contains("<initrd>"));
    }
}
