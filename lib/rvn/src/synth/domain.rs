// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use super::xml::Element;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpuMode {
    /// Expose the host CPU as-is; only meaningful under hardware acceleration.
    HostPassthrough,
    /// Emulate the named model.
    Custom(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuDef {
    pub mode: CpuMode,
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskDef {
    pub path: PathBuf,
    pub bus: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDef {
    /// Qualified name of the network the interface attaches to.
    pub network: String,
    pub model: String,
    pub boot_order: Option<u32>,
}

/// Direct kernel boot, bypassing the disk's bootloader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelBoot {
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub cmdline: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainDef {
    pub name: String,
    pub domain_type: String,
    pub arch: String,
    pub machine: String,
    pub apic: bool,
    pub cpu: CpuDef,
    pub memory: u64,
    pub memory_unit: String,
    pub boot: KernelBoot,
    pub disk: DiskDef,
    /// In attachment order: NIC 0 first.
    pub interfaces: Vec<InterfaceDef>,
}

impl DomainDef {
    pub fn vcpus(&self) -> u32 {
        self.cpu.sockets * self.cpu.cores * self.cpu.threads
    }

    pub fn to_xml(&self) -> String {
        let mut os = Element::new("os").child(
            Element::leaf("type", "hvm")
                .attr("arch", &self.arch)
                .attr("machine", &self.machine),
        );
        if let Some(k) = &self.boot.kernel {
            os = os.child(Element::leaf("kernel", k));
        }
        if let Some(i) = &self.boot.initrd {
            os = os.child(Element::leaf("initrd", i));
        }
        if let Some(c) = &self.boot.cmdline {
            os = os.child(Element::leaf("cmdline", c));
        }

        let mut features = Element::new("features").child(Element::new("acpi"));
        if self.apic {
            features = features.child(Element::new("apic"));
        }

        let topology = Element::new("topology")
            .attr("sockets", self.cpu.sockets)
            .attr("cores", self.cpu.cores)
            .attr("threads", self.cpu.threads);
        let cpu = match &self.cpu.mode {
            CpuMode::HostPassthrough => Element::new("cpu")
                .attr("mode", "host-passthrough")
                .child(topology),
            CpuMode::Custom(model) => Element::new("cpu")
                .attr("mode", "custom")
                .attr("match", "exact")
                .child(Element::leaf("model", model).attr("fallback", "allow"))
                .child(topology),
        };

        let disk = Element::new("disk")
            .attr("type", "file")
            .attr("device", "disk")
            .child(
                Element::new("driver").attr("name", "qemu").attr("type", "qcow2"),
            )
            .child(Element::new("source").attr("file", self.disk.path.display()))
            .child(
                Element::new("target").attr("dev", "vda").attr("bus", &self.disk.bus),
            );

        let interfaces = self.interfaces.iter().map(|i| {
            Element::new("interface")
                .attr("type", "network")
                .child(Element::new("source").attr("network", &i.network))
                .child(Element::new("model").attr("type", &i.model))
                .maybe_child(
                    i.boot_order.map(|o| Element::new("boot").attr("order", o)),
                )
        });

        let devices = Element::new("devices")
            .child(disk)
            .children(interfaces)
            .child(
                Element::new("serial")
                    .attr("type", "pty")
                    .child(Element::new("target").attr("port", 0)),
            )
            .child(
                Element::new("console")
                    .attr("type", "pty")
                    .child(Element::new("target").attr("type", "serial")),
            )
            .child(
                Element::new("graphics")
                    .attr("type", "vnc")
                    .attr("port", -1)
                    .attr("autoport", "yes"),
            );

        Element::new("domain")
            .attr("type", &self.domain_type)
            .child(Element::leaf("name", &self.name))
            .child(Element::leaf("memory", self.memory).attr("unit", &self.memory_unit))
            .child(Element::leaf("vcpu", self.vcpus()))
            .child(os)
            .child(features)
            .child(cpu)
            .child(devices)
            .render()
    }
}
