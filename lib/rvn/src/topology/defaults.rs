// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-platform values applied to host fields the author left out.

use super::{Platform, Role};

/// The OS tag marking a host that boots from the network rather than a disk
/// image of its own.
pub const NETBOOT: &str = "netboot";

pub const DEFAULT_SOCKETS: u32 = 1;
pub const DEFAULT_CORES: u32 = 1;
pub const DEFAULT_THREADS: u32 = 1;
pub const DEFAULT_MEMORY_UNIT: &str = "GB";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformDefaults {
    /// libvirt domain type: hardware accelerated or fully emulated.
    pub domain_type: &'static str,
    pub arch: &'static str,
    pub machine: &'static str,
    pub cpu_model: &'static str,
    pub nic_model: &'static str,
    pub disk_bus: &'static str,
    /// Memory capacity in [`DEFAULT_MEMORY_UNIT`].
    pub memory: u64,
    pub node_image: &'static str,
    pub switch_image: &'static str,
}

impl PlatformDefaults {
    /// Whether the platform runs under hardware virtualization on an x86 host.
    pub fn accelerated(&self) -> bool {
        self.domain_type == "kvm"
    }

    pub fn image(&self, role: Role, os: &str) -> &'static str {
        if os.eq_ignore_ascii_case(NETBOOT) {
            return NETBOOT;
        }
        match role {
            Role::Node => self.node_image,
            Role::Switch => self.switch_image,
        }
    }
}

const X86_64: PlatformDefaults = PlatformDefaults {
    domain_type: "kvm",
    arch: "x86_64",
    machine: "pc",
    cpu_model: "kvm64",
    nic_model: "virtio",
    disk_bus: "virtio",
    memory: 4,
    node_image: "debian-bullseye",
    switch_image: "cumulus-latest",
};

const ARM: PlatformDefaults = PlatformDefaults {
    domain_type: "qemu",
    arch: "armv7l",
    machine: "virt",
    cpu_model: "cortex-a15",
    nic_model: "virtio",
    disk_bus: "virtio",
    memory: 1,
    node_image: "debian-armhf",
    switch_image: "debian-armhf",
};

const ARM64: PlatformDefaults = PlatformDefaults {
    domain_type: "qemu",
    arch: "aarch64",
    machine: "virt",
    cpu_model: "cortex-a57",
    nic_model: "virtio",
    disk_bus: "virtio",
    memory: 2,
    node_image: "debian-arm64",
    switch_image: "debian-arm64",
};

impl Platform {
    pub fn defaults(self) -> &'static PlatformDefaults {
        match self {
            Platform::X86_64 => &X86_64,
            Platform::Arm => &ARM,
            Platform::Arm64 => &ARM64,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_x86_is_accelerated() {
        assert!(Platform::X86_64.defaults().accelerated());
        assert!(!Platform::Arm.defaults().accelerated());
        assert!(!Platform::Arm64.defaults().accelerated());
    }

    #[test]
    fn netboot_overrides_role_image() {
        let d = Platform::X86_64.defaults();
        assert_eq!(d.image(Role::Node, "linux"), "debian-bullseye");
        assert_eq!(d.image(Role::Switch, "linux"), "cumulus-latest");
        assert_eq!(d.image(Role::Node, "NetBoot"), NETBOOT);
    }
}
