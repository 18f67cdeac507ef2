// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The testbed data model: hosts, links and the ports that wire them.
//!
//! A [`Topology`] is parsed from the JSON document produced by the modeling
//! step, has per-platform defaults applied to every host, and is validated
//! structurally before anything else may use it. Hypervisor-visible names are
//! always derived with [`qualify`], so resources belonging to different
//! topologies on the same host never collide.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod defaults;

pub use defaults::{PlatformDefaults, NETBOOT};

/// Local name of the implicit management network every topology carries.
pub const TEST_NETWORK: &str = "test";

/// Errors raised while loading or validating a topology document.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed topology document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("topology name must not be empty")]
    EmptyName,

    #[error("{kind} name {name:?} contains characters unusable in resource names")]
    InvalidName { kind: &'static str, name: String },

    #[error("host {0} is declared more than once")]
    DuplicateHost(String),

    #[error("link {0} is declared more than once")]
    DuplicateLink(String),

    #[error("link name {0:?} is reserved for the management network")]
    ReservedLinkName(String),

    #[error("link {link} references undefined host {host}")]
    DanglingEndpoint { link: String, host: String },

    #[error("port {port} of host {host} is used by both {first} and {second}")]
    PortInUse { host: String, port: u32, first: String, second: String },

    #[error("host {host}: {field} must not be zero or empty")]
    ZeroValue { host: String, field: &'static str },

    #[error("host {host}: {sockets}x{cores}x{threads} vCPUs is out of range")]
    VcpuOverflow { host: String, sockets: u32, cores: u32, threads: u32 },
}

/// Name used against the virtualization endpoint for a topology-local name.
pub fn qualify(topology: &str, local: &str) -> String {
    format!("{topology}_{local}")
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    #[default]
    #[serde(rename = "x86_64")]
    #[strum(serialize = "x86_64")]
    X86_64,
    Arm,
    Arm64,
}

/// Whether a host was declared among the nodes or the switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Node,
    Switch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub point: String,
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cpu {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
    #[serde(rename = "arch")]
    pub model: String,
}

impl Cpu {
    /// Total vCPU count, or `None` if the product does not fit a `u32`.
    pub fn checked_vcpus(&self) -> Option<u32> {
        self.sockets.checked_mul(self.cores)?.checked_mul(self.threads)
    }

    pub fn vcpus(&self) -> u32 {
        self.checked_vcpus().unwrap_or(u32::MAX)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub value: u64,
    pub unit: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Memory {
    pub capacity: Capacity,
}

/// Attachment of a link to one of a host's interfaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub link: String,
    pub index: u32,
}

/// A node or switch with every optional field resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Host {
    pub name: String,
    pub image: String,
    pub os: String,
    pub platform: Platform,
    pub arch: String,
    pub machine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    #[serde(rename = "no-testnet")]
    pub no_testnet: bool,
    pub mounts: Vec<Mount>,
    pub cpu: Cpu,
    pub memory: Memory,

    #[serde(skip)]
    ports: Vec<Port>,
}

impl Host {
    pub fn is_netboot(&self) -> bool {
        self.os.eq_ignore_ascii_case(NETBOOT)
    }

    pub fn defaults(&self) -> &'static PlatformDefaults {
        self.platform.defaults()
    }

    /// Ports in interface attachment order, valid after
    /// [`Topology::resolve_links`].
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }
}

// Host shape as authored: anything may be omitted.
#[derive(Deserialize)]
struct HostDoc {
    name: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    os: String,
    #[serde(default)]
    platform: Platform,
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    machine: Option<String>,
    #[serde(default)]
    kernel: Option<String>,
    #[serde(default)]
    cmdline: Option<String>,
    #[serde(default)]
    initrd: Option<String>,
    #[serde(default, rename = "no-testnet")]
    no_testnet: bool,
    #[serde(default)]
    mounts: Vec<Mount>,
    #[serde(default)]
    cpu: Option<CpuDoc>,
    #[serde(default)]
    memory: Option<MemoryDoc>,
}

#[derive(Default, Deserialize)]
struct CpuDoc {
    sockets: Option<u32>,
    cores: Option<u32>,
    threads: Option<u32>,
    #[serde(rename = "arch")]
    model: Option<String>,
}

#[derive(Default, Deserialize)]
struct MemoryDoc {
    #[serde(default)]
    capacity: CapacityDoc,
}

#[derive(Default, Deserialize)]
struct CapacityDoc {
    value: Option<u64>,
    unit: Option<String>,
}

fn nonzero(
    host: &str,
    field: &'static str,
    value: Option<u32>,
    default: u32,
) -> Result<u32, TopologyError> {
    match value {
        None => Ok(default),
        Some(0) => {
            Err(TopologyError::ZeroValue { host: host.to_string(), field })
        }
        Some(v) => Ok(v),
    }
}

fn nonempty(
    host: &str,
    field: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<String, TopologyError> {
    match value {
        None => Ok(default.to_string()),
        Some(v) if v.is_empty() => {
            Err(TopologyError::ZeroValue { host: host.to_string(), field })
        }
        Some(v) => Ok(v),
    }
}

impl HostDoc {
    fn resolve(self, role: Role) -> Result<Host, TopologyError> {
        let name = self.name;
        let plat = self.platform.defaults();

        let cpu = self.cpu.unwrap_or_default();
        let cpu = Cpu {
            sockets: nonzero(
                &name,
                "cpu.sockets",
                cpu.sockets,
                defaults::DEFAULT_SOCKETS,
            )?,
            cores: nonzero(&name, "cpu.cores", cpu.cores, defaults::DEFAULT_CORES)?,
            threads: nonzero(
                &name,
                "cpu.threads",
                cpu.threads,
                defaults::DEFAULT_THREADS,
            )?,
            model: nonempty(&name, "cpu.arch", cpu.model, plat.cpu_model)?,
        };

        if cpu.checked_vcpus().is_none() {
            return Err(TopologyError::VcpuOverflow {
                host: name,
                sockets: cpu.sockets,
                cores: cpu.cores,
                threads: cpu.threads,
            });
        }

        let capacity = self.memory.unwrap_or_default().capacity;
        let value = match capacity.value {
            None => plat.memory,
            Some(0) => {
                return Err(TopologyError::ZeroValue {
                    host: name,
                    field: "memory.capacity.value",
                })
            }
            Some(v) => v,
        };
        let memory = Memory {
            capacity: Capacity {
                value,
                unit: nonempty(
                    &name,
                    "memory.capacity.unit",
                    capacity.unit,
                    defaults::DEFAULT_MEMORY_UNIT,
                )?,
            },
        };

        let image = match self.image {
            Some(image) if !image.is_empty() => image,
            _ => plat.image(role, &self.os).to_string(),
        };

        Ok(Host {
            image,
            os: self.os,
            platform: self.platform,
            arch: self.arch.unwrap_or_else(|| plat.arch.to_string()),
            machine: self.machine.unwrap_or_else(|| plat.machine.to_string()),
            kernel: self.kernel,
            cmdline: self.cmdline,
            initrd: self.initrd,
            no_testnet: self.no_testnet,
            mounts: self.mounts,
            cpu,
            memory,
            ports: Vec::new(),
            name,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub port: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub endpoints: [Endpoint; 2],
    #[serde(default)]
    pub props: serde_json::Map<String, serde_json::Value>,
}

impl Link {
    /// Boot order hint for a netboot host attached to this link.
    ///
    /// Only a positive integral `boot` property counts; anything else means
    /// no hint.
    pub fn boot_order(&self) -> Option<u32> {
        let value = self.props.get("boot")?;
        let order = match value.as_u64() {
            Some(v) => v,
            None => {
                let f = value.as_f64()?;
                if f.fract() != 0.0 || f < 1.0 {
                    return None;
                }
                f as u64
            }
        };
        u32::try_from(order).ok().filter(|&o| o > 0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Host>,
    #[serde(default)]
    pub switches: Vec<Host>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,

    /// Source directory of the testbed, recorded when the topology is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Management network gateway, derived from the allocated subnet.
    #[serde(default, rename = "mgmtip", skip_serializing_if = "Option::is_none")]
    pub mgmt_ip: Option<Ipv4Addr>,
}

#[derive(Deserialize)]
struct TopologyDoc {
    name: String,
    #[serde(default)]
    nodes: Vec<HostDoc>,
    #[serde(default)]
    switches: Vec<HostDoc>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    options: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default, rename = "mgmtip")]
    mgmt_ip: Option<Ipv4Addr>,
}

impl Topology {
    /// Parses and validates a topology document.
    pub fn from_json(raw: &[u8]) -> Result<Self, TopologyError> {
        let doc: TopologyDoc = serde_json::from_slice(raw)?;
        let topo = Topology {
            name: doc.name,
            nodes: doc
                .nodes
                .into_iter()
                .map(|h| h.resolve(Role::Node))
                .collect::<Result<_, _>>()?,
            switches: doc
                .switches
                .into_iter()
                .map(|h| h.resolve(Role::Switch))
                .collect::<Result<_, _>>()?,
            links: doc.links,
            options: doc.options,
            dir: doc.dir,
            mgmt_ip: doc.mgmt_ip,
        };
        topo.validate()?;
        Ok(topo)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let raw = std::fs::read(path)?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TopologyError> {
        let data = serde_json::to_vec_pretty(self)?;
        crate::persist::write_atomic(path.as_ref(), &data)?;
        Ok(())
    }

    pub fn qualify(&self, local: &str) -> String {
        qualify(&self.name, local)
    }

    /// Every host, nodes first, in document order.
    pub fn hosts(&self) -> impl Iterator<Item = (Role, &Host)> {
        self.nodes
            .iter()
            .map(|h| (Role::Node, h))
            .chain(self.switches.iter().map(|h| (Role::Switch, h)))
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts().map(|(_, h)| h).find(|h| h.name == name)
    }

    fn host_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.nodes
            .iter_mut()
            .chain(self.switches.iter_mut())
            .find(|h| h.name == name)
    }

    pub fn role_of(&self, name: &str) -> Option<Role> {
        self.hosts().find(|(_, h)| h.name == name).map(|(r, _)| r)
    }

    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Checks the structural invariants every other component relies on.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.name.is_empty() {
            return Err(TopologyError::EmptyName);
        }
        // No underscores: the qualified form must split unambiguously.
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(TopologyError::InvalidName {
                kind: "topology",
                name: self.name.clone(),
            });
        }

        let mut hosts = BTreeSet::new();
        for (_, host) in self.hosts() {
            check_local_name("host", &host.name)?;
            if !hosts.insert(host.name.as_str()) {
                return Err(TopologyError::DuplicateHost(host.name.clone()));
            }
        }

        let mut links = BTreeSet::new();
        let mut plugged = std::collections::BTreeMap::new();
        for link in &self.links {
            check_local_name("link", &link.name)?;
            if link.name == TEST_NETWORK {
                return Err(TopologyError::ReservedLinkName(link.name.clone()));
            }
            if !links.insert(link.name.as_str()) {
                return Err(TopologyError::DuplicateLink(link.name.clone()));
            }
            for ep in &link.endpoints {
                if !hosts.contains(ep.name.as_str()) {
                    return Err(TopologyError::DanglingEndpoint {
                        link: link.name.clone(),
                        host: ep.name.clone(),
                    });
                }
                let key = (ep.name.as_str(), ep.port);
                if let Some(first) = plugged.insert(key, link.name.as_str()) {
                    return Err(TopologyError::PortInUse {
                        host: ep.name.clone(),
                        port: ep.port,
                        first: first.to_string(),
                        second: link.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Plugs every link into its endpoint hosts, leaving each host's ports
    /// sorted by ascending index.
    ///
    /// Idempotent: ports from any previous resolution are discarded first.
    pub fn resolve_links(&mut self) -> Result<(), TopologyError> {
        for host in self.nodes.iter_mut().chain(self.switches.iter_mut()) {
            host.ports.clear();
        }
        let links = std::mem::take(&mut self.links);
        let mut result = Ok(());
        'links: for link in &links {
            for ep in &link.endpoints {
                let Some(host) = self.host_mut(&ep.name) else {
                    result = Err(TopologyError::DanglingEndpoint {
                        link: link.name.clone(),
                        host: ep.name.clone(),
                    });
                    break 'links;
                };
                host.ports.push(Port { link: link.name.clone(), index: ep.port });
            }
        }
        self.links = links;
        result?;

        for host in self.nodes.iter_mut().chain(self.switches.iter_mut()) {
            host.ports.sort_by_key(|p| p.index);
        }
        Ok(())
    }
}

fn check_local_name(kind: &'static str, name: &str) -> Result<(), TopologyError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(TopologyError::InvalidName { kind, name: name.to_string() })
    }
}
