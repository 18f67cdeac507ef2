// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Hypervisor`] implementation driving libvirt through the `virsh` CLI.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use slog::{debug, error, Logger};

use super::{
    Connector, DomainState, Hypervisor, HypervisorError, InterfaceAddresses,
    ResourceKind,
};

/// First TCP port used for VNC displays; display N listens on 5900 + N.
const VNC_BASE_PORT: u16 = 5900;

pub struct Virsh {
    virsh: PathBuf,
    uri: String,
    log: Logger,
}

impl Virsh {
    pub fn new(virsh: impl Into<PathBuf>, uri: impl Into<String>, log: Logger) -> Self {
        Self { virsh: virsh.into(), uri: uri.into(), log }
    }

    /// Runs `virsh -c <uri> <verb> <args>`, returning stdout.
    ///
    /// `subject` names the resource the command acts on so a lookup failure
    /// can be reported as [`HypervisorError::NotFound`].
    fn virsh_command(
        &self,
        subject: Option<(ResourceKind, &str)>,
        verb: &str,
        args: &[&str],
    ) -> Result<String, HypervisorError> {
        debug!(self.log, "executing virsh command"; "verb" => verb, "args" => ?args);
        let command = format!("virsh {verb}");

        // Output is parsed, so keep libvirt's messages untranslated.
        let output = Command::new(&self.virsh)
            .env("LC_ALL", "C")
            .arg("-c")
            .arg(&self.uri)
            .arg(verb)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| HypervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Some((kind, name)) = subject {
                if is_not_found(kind, &stderr) {
                    return Err(HypervisorError::NotFound {
                        kind,
                        name: name.to_string(),
                    });
                }
            }
            error!(self.log, "virsh command failed";
                "verb" => verb,
                "args" => ?args,
                "error_code" => ?output.status.code(),
                "stderr" => %stderr,
            );
            return Err(HypervisorError::Command { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn domain_command(
        &self,
        verb: &str,
        name: &str,
        extra: &[&str],
    ) -> Result<String, HypervisorError> {
        let mut args = extra.to_vec();
        args.push(name);
        self.virsh_command(Some((ResourceKind::Domain, name)), verb, &args)
    }

    fn network_command(
        &self,
        verb: &str,
        name: &str,
    ) -> Result<String, HypervisorError> {
        self.virsh_command(Some((ResourceKind::Network, name)), verb, &[name])
    }

    fn define(&self, verb: &str, xml: &str) -> Result<(), HypervisorError> {
        let mut file = tempfile::Builder::new()
            .prefix("rvn-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.virsh_command(None, verb, &[&path])?;
        Ok(())
    }

    fn net_info(&self, name: &str) -> Result<NetInfo, HypervisorError> {
        let out = self.network_command("net-info", name)?;
        parse_net_info(&out).ok_or_else(|| HypervisorError::Parse {
            command: "virsh net-info".to_string(),
            output: out,
        })
    }
}

fn is_not_found(kind: ResourceKind, stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    match kind {
        ResourceKind::Domain => {
            s.contains("domain not found") || s.contains("failed to get domain")
        }
        ResourceKind::Network => {
            s.contains("network not found")
                || s.contains("failed to get network")
        }
    }
}

fn parse_domstate(out: &str) -> Option<DomainState> {
    let state = match out.trim() {
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::PmSuspended,
        "no state" => DomainState::NoState,
        _ => return None,
    };
    Some(state)
}

// ```
//  Name       MAC address          Protocol     Address
// -------------------------------------------------------------------------
//  vnet0      52:54:00:4b:73:5f    ipv4         172.22.0.106/24
//  -          -                    ipv6         fd00::5/64
// ```
fn parse_domifaddr(out: &str) -> Option<Vec<InterfaceAddresses>> {
    let mut ifaces: Vec<InterfaceAddresses> = Vec::new();
    for line in out.lines().skip_while(|l| !l.starts_with("---")).skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [name, mac, _proto, addr] = cols.as_slice() else {
            if cols.is_empty() {
                continue;
            }
            return None;
        };
        let ip: IpAddr = addr.split('/').next()?.parse().ok()?;
        if *name == "-" {
            ifaces.last_mut()?.addrs.push(ip);
        } else {
            ifaces.push(InterfaceAddresses {
                name: name.to_string(),
                mac: mac.to_string(),
                addrs: vec![ip],
            });
        }
    }
    Some(ifaces)
}

#[derive(Debug, PartialEq, Eq)]
struct NetInfo {
    active: bool,
    bridge: Option<String>,
}

fn parse_net_info(out: &str) -> Option<NetInfo> {
    let mut active = None;
    let mut bridge = None;
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Active" => active = Some(value.trim() == "yes"),
            "Bridge" => bridge = Some(value.trim().to_string()),
            _ => {}
        }
    }
    Some(NetInfo { active: active?, bridge })
}

// `:0`, `127.0.0.1:0` or `[::1]:0`
fn parse_vncdisplay(out: &str) -> Option<Option<u16>> {
    let out = out.trim();
    if out.is_empty() {
        return Some(None);
    }
    let (_, display) = out.rsplit_once(':')?;
    let display: u16 = display.parse().ok()?;
    Some(VNC_BASE_PORT.checked_add(display))
}

impl Hypervisor for Virsh {
    fn is_alive(&self) -> bool {
        self.virsh_command(None, "uri", &[]).is_ok()
    }

    fn define_domain(&self, _name: &str, xml: &str) -> Result<(), HypervisorError> {
        self.define("define", xml)
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let out = self.domain_command("domstate", name, &[])?;
        parse_domstate(&out).ok_or_else(|| HypervisorError::Parse {
            command: "virsh domstate".to_string(),
            output: out,
        })
    }

    fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("start", name, &[]).map(drop)
    }

    fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("destroy", name, &[]).map(drop)
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("undefine", name, &[]).map(drop)
    }

    fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("shutdown", name, &["--mode", "acpi"]).map(drop)
    }

    fn reboot_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("reboot", name, &[]).map(drop)
    }

    fn reset_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_command("reset", name, &[]).map(drop)
    }

    fn domain_interfaces(
        &self,
        name: &str,
    ) -> Result<Vec<InterfaceAddresses>, HypervisorError> {
        let out = self.domain_command("domifaddr", name, &["--source", "lease"])?;
        parse_domifaddr(&out).ok_or_else(|| HypervisorError::Parse {
            command: "virsh domifaddr".to_string(),
            output: out,
        })
    }

    fn domain_vnc_port(&self, name: &str) -> Result<Option<u16>, HypervisorError> {
        let out = match self.domain_command("vncdisplay", name, &[]) {
            Ok(out) => out,
            Err(HypervisorError::Command { stderr, .. })
                if stderr.contains("not running") =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        parse_vncdisplay(&out).ok_or_else(|| HypervisorError::Parse {
            command: "virsh vncdisplay".to_string(),
            output: out,
        })
    }

    fn define_network(&self, _name: &str, xml: &str) -> Result<(), HypervisorError> {
        self.define("net-define", xml)
    }

    fn network_active(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.net_info(name)?.active)
    }

    fn start_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.network_command("net-start", name).map(drop)
    }

    fn destroy_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.network_command("net-destroy", name).map(drop)
    }

    fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.network_command("net-undefine", name).map(drop)
    }

    fn network_bridge(&self, name: &str) -> Result<String, HypervisorError> {
        let out = self.network_command("net-info", name)?;
        match parse_net_info(&out).and_then(|i| i.bridge) {
            Some(bridge) => Ok(bridge),
            None => Err(HypervisorError::Parse {
                command: "virsh net-info".to_string(),
                output: out,
            }),
        }
    }
}

/// Produces [`Virsh`] handles for a configured binary and URI.
pub struct VirshConnector {
    virsh: PathBuf,
    uri: String,
    log: Logger,
}

impl VirshConnector {
    pub fn new(cfg: &rvn_config_toml::Hypervisor, log: Logger) -> Self {
        Self { virsh: cfg.virsh.clone(), uri: cfg.uri.clone(), log }
    }
}

impl Connector for VirshConnector {
    fn connect(&self) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
        let virsh = Virsh::new(
            self.virsh.clone(),
            self.uri.clone(),
            self.log.new(slog::o!("uri" => self.uri.clone())),
        );
        // Surface an unreachable endpoint as an error rather than handing
        // back a dead handle.
        virsh.virsh_command(None, "uri", &[])?;
        Ok(Arc::new(virsh))
    }
}
