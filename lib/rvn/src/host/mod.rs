// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Side effects on the hypervisor host itself: instance images, NFS exports,
//! and firewall and bridge tweaks for topology networks.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, PoisonError};

use slog::{debug, error, info, Logger};
use thiserror::Error;

pub mod firewall;
pub mod nfs;
pub mod playbook;

#[derive(Debug, Error)]
pub enum HostOpsError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HostOpsError + '_ {
    move |source| HostOpsError::Io { path: path.to_path_buf(), source }
}

/// Host-side collaborators the lifecycle manager drives.
pub trait HostOps: Send + Sync {
    /// Creates a fresh copy-on-write `instance` image backed by `base`,
    /// replacing any previous instance image.
    fn create_instance_image(
        &self,
        base: &Path,
        instance: &Path,
    ) -> Result<(), HostOpsError>;

    /// Installs a topology's `exports(5)` fragment and reloads the export
    /// table.
    fn install_exports(
        &self,
        topology: &str,
        exports: &str,
    ) -> Result<(), HostOpsError>;
    fn remove_exports(&self, topology: &str) -> Result<(), HostOpsError>;

    /// Opens NFS services to guests on the management bridge.
    fn allow_management_services(&self, bridge: &str)
        -> Result<(), HostOpsError>;
    fn remove_management_services(
        &self,
        bridge: &str,
    ) -> Result<(), HostOpsError>;

    /// Lets LLDP and broadcast BOOTP cross a link bridge.
    fn allow_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError>;
    fn remove_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError>;
}

/// [`HostOps`] backed by `qemu-img`, `exportfs`, `iptables` and sysfs.
pub struct SystemHostOps {
    exports_dir: PathBuf,
    sysfs_net: PathBuf,
    log: Logger,
}

impl SystemHostOps {
    pub fn new(exports_dir: impl Into<PathBuf>, log: Logger) -> Self {
        Self {
            exports_dir: exports_dir.into(),
            sysfs_net: PathBuf::from("/sys/class/net"),
            log,
        }
    }

    fn exports_path(&self, topology: &str) -> PathBuf {
        self.exports_dir.join(format!("{topology}.exports"))
    }

    fn host_command(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Output, HostOpsError> {
        debug!(self.log, "executing host command";
            "program" => program, "args" => ?args);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| HostOpsError::Spawn {
                command: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(HostOpsError::Command {
                command: format!("{program} {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            });
        }
        Ok(output)
    }

    fn iptables(&self, args: Vec<String>) -> Result<(), HostOpsError> {
        self.host_command("iptables", &args).map(drop)
    }

    // Deleting a rule that was never installed is fine.
    fn iptables_delete(&self, rule: &firewall::Rule) -> Result<(), HostOpsError> {
        match self.iptables(rule.delete()) {
            Err(HostOpsError::Command { stderr, .. })
                if firewall::is_missing_rule(&stderr) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn exportfs(&self) -> Result<(), HostOpsError> {
        self.host_command("exportfs", &["-ra".to_string()]).map(drop)
    }
}

impl HostOps for SystemHostOps {
    fn create_instance_image(
        &self,
        base: &Path,
        instance: &Path,
    ) -> Result<(), HostOpsError> {
        match std::fs::remove_file(instance) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(instance)(e)),
        }
        if let Some(parent) = instance.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let args: Vec<String> = vec![
            "create".into(),
            "-f".into(),
            "qcow2".into(),
            "-F".into(),
            "qcow2".into(),
            "-b".into(),
            base.display().to_string(),
            instance.display().to_string(),
        ];
        self.host_command("qemu-img", &args).map_err(|e| {
            error!(self.log, "failed to create instance image";
                "instance" => %instance.display(), "error" => %e);
            e
        })?;
        Ok(())
    }

    fn install_exports(
        &self,
        topology: &str,
        exports: &str,
    ) -> Result<(), HostOpsError> {
        std::fs::create_dir_all(&self.exports_dir)
            .map_err(io_err(&self.exports_dir))?;
        let path = self.exports_path(topology);
        std::fs::write(&path, exports).map_err(io_err(&path))?;
        info!(self.log, "installed nfs exports"; "path" => %path.display());
        self.exportfs()
    }

    fn remove_exports(&self, topology: &str) -> Result<(), HostOpsError> {
        let path = self.exports_path(topology);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path)(e)),
        }
        self.exportfs()
    }

    fn allow_management_services(
        &self,
        bridge: &str,
    ) -> Result<(), HostOpsError> {
        for rule in firewall::management_rules(bridge) {
            self.iptables(rule.insert())?;
        }
        Ok(())
    }

    fn remove_management_services(
        &self,
        bridge: &str,
    ) -> Result<(), HostOpsError> {
        for rule in firewall::management_rules(bridge) {
            self.iptables_delete(&rule)?;
        }
        Ok(())
    }

    fn allow_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError> {
        let mask = self.sysfs_net.join(bridge).join("bridge/group_fwd_mask");
        std::fs::write(&mask, firewall::LLDP_GROUP_FWD_MASK)
            .map_err(io_err(&mask))?;
        self.iptables(firewall::bootp_rule(bridge).append())
    }

    fn remove_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError> {
        self.iptables_delete(&firewall::bootp_rule(bridge))
    }
}

/// [`HostOps`] that touches nothing and records what it was asked to do.
#[derive(Default)]
pub struct NoopHostOps {
    calls: Mutex<Vec<String>>,
}

impl NoopHostOps {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: String) -> Result<(), HostOpsError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
        Ok(())
    }
}

impl HostOps for NoopHostOps {
    fn create_instance_image(
        &self,
        base: &Path,
        instance: &Path,
    ) -> Result<(), HostOpsError> {
        self.record(format!(
            "image {} <- {}",
            instance.display(),
            base.display()
        ))
    }

    fn install_exports(
        &self,
        topology: &str,
        _exports: &str,
    ) -> Result<(), HostOpsError> {
        self.record(format!("export {topology}"))
    }

    fn remove_exports(&self, topology: &str) -> Result<(), HostOpsError> {
        self.record(format!("unexport {topology}"))
    }

    fn allow_management_services(
        &self,
        bridge: &str,
    ) -> Result<(), HostOpsError> {
        self.record(format!("allow-mgmt {bridge}"))
    }

    fn remove_management_services(
        &self,
        bridge: &str,
    ) -> Result<(), HostOpsError> {
        self.record(format!("remove-mgmt {bridge}"))
    }

    fn allow_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError> {
        self.record(format!("allow-link {bridge}"))
    }

    fn remove_link_forwarding(&self, bridge: &str) -> Result<(), HostOpsError> {
        self.record(format!("remove-link {bridge}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ops(dir: &Path) -> SystemHostOps {
        SystemHostOps {
            exports_dir: dir.join("exports.d"),
            sysfs_net: dir.join("sys"),
            log: Logger::root(slog::Discard, slog::o!()),
        }
    }

    #[test]
    fn exports_live_under_the_exports_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        assert_eq!(
            ops.exports_path("lab"),
            dir.path().join("exports.d").join("lab.exports")
        );
    }

    #[test]
    fn link_forwarding_needs_the_bridge_in_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        // The mask is written before iptables is touched.
        assert!(matches!(
            ops.allow_link_forwarding("virbr7"),
            Err(HostOpsError::Io { .. })
        ));
    }

    #[test]
    fn noop_records_calls() {
        let ops = NoopHostOps::default();
        ops.install_exports("lab", "").unwrap();
        ops.allow_link_forwarding("virbr1").unwrap();
        assert_eq!(ops.calls(), vec!["export lab", "allow-link virbr1"]);
    }
}
