// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk layout of a testbed's source and working directories.

use std::path::{Path, PathBuf};

use crate::topology::{Topology, TopologyError};

/// Name of the working directory kept inside a testbed's source directory.
pub const WORK_DIR: &str = ".rvn";

/// A testbed source directory and the working directory derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    source_dir: PathBuf,
    work_dir: PathBuf,
}

impl Workspace {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        let source_dir = source_dir.into();
        let work_dir = source_dir.join(WORK_DIR);
        Self { source_dir, work_dir }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The resolved topology document written by a build.
    pub fn topology_path(&self) -> PathBuf {
        self.work_dir.join("topo.json")
    }

    pub fn domain_xml_path(&self, qualified: &str) -> PathBuf {
        self.work_dir.join(format!("dom_{qualified}.xml"))
    }

    pub fn network_xml_path(&self, qualified: &str) -> PathBuf {
        self.work_dir.join(format!("net_{qualified}.xml"))
    }

    /// Copy-on-write disk image backing `host`'s domain.
    pub fn instance_image_path(&self, host: &str) -> PathBuf {
        self.work_dir.join(format!("{host}.qcow2"))
    }

    pub fn base_config_path(&self, host: &str) -> PathBuf {
        self.work_dir.join(format!("{host}.yml"))
    }

    /// Optional per-host playbook authored alongside the topology.
    pub fn user_config_path(&self, host: &str) -> PathBuf {
        self.source_dir.join("config").join(format!("{host}.yml"))
    }

    pub fn pre_config_dir(&self) -> PathBuf {
        self.source_dir.join("pre-config")
    }

    pub fn pre_config_hook(&self) -> PathBuf {
        self.pre_config_dir().join("run")
    }

    /// Loads the topology last built into this workspace, with links
    /// resolved. `None` means nothing has been built yet.
    pub fn load_topology(&self) -> Result<Option<Topology>, TopologyError> {
        let mut topo = match Topology::load(self.topology_path()) {
            Ok(t) => t,
            Err(TopologyError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        topo.resolve_links()?;
        Ok(Some(topo))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        let ws = Workspace::new("/home/lab/net");
        assert_eq!(ws.work_dir(), Path::new("/home/lab/net/.rvn"));
        assert_eq!(ws.topology_path(), Path::new("/home/lab/net/.rvn/topo.json"));
        assert_eq!(
            ws.domain_xml_path("lab_n1"),
            Path::new("/home/lab/net/.rvn/dom_lab_n1.xml")
        );
        assert_eq!(
            ws.network_xml_path("lab_test"),
            Path::new("/home/lab/net/.rvn/net_lab_test.xml")
        );
        assert_eq!(
            ws.user_config_path("n1"),
            Path::new("/home/lab/net/config/n1.yml")
        );
        assert_eq!(
            ws.pre_config_hook(),
            Path::new("/home/lab/net/pre-config/run")
        );
    }

    #[test]
    fn unbuilt_workspace_has_no_topology() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(ws.load_topology().unwrap().is_none());

        std::fs::create_dir_all(ws.work_dir()).unwrap();
        std::fs::write(ws.topology_path(), b"not json").unwrap();
        assert!(matches!(ws.load_topology(), Err(TopologyError::Json(_))));
    }
}
