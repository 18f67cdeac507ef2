// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::subnet::ManagementSubnet;
use crate::topology::Topology;

pub const EXPORT_OPTIONS: &str = "rw,sync,no_subtree_check,no_root_squash";

/// Host directories mounted by any host in the topology, each exported once.
pub fn export_dirs(topo: &Topology) -> BTreeSet<&str> {
    topo.hosts()
        .flat_map(|(_, h)| h.mounts.iter().map(|m| m.source.as_str()))
        .collect()
}

/// An `exports(5)` fragment sharing every mount source with the topology's
/// management subnet.
pub fn render_exports(topo: &Topology, subnet: ManagementSubnet) -> String {
    let mut out = String::new();
    let cidr = subnet.cidr();
    for dir in export_dirs(topo) {
        let _ = writeln!(out, "{dir} {cidr}({EXPORT_OPTIONS})");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_sources_are_exported_once() {
        let topo = Topology::from_json(
            br#"{
                "name": "lab",
                "nodes": [
                    {"name": "a", "mounts": [
                        {"point": "/src", "source": "/home/lab/src"},
                        {"point": "/data", "source": "/srv/data"}]},
                    {"name": "b", "mounts": [
                        {"point": "/code", "source": "/home/lab/src"}]}
                ],
                "switches": [{"name": "sw"}]
            }"#,
        )
        .unwrap();
        let exports = render_exports(&topo, ManagementSubnet::new(2));
        assert_eq!(
            exports,
            "/home/lab/src 172.22.2.0/24(rw,sync,no_subtree_check,no_root_squash)\n\
             /srv/data 172.22.2.0/24(rw,sync,no_subtree_check,no_root_squash)\n"
        );
    }

    #[test]
    fn no_mounts_no_exports() {
        let topo =
            Topology::from_json(br#"{"name": "lab", "nodes": [{"name": "a"}]}"#)
                .unwrap();
        assert!(render_exports(&topo, ManagementSubnet::new(0)).is_empty());
    }
}
