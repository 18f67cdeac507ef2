// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! iptables rules opened for topology bridges.

/// Ports guests on the management network need on the hypervisor host for
/// NFS mounts: rpcbind (tcp and udp) and nfsd.
const MANAGEMENT_SERVICES: [(&str, u16); 3] =
    [("tcp", 111), ("udp", 111), ("tcp", 2049)];

/// Group forwarding mask letting LLDP frames (01:80:c2:00:00:0e) cross
/// link bridges.
pub const LLDP_GROUP_FWD_MASK: &str = "16384";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    chain: &'static str,
    matches: Vec<String>,
}

impl Rule {
    /// `iptables` arguments placing the rule at the head of its chain.
    pub fn insert(&self) -> Vec<String> {
        self.with_op("-I")
    }

    pub fn append(&self) -> Vec<String> {
        self.with_op("-A")
    }

    pub fn delete(&self) -> Vec<String> {
        self.with_op("-D")
    }

    fn with_op(&self, op: &str) -> Vec<String> {
        let mut args = vec![op.to_string(), self.chain.to_string()];
        args.extend(self.matches.iter().cloned());
        args
    }
}

/// INPUT accepts for NFS services arriving on the management bridge.
pub fn management_rules(bridge: &str) -> Vec<Rule> {
    MANAGEMENT_SERVICES
        .iter()
        .map(|(proto, port)| Rule {
            chain: "INPUT",
            matches: vec![
                "-i".into(),
                bridge.into(),
                "-p".into(),
                proto.to_string(),
                "--dport".into(),
                port.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        })
        .collect()
}

/// FORWARD accept for broadcast BOOTP traffic on a link bridge.
pub fn bootp_rule(bridge: &str) -> Rule {
    Rule {
        chain: "FORWARD",
        matches: vec![
            "-i".into(),
            bridge.into(),
            "-d".into(),
            "255.255.255.255".into(),
            "-j".into(),
            "ACCEPT".into(),
        ],
    }
}

/// Whether a failed delete only means the rule was never installed, as when a
/// topology is built but never launched.
pub fn is_missing_rule(stderr: &str) -> bool {
    stderr.contains("Bad rule") || stderr.contains("does a matching rule exist")
}
