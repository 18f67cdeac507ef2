// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The base configuration applied to every host before any user overlay.

use serde::Serialize;

use crate::subnet::ManagementSubnet;
use crate::topology::Host;

#[derive(Debug, Serialize)]
struct Play {
    hosts: &'static str,
    #[serde(rename = "become")]
    escalate: bool,
    tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
struct Task {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<Hostname>,
    #[serde(skip_serializing_if = "Option::is_none")]
    package: Option<Package>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mount: Option<NfsMount>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    ignore_errors: bool,
}

impl Task {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: None,
            package: None,
            mount: None,
            ignore_errors: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct Hostname {
    name: String,
}

#[derive(Debug, Serialize)]
struct Package {
    name: &'static str,
    state: &'static str,
}

#[derive(Debug, Serialize)]
struct NfsMount {
    path: String,
    src: String,
    fstype: &'static str,
    state: &'static str,
}

/// Renders the base playbook for `host`: set its hostname and mount every
/// NFS share it declares from the management gateway.
pub fn render_base_config(
    host: &Host,
    subnet: ManagementSubnet,
) -> Result<String, serde_yaml::Error> {
    let mut tasks = vec![Task {
        hostname: Some(Hostname { name: host.name.clone() }),
        ..Task::named("set hostname")
    }];

    if !host.mounts.is_empty() {
        // Images that ship the client already may lack a package manager.
        tasks.push(Task {
            package: Some(Package { name: "nfs-common", state: "present" }),
            ignore_errors: true,
            ..Task::named("install nfs client")
        });
    }
    tasks.extend(host.mounts.iter().map(|m| Task {
        mount: Some(NfsMount {
            path: m.point.clone(),
            src: format!("{}:{}", subnet.gateway(), m.source),
            fstype: "nfs",
            state: "mounted",
        }),
        ..Task::named(format!("mount {}", m.point))
    }));

    serde_yaml::to_string(&[Play { hosts: "all", escalate: true, tasks }])
}
