// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::xml::Element;
use crate::subnet::ManagementSubnet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkKind {
    /// The NAT'd management network with DHCP, local to `<topology>.net`.
    Management { domain: String, subnet: ManagementSubnet },
    /// An isolated bridge backing one link.
    Link,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkDef {
    pub name: String,
    /// Topology-local name: the link name, or `test`.
    pub local: String,
    pub kind: NetworkKind,
}

impl NetworkDef {
    pub fn is_management(&self) -> bool {
        matches!(self.kind, NetworkKind::Management { .. })
    }

    pub fn to_xml(&self) -> String {
        let net = Element::new("network").child(Element::leaf("name", &self.name));
        match &self.kind {
            NetworkKind::Management { domain, subnet } => net
                .child(Element::new("forward").attr("mode", "nat"))
                .child(
                    Element::new("domain")
                        .attr("name", domain)
                        .attr("localOnly", "yes"),
                )
                .child(
                    Element::new("ip")
                        .attr("address", subnet.gateway())
                        .attr("netmask", subnet.netmask())
                        .child(
                            Element::new("dhcp").child(
                                Element::new("range")
                                    .attr("start", subnet.dhcp_start())
                                    .attr("end", subnet.dhcp_end()),
                            ),
                        ),
                ),
            NetworkKind::Link => net
                .child(Element::new("bridge").attr("stp", "off").attr("delay", 0)),
        }
        .render()
    }
}
