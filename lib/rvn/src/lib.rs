// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

pub mod configure;
pub mod engine;
pub mod host;
pub mod hypervisor;
pub mod lifecycle;
pub mod liveness;
pub mod persist;
pub mod status;
pub mod store;
pub mod subnet;
pub mod synth;
pub mod topology;
pub mod workspace;

pub use configure::{ConfigureOptions, ConfigureReport};
pub use engine::{Collaborators, Engine, Failure, LifecycleError, ResourceError};
pub use lifecycle::RebootRequest;
pub use status::{DomState, DomStatus, LinkState, TopologyStatus};
pub use topology::{qualify, Topology};
pub use workspace::Workspace;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
