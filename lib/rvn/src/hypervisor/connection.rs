// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex, PoisonError};

use slog::{info, Logger};

use super::{Connector, Hypervisor};
use crate::liveness::LivenessPolicy;

/// Owns the process's connection to the virtualization endpoint.
///
/// The connection is established lazily and health-checked on every
/// [`ConnectionManager::ensure_healthy`]; a dead connection is replaced.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    conn: Mutex<Option<Arc<dyn Hypervisor>>>,
    policy: LivenessPolicy,
    log: Logger,
}

impl ConnectionManager {
    pub fn new(
        connector: Box<dyn Connector>,
        policy: LivenessPolicy,
        log: Logger,
    ) -> Self {
        Self { connector, conn: Mutex::new(None), policy, log }
    }

    /// Returns a live handle, blocking until the endpoint is reachable.
    pub fn ensure_healthy(&self) -> Arc<dyn Hypervisor> {
        let mut guard =
            self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() {
                return conn.clone();
            }
            info!(self.log, "hypervisor connection lost, reconnecting");
            *guard = None;
        }

        let conn = self.policy.wait_until(&self.log, "hypervisor", || {
            let conn = self.connector.connect()?;
            if conn.is_alive() {
                Ok(conn)
            } else {
                Err(super::HypervisorError::Command {
                    command: "connect".to_string(),
                    stderr: "connection is not alive".to_string(),
                })
            }
        });
        info!(self.log, "connected to hypervisor");
        *guard = Some(conn.clone());
        conn
    }
}
