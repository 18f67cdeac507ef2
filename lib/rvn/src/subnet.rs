// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocation of per-topology management subnets.
//!
//! The table lives in a JSON file shared by every topology (and every
//! orchestrator process) on the host. It is re-read under an exclusive
//! `flock` for each allocate or free so no process works from a stale copy.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::persist::{lock_path_for, write_atomic, LockFile};

pub const SUBNET_SLOTS: usize = 256;

#[derive(Debug, Error)]
pub enum SubnetError {
    #[error("runtime state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode runtime state: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no free management subnet: all {SUBNET_SLOTS} are allocated")]
    Exhausted,

    #[error("runtime state maps {topology} to slot {index}, which is not marked taken")]
    Inconsistent { topology: String, index: u8 },
}

/// The persisted subnet table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(rename = "SubnetTable", with = "serde_arrays")]
    table: [bool; SUBNET_SLOTS],

    #[serde(
        rename = "SubnetReverseTable",
        default,
        deserialize_with = "null_as_empty"
    )]
    reverse: BTreeMap<String, u8>,
}

fn null_as_empty<'de, D>(d: D) -> Result<BTreeMap<String, u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, u8>>::deserialize(d)?.unwrap_or_default())
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self { table: [false; SUBNET_SLOTS], reverse: BTreeMap::new() }
    }
}

impl RuntimeState {
    fn check(&self) -> Result<(), SubnetError> {
        for (topology, &index) in &self.reverse {
            if !self.table[usize::from(index)] {
                return Err(SubnetError::Inconsistent {
                    topology: topology.clone(),
                    index,
                });
            }
        }
        Ok(())
    }

    pub fn lookup(&self, topology: &str) -> Option<u8> {
        self.reverse.get(topology).copied()
    }

    /// Returns the topology's existing slot, or takes the lowest free one.
    pub fn allocate(&mut self, topology: &str) -> Result<u8, SubnetError> {
        if let Some(index) = self.lookup(topology) {
            return Ok(index);
        }
        let slot = self
            .table
            .iter()
            .position(|taken| !taken)
            .ok_or(SubnetError::Exhausted)?;
        let index = u8::try_from(slot).map_err(|_| SubnetError::Exhausted)?;
        self.table[slot] = true;
        self.reverse.insert(topology.to_string(), index);
        Ok(index)
    }

    pub fn free(&mut self, topology: &str) -> Option<u8> {
        let index = self.reverse.remove(topology)?;
        self.table[usize::from(index)] = false;
        Some(index)
    }
}

/// The private management network of one topology: `172.22.<index>.0/24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagementSubnet {
    pub index: u8,
}

impl ManagementSubnet {
    pub fn new(index: u8) -> Self {
        Self { index }
    }

    fn host(&self, last: u8) -> Ipv4Addr {
        Ipv4Addr::new(172, 22, self.index, last)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.host(0)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.host(1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    pub fn dhcp_start(&self) -> Ipv4Addr {
        self.host(2)
    }

    pub fn dhcp_end(&self) -> Ipv4Addr {
        self.host(254)
    }

    /// CIDR form, as used in NFS export lists.
    pub fn cidr(&self) -> String {
        format!("{}/24", self.network())
    }
}

/// File-backed allocator over [`RuntimeState`].
#[derive(Clone, Debug)]
pub struct SubnetAllocator {
    runtime: PathBuf,
    lock: PathBuf,
}

impl SubnetAllocator {
    pub fn new(runtime: impl Into<PathBuf>) -> Self {
        let runtime = runtime.into();
        let lock = lock_path_for(&runtime);
        Self { runtime, lock }
    }

    pub fn runtime_path(&self) -> &Path {
        &self.runtime
    }

    fn load(&self) -> Result<RuntimeState, SubnetError> {
        let state = match std::fs::read(&self.runtime) {
            Ok(raw) => serde_json::from_slice::<RuntimeState>(&raw)?,
            // First use on this host.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                RuntimeState::default()
            }
            Err(e) => return Err(e.into()),
        };
        state.check()?;
        Ok(state)
    }

    fn save(&self, state: &RuntimeState) -> Result<(), SubnetError> {
        let data = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.runtime, &data)?;
        Ok(())
    }

    pub fn allocate(
        &self,
        topology: &str,
    ) -> Result<ManagementSubnet, SubnetError> {
        let _lock = LockFile::exclusive(&self.lock)?;
        let mut state = self.load()?;
        if let Some(index) = state.lookup(topology) {
            return Ok(ManagementSubnet::new(index));
        }
        let index = state.allocate(topology)?;
        self.save(&state)?;
        Ok(ManagementSubnet::new(index))
    }

    /// Releases the topology's slot, returning the subnet it held, if any.
    pub fn free(
        &self,
        topology: &str,
    ) -> Result<Option<ManagementSubnet>, SubnetError> {
        let _lock = LockFile::exclusive(&self.lock)?;
        let mut state = self.load()?;
        let Some(index) = state.free(topology) else {
            return Ok(None);
        };
        self.save(&state)?;
        Ok(Some(ManagementSubnet::new(index)))
    }

    pub fn lookup(
        &self,
        topology: &str,
    ) -> Result<Option<ManagementSubnet>, SubnetError> {
        let _lock = LockFile::shared(&self.lock)?;
        Ok(self.load()?.lookup(topology).map(ManagementSubnet::new))
    }
}
