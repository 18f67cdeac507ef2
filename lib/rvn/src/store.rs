// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted per-host configuration state.
//!
//! Outcomes of configuration runs are kept in a small key/value store shared
//! by every orchestrator process on the host, keyed
//! `config_state:<topology>:<host>`. Absence of a key means the host was never
//! configured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use slog::Logger;
use thiserror::Error;

use crate::liveness::LivenessPolicy;
use crate::persist::{lock_path_for, write_atomic, LockFile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store is corrupt: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The key/value operations the orchestrator needs from its state store.
pub trait StateStore: Send + Sync {
    /// Succeeds when the store is reachable.
    fn ping(&self) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// A JSON map in a single file, guarded by `flock`.
pub struct FileStore {
    path: PathBuf,
    lock: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let path = state_dir.as_ref().join("config-state.json");
        let lock = lock_path_for(&path);
        Self { path, lock }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> Result<(), StoreError> {
        let _lock = LockFile::exclusive(&self.lock)?;
        let mut map = self.load()?;
        if f(&mut map) {
            write_atomic(&self.path, &serde_json::to_vec_pretty(&map)?)?;
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn ping(&self) -> Result<(), StoreError> {
        let _lock = LockFile::shared(&self.lock)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _lock = LockFile::shared(&self.lock)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|m| {
            m.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.update(|m| m.remove(key).is_some())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    fn map(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.map().remove(key);
        Ok(())
    }
}

/// Outcome of the most recent configuration run on a host.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigState {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unset,
    Configuring,
    Success,
    Failed,
}

impl ConfigState {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Interprets a stored value; anything unrecognized counts as unset.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("configuring") => ConfigState::Configuring,
            Some("success") => ConfigState::Success,
            Some("failed") => ConfigState::Failed,
            _ => ConfigState::Unset,
        }
    }
}

pub fn config_state_key(topology: &str, host: &str) -> String {
    format!("config_state:{topology}:{host}")
}

/// Typed access to configuration state, with the store's liveness guard.
#[derive(Clone)]
pub struct ConfigStates {
    store: Arc<dyn StateStore>,
    policy: LivenessPolicy,
    log: Logger,
}

impl ConfigStates {
    pub fn new(
        store: Arc<dyn StateStore>,
        policy: LivenessPolicy,
        log: Logger,
    ) -> Self {
        Self { store, policy, log }
    }

    /// Blocks until the store answers a ping.
    pub fn ensure_healthy(&self) {
        self.policy.wait_until(&self.log, "state store", || self.store.ping());
    }

    pub fn get(
        &self,
        topology: &str,
        host: &str,
    ) -> Result<ConfigState, StoreError> {
        let value = self.store.get(&config_state_key(topology, host))?;
        Ok(ConfigState::from_stored(value.as_deref()))
    }

    pub fn set(
        &self,
        topology: &str,
        host: &str,
        state: ConfigState,
    ) -> Result<(), StoreError> {
        let key = config_state_key(topology, host);
        match state {
            ConfigState::Unset => self.store.del(&key),
            s => self.store.set(&key, s.as_str()),
        }
    }

    pub fn clear(&self, topology: &str, host: &str) -> Result<(), StoreError> {
        self.store.del(&config_state_key(topology, host))
    }
}
