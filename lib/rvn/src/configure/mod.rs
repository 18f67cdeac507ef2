// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concurrent per-host configuration.
//!
//! Each selected host gets its own task: mark it `configuring`, apply the
//! base playbook, then the user's overlay playbook if there is one, and
//! record `success` or `failed`. Tasks only ever write their own host's
//! state key. The caller gets control back once every task has finished.

use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures::FutureExt;
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::engine::{Engine, LifecycleError};
use crate::status::DomState;
use crate::store::{ConfigState, ConfigStates, StoreError};
use crate::workspace::Workspace;

pub mod runner;

use runner::{ConfigRunner, RunError, RunTarget};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigureOptions {
    /// Apply `<dir>/config/<host>.yml` after the base configuration.
    pub with_user_config: bool,
    /// Restrict the run to these hosts; `None` means every host.
    pub hosts: Option<Vec<String>>,
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self { with_user_config: true, hosts: None }
    }
}

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("host {0} has no address to configure")]
    NoAddress(String),

    #[error(transparent)]
    Run(#[from] RunError),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to run pre-config hook {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pre-config hook exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

#[derive(Debug, Error)]
pub enum HostConfigError {
    #[error("host has no observed address")]
    NoAddress,

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("failed to record configuration state: {0}")]
    State(#[from] StoreError),

    #[error("configuration was cancelled")]
    Cancelled,

    #[error("configuration task panicked")]
    Panicked,
}

#[derive(Debug)]
pub struct HostOutcome {
    pub host: String,
    pub result: Result<(), HostConfigError>,
}

#[derive(Debug, Default)]
pub struct ConfigureReport {
    pub pre_config: Option<HookError>,
    /// One per configured host, sorted by host name.
    pub outcomes: Vec<HostOutcome>,
}

impl ConfigureReport {
    pub fn failures(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Everything a configuration task needs, owned.
#[derive(Clone, Debug)]
struct HostJob {
    topology: String,
    host: String,
    os: String,
    ip: Option<IpAddr>,
    base_config: PathBuf,
    user_config: Option<PathBuf>,
}

impl Engine {
    /// Configures the hosts of the topology built in `ws`. Netboot hosts
    /// are never configured.
    pub async fn configure(
        &self,
        ws: &Workspace,
        opts: ConfigureOptions,
    ) -> Result<ConfigureReport, ConfigureError> {
        let topo = ws
            .load_topology()
            .map_err(LifecycleError::from)?
            .ok_or_else(|| LifecycleError::NotBuilt(ws.source_dir().to_path_buf()))?;
        if let Some(wanted) = &opts.hosts {
            if let Some(unknown) = wanted.iter().find(|h| topo.host(h).is_none()) {
                return Err(LifecycleError::UnknownHost {
                    topology: topo.name.clone(),
                    host: unknown.clone(),
                }
                .into());
            }
        }
        let log = self.topology_log(&topo.name);

        let pre_config = self.run_pre_config(ws, &log).await.err();
        let observer = self.observer();
        let states = self.states.clone();
        let observed = topo.clone();
        let status = tokio::task::spawn_blocking(move || {
            let status = observer.topology_status(&observed);
            states.ensure_healthy();
            status
        })
        .await
        .map_err(LifecycleError::from)??;

        let jobs: Vec<HostJob> = topo
            .hosts()
            .map(|(_, h)| h)
            .filter(|h| !h.is_netboot())
            .filter(|h| opts.hosts.as_ref().map_or(true, |w| w.contains(&h.name)))
            .map(|h| {
                let observed =
                    status.nodes.get(&h.name).or_else(|| status.switches.get(&h.name));
                let user = ws.user_config_path(&h.name);
                HostJob {
                    topology: topo.name.clone(),
                    host: h.name.clone(),
                    os: h.os.clone(),
                    ip: observed
                        .filter(|s| s.state == DomState::Running)
                        .and_then(|s| s.ip),
                    base_config: ws.base_config_path(&h.name),
                    user_config: (opts.with_user_config && user.exists())
                        .then_some(user),
                }
            })
            .collect();

        info!(log, "configuring hosts"; "count" => jobs.len());
        let outcomes = fan_out(
            jobs,
            self.runner.clone(),
            self.states.clone(),
            self.max_parallel,
            &log,
        )
        .await;
        Ok(ConfigureReport { pre_config, outcomes })
    }

    async fn run_pre_config(
        &self,
        ws: &Workspace,
        log: &Logger,
    ) -> Result<(), HookError> {
        let hook = ws.pre_config_hook();
        if !hook.exists() {
            return Ok(());
        }
        info!(log, "running pre-config hook"; "path" => %hook.display());
        let output = tokio::process::Command::new(&hook)
            .current_dir(ws.pre_config_dir())
            .env("TOPOJSON", ws.topology_path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| HookError::Spawn { path: hook.clone(), source })?;
        if !output.status.success() {
            let err = HookError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            error!(log, "pre-config hook failed"; "error" => %err);
            return Err(err);
        }
        Ok(())
    }

    /// Applies a single playbook to one host without recording any state.
    pub async fn run_playbook(
        &self,
        ws: &Workspace,
        host: &str,
        playbook: PathBuf,
    ) -> Result<(), ConfigureError> {
        let status = self.observe_host(ws, host).await?;
        let topo = ws
            .load_topology()
            .map_err(LifecycleError::from)?
            .ok_or_else(|| LifecycleError::NotBuilt(ws.source_dir().to_path_buf()))?;
        let os = topo.host(host).map(|h| h.os.clone()).unwrap_or_default();
        let ip = status
            .ip
            .filter(|_| status.state == DomState::Running)
            .ok_or_else(|| ConfigureError::NoAddress(host.to_string()))?;
        let target = RunTarget { host: host.to_string(), ip, playbook, os };
        self.runner.run(&target).await?;
        Ok(())
    }
}

async fn fan_out(
    jobs: Vec<HostJob>,
    runner: Arc<dyn ConfigRunner>,
    states: ConfigStates,
    max_parallel: usize,
    log: &Logger,
) -> Vec<HostOutcome> {
    let permits = Arc::new(Semaphore::new(max_parallel));
    let mut tasks = JoinSet::new();
    for job in jobs {
        let runner = runner.clone();
        let states = states.clone();
        let permits = permits.clone();
        let log = log.new(o!("host" => job.host.clone()));
        tasks.spawn(async move {
            let host = job.host.clone();
            let result = AssertUnwindSafe(configure_host(
                job, runner, states, permits, &log,
            ))
            .catch_unwind()
            .await
            .unwrap_or(Err(HostConfigError::Panicked));
            match &result {
                Ok(()) => info!(log, "host configured"),
                Err(e) => warn!(log, "host configuration failed"; "error" => %e),
            }
            HostOutcome { host, result }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => error!(log, "configuration task lost"; "error" => %e),
        }
    }
    outcomes.sort_by(|a, b| a.host.cmp(&b.host));
    outcomes
}

async fn configure_host(
    job: HostJob,
    runner: Arc<dyn ConfigRunner>,
    states: ConfigStates,
    permits: Arc<Semaphore>,
    log: &Logger,
) -> Result<(), HostConfigError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| HostConfigError::Cancelled)?;
    record_state(&states, &job, ConfigState::Configuring).await?;
    let Some(ip) = job.ip else {
        record_state(&states, &job, ConfigState::Failed).await?;
        return Err(HostConfigError::NoAddress);
    };

    let playbooks = std::iter::once(job.base_config.clone()).chain(job.user_config.clone());
    for playbook in playbooks {
        debug!(log, "applying playbook"; "playbook" => %playbook.display());
        let target = RunTarget {
            host: job.host.clone(),
            ip,
            playbook,
            os: job.os.clone(),
        };
        if let Err(e) = runner.run(&target).await {
            record_state(&states, &job, ConfigState::Failed).await?;
            return Err(e.into());
        }
    }
    record_state(&states, &job, ConfigState::Success).await?;
    Ok(())
}

/// Writes a host's state from the blocking pool; the store may lock files
/// or wait out an outage.
async fn record_state(
    states: &ConfigStates,
    job: &HostJob,
    state: ConfigState,
) -> Result<(), HostConfigError> {
    let (states, topology, host) =
        (states.clone(), job.topology.clone(), job.host.clone());
    tokio::task::spawn_blocking(move || states.set(&topology, &host, state))
        .await
        .map_err(|_| HostConfigError::Cancelled)??;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::liveness::LivenessPolicy;
    use crate::store::StateStore;
    use super::runner::MockConfigRunner;

    /// Remembers every value ever written per key.
    #[derive(Default)]
    struct HistoryStore {
        history: Mutex<BTreeMap<String, Vec<String>>>,
    }

    impl StateStore for HistoryStore {
        fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            let h = self.history.lock().unwrap();
            Ok(h.get(key).and_then(|v| v.last().cloned()))
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.history
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        }

        fn del(&self, key: &str) -> Result<(), StoreError> {
            self.history.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn job(host: &str, ip: Option<&str>, user: bool) -> HostJob {
        HostJob {
            topology: "lab".into(),
            host: host.into(),
            os: "debian".into(),
            ip: ip.map(|s| s.parse().unwrap()),
            base_config: PathBuf::from(format!("/lab/.rvn/{host}.yml")),
            user_config: user
                .then(|| PathBuf::from(format!("/lab/config/{host}.yml"))),
        }
    }

    fn states(store: Arc<HistoryStore>) -> ConfigStates {
        ConfigStates::new(
            store,
            LivenessPolicy::default(),
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    fn history(store: &HistoryStore, host: &str) -> Vec<String> {
        store.history.lock().unwrap()[&format!("config_state:lab:{host}")].clone()
    }

    #[tokio::test]
    async fn each_host_passes_through_configuring() {
        let mut runner = MockConfigRunner::new();
        runner.expect_run().returning(|t| {
            let fail = t.host == "b";
            async move {
                if fail {
                    Err(RunError::Failed {
                        host: "b".into(),
                        status: "exit status: 4".into(),
                        output: "UNREACHABLE".into(),
                    })
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        let store = Arc::new(HistoryStore::default());
        let log = Logger::root(slog::Discard, slog::o!());

        let outcomes = fan_out(
            vec![
                job("b", Some("172.22.0.3"), false),
                job("a", Some("172.22.0.2"), false),
            ],
            Arc::new(runner),
            states(store.clone()),
            4,
            &log,
        )
        .await;

        assert_eq!(outcomes[0].host, "a");
        assert!(outcomes[0].result.is_ok());
        assert_eq!(outcomes[1].host, "b");
        assert!(matches!(outcomes[1].result, Err(HostConfigError::Run(_))));
        assert_eq!(history(&store, "a"), vec!["configuring", "success"]);
        assert_eq!(history(&store, "b"), vec!["configuring", "failed"]);
    }

    #[tokio::test]
    async fn user_overlay_runs_after_base() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut runner = MockConfigRunner::new();
        let record = seen.clone();
        runner.expect_run().times(2).returning(move |t| {
            record.lock().unwrap().push(t.playbook.clone());
            async { Ok(()) }.boxed()
        });
        let store = Arc::new(HistoryStore::default());

        let outcomes = fan_out(
            vec![job("a", Some("172.22.0.2"), true)],
            Arc::new(runner),
            states(store.clone()),
            1,
            &Logger::root(slog::Discard, slog::o!()),
        )
        .await;

        assert!(outcomes[0].result.is_ok());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PathBuf::from("/lab/.rvn/a.yml"),
                PathBuf::from("/lab/config/a.yml")
            ]
        );
    }

    #[tokio::test]
    async fn failed_base_skips_overlay() {
        let mut runner = MockConfigRunner::new();
        runner.expect_run().times(1).returning(|_| {
            async {
                Err(RunError::Failed {
                    host: "a".into(),
                    status: "exit status: 2".into(),
                    output: String::new(),
                })
            }
            .boxed()
        });
        let store = Arc::new(HistoryStore::default());

        let outcomes = fan_out(
            vec![job("a", Some("172.22.0.2"), true)],
            Arc::new(runner),
            states(store.clone()),
            1,
            &Logger::root(slog::Discard, slog::o!()),
        )
        .await;
        assert!(outcomes[0].result.is_err());
        assert_eq!(history(&store, "a"), vec!["configuring", "failed"]);
    }

    #[tokio::test]
    async fn unreachable_host_fails_without_running() {
        let mut runner = MockConfigRunner::new();
        runner.expect_run().never();
        let store = Arc::new(HistoryStore::default());

        let outcomes = fan_out(
            vec![job("a", None, false)],
            Arc::new(runner),
            states(store.clone()),
            1,
            &Logger::root(slog::Discard, slog::o!()),
        )
        .await;
        assert!(matches!(outcomes[0].result, Err(HostConfigError::NoAddress)));
        assert_eq!(history(&store, "a"), vec!["configuring", "failed"]);
    }

    #[tokio::test]
    async fn fan_out_width_is_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut runner = MockConfigRunner::new();
        let (r, p) = (running.clone(), peak.clone());
        runner.expect_run().returning(move |_| {
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        let jobs = (0..8)
            .map(|i| job(&format!("h{i}"), Some("172.22.0.9"), false))
            .collect();

        let outcomes = fan_out(
            jobs,
            Arc::new(runner),
            states(Arc::new(HistoryStore::default())),
            2,
            &Logger::root(slog::Discard, slog::o!()),
        )
        .await;
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    /// Holds every write for a while and remembers how many overlapped.
    #[derive(Default)]
    struct SlowStore {
        writing: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl StateStore for SlowStore {
        fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            use std::sync::atomic::Ordering;

            let now = self.writing.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.writing.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn del(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_store_does_not_serialize_hosts() {
        let mut runner = MockConfigRunner::new();
        runner.expect_run().returning(|_| async { Ok(()) }.boxed());
        let store = Arc::new(SlowStore::default());
        let states = ConfigStates::new(
            store.clone(),
            LivenessPolicy::default(),
            Logger::root(slog::Discard, slog::o!()),
        );
        let jobs = (0..4)
            .map(|i| job(&format!("h{i}"), Some("172.22.0.9"), false))
            .collect();

        // The test runtime has a single worker thread; overlapping writes
        // can only come from the blocking pool.
        let outcomes = fan_out(
            jobs,
            Arc::new(runner),
            states,
            4,
            &Logger::root(slog::Discard, slog::o!()),
        )
        .await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(
            store.peak.load(std::sync::atomic::Ordering::SeqCst) >= 2,
            "state writes ran one at a time"
        );
    }
}
