// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, Logger};
use thiserror::Error;

/// One playbook to apply to one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunTarget {
    pub host: String,
    pub ip: IpAddr,
    pub playbook: PathBuf,
    pub os: String,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration of {host} failed ({status}): {output}")]
    Failed { host: String, status: String, output: String },
}

/// Applies configuration playbooks to hosts.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigRunner: Send + Sync {
    fn run(&self, target: &RunTarget) -> BoxFuture<'static, Result<(), RunError>>;
}

/// Runs playbooks with `ansible-playbook` over SSH.
pub struct AnsibleRunner {
    program: PathBuf,
    user: String,
    become_pass: String,
    private_key: PathBuf,
    log: Logger,
}

impl AnsibleRunner {
    pub fn new(
        cfg: &rvn_config_toml::Configure,
        private_key: &Path,
        log: Logger,
    ) -> Self {
        Self {
            program: cfg.runner.clone(),
            user: cfg.user.clone(),
            become_pass: cfg.become_pass.clone(),
            private_key: private_key.to_path_buf(),
            log,
        }
    }

    fn args(&self, target: &RunTarget) -> Vec<String> {
        let mut extra = format!("ansible_become_pass={}", self.become_pass);
        // FreeBSD images carry no /usr/bin/python.
        if target.os.eq_ignore_ascii_case("freebsd") {
            extra.push_str(" ansible_python_interpreter=/usr/local/bin/python2");
        }
        vec![
            "-i".to_string(),
            format!("{},", target.ip),
            target.playbook.display().to_string(),
            "--extra-vars".to_string(),
            extra,
            format!("--user={}", self.user),
            format!("--private-key={}", self.private_key.display()),
        ]
    }
}

// Ansible reports task failures on stdout; keep the tail of both streams.
fn failure_output(stdout: &[u8], stderr: &[u8]) -> String {
    const KEEP: usize = 2048;
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    out.push_str(&String::from_utf8_lossy(stderr));
    let out = out.trim();
    match out.char_indices().rev().nth(KEEP) {
        Some((i, _)) => out[i..].to_string(),
        None => out.to_string(),
    }
}

impl ConfigRunner for AnsibleRunner {
    fn run(&self, target: &RunTarget) -> BoxFuture<'static, Result<(), RunError>> {
        let args = self.args(target);
        debug!(self.log, "running playbook";
            "host" => &target.host, "args" => ?args);

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let command = self.program.display().to_string();
        let host = target.host.clone();

        async move {
            let output = cmd
                .output()
                .await
                .map_err(|source| RunError::Spawn { command, source })?;
            if output.status.success() {
                Ok(())
            } else {
                Err(RunError::Failed {
                    host,
                    status: output.status.to_string(),
                    output: failure_output(&output.stdout, &output.stderr),
                })
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn runner() -> AnsibleRunner {
        AnsibleRunner::new(
            &rvn_config_toml::Configure::default(),
            Path::new("/var/rvn/ssh/rvn"),
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    fn target(os: &str) -> RunTarget {
        RunTarget {
            host: "n1".into(),
            ip: "172.22.0.10".parse().unwrap(),
            playbook: PathBuf::from("/lab/.rvn/n1.yml"),
            os: os.into(),
        }
    }

    #[test]
    fn ansible_arguments() {
        assert_eq!(
            runner().args(&target("debian")).join(" "),
            "-i 172.22.0.10, /lab/.rvn/n1.yml --extra-vars \
             ansible_become_pass=rvn --user=rvn \
             --private-key=/var/rvn/ssh/rvn"
        );
        let bsd = runner().args(&target("FreeBSD"));
        assert_eq!(
            bsd[4],
            "ansible_become_pass=rvn \
             ansible_python_interpreter=/usr/local/bin/python2"
        );
    }

    #[test]
    fn failure_output_keeps_the_tail() {
        let long = "x".repeat(5000) + "fatal: unreachable";
        let out = failure_output(long.as_bytes(), b"");
        assert!(out.ends_with("fatal: unreachable"));
        assert!(out.len() <= 2049);
        assert_eq!(failure_output(b" ok \n", b"warn\n"), "ok \nwarn");
    }

    #[tokio::test]
    async fn missing_runner_is_a_spawn_error() {
        let mut cfg = rvn_config_toml::Configure::default();
        cfg.runner = PathBuf::from("/nonexistent/ansible-playbook");
        let runner = AnsibleRunner::new(
            &cfg,
            Path::new("/key"),
            Logger::root(slog::Discard, slog::o!()),
        );
        assert!(matches!(
            runner.run(&target("debian")).await,
            Err(RunError::Spawn { .. })
        ));
    }
}
