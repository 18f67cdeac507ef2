// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rvn::configure::ConfigureOptions;
use rvn::{Engine, RebootRequest, Topology, Workspace};
use slog::{info, Drain, Logger};

/// How often `pingwait` re-checks a host that is not reachable yet.
const PING_INTERVAL: Duration = Duration::from_secs(2);

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Build and operate emulated network testbeds
struct Opt {
    /// Orchestrator configuration file
    #[clap(long, env = "RVN_CONFIG", default_value = rvn_config_toml::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Warning, value_parser = parse_log_level)]
    log_level: slog::Level,

    /// Testbed source directory
    #[clap(long, default_value = ".")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Define every domain and network of the topology
    Build {
        /// Topology document; defaults to `<dir>/topo.json`
        #[clap(long)]
        topology: Option<PathBuf>,
    },
    /// Start the built topology
    Deploy,
    /// Configure running hosts
    Configure {
        hosts: Vec<String>,
        /// Skip `config/<host>.yml` overlays
        #[clap(long)]
        no_user_config: bool,
    },
    /// Gracefully shut down every host
    Shutdown,
    /// Tear the topology down and release its resources
    Destroy,
    /// Print the topology's live status as JSON
    Status,
    /// Print a host's management address
    Ip { host: String },
    /// Print an ssh command line for a host
    Ssh { host: String },
    /// Print a host's VNC port
    Vnc { host: String },
    /// Apply a playbook to a host
    Ansible { host: String, playbook: PathBuf },
    /// Reboot hosts (netboot hosts are reset)
    Reboot {
        #[clap(required = true)]
        hosts: Vec<String>,
    },
    /// Wait until hosts answer pings
    Pingwait {
        #[clap(required = true)]
        hosts: Vec<String>,
    },
    /// Rebuild hosts from a fresh image
    Wipe {
        #[clap(required = true)]
        hosts: Vec<String>,
    },
}

fn build_logger(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("rvn", std::io::stderr())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };
    let filtered = slog::LevelFilter::new(main_drain, level);
    Logger::root(filtered.fuse(), slog::o!())
}

/// Prints every failure and returns whether there were none.
fn report<E: std::fmt::Display>(what: &str, failures: &[E]) -> bool {
    for f in failures {
        eprintln!("{what}: {f}");
    }
    failures.is_empty()
}

async fn pingwait(
    engine: &Engine,
    ws: &Workspace,
    host: &str,
    log: &Logger,
) -> anyhow::Result<()> {
    let ip = loop {
        let status = engine.observe_host(ws, host).await?;
        if let Some(ip) = status.ip {
            break ip;
        }
        info!(log, "waiting for address"; "host" => host);
        tokio::time::sleep(PING_INTERVAL).await;
    };
    loop {
        let ok = tokio::process::Command::new("ping")
            .args(["-c", "2", &ip.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("failed to run ping")?
            .success();
        if ok {
            return Ok(());
        }
        info!(log, "waiting for ping"; "host" => host, "ip" => %ip);
        tokio::time::sleep(PING_INTERVAL).await;
    }
}

async fn run(opt: Opt, log: Logger) -> anyhow::Result<bool> {
    let cfg = rvn_config_toml::parse_or_default(&opt.config).with_context(
        || format!("failed to load config {}", opt.config.display()),
    )?;
    let engine = Engine::from_config(&cfg, log.clone());
    let ws = Workspace::new(&opt.dir);

    let clean = match opt.cmd {
        Command::Build { topology } => {
            let path = topology.unwrap_or_else(|| opt.dir.join("topo.json"));
            let topo = Topology::load(&path).with_context(|| {
                format!("failed to load topology {}", path.display())
            })?;
            let r = engine.create(&ws, topo)?;
            println!("built {} on {}", r.topology, r.subnet.cidr());
            report("build", &r.failures)
        }
        Command::Deploy => report("deploy", &engine.launch(&ws)?.failures),
        Command::Shutdown => {
            report("shutdown", &engine.shutdown(&ws)?.failures)
        }
        Command::Destroy => report("destroy", &engine.destroy(&ws)?.failures),
        Command::Configure { hosts, no_user_config } => {
            let opts = ConfigureOptions {
                with_user_config: !no_user_config,
                hosts: (!hosts.is_empty()).then_some(hosts),
            };
            let r = engine.configure(&ws, opts).await?;
            if let Some(e) = &r.pre_config {
                eprintln!("pre-config: {e}");
            }
            for o in &r.outcomes {
                match &o.result {
                    Ok(()) => println!("{}: success", o.host),
                    Err(e) => eprintln!("{}: {e}", o.host),
                }
            }
            r.pre_config.is_none() && r.failures().next().is_none()
        }
        Command::Status => {
            let status = engine.status(&ws)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            true
        }
        Command::Ip { host } => match engine.host_status(&ws, &host)?.ip {
            Some(ip) => {
                println!("{ip}");
                true
            }
            None => false,
        },
        Command::Ssh { host } => match engine.host_status(&ws, &host)?.ip {
            Some(ip) => {
                println!(
                    "ssh -i {} -o StrictHostKeyChecking=no \
                     -o UserKnownHostsFile=/dev/null {}@{ip}",
                    cfg.paths.ssh_key.display(),
                    cfg.configure.user,
                );
                true
            }
            None => {
                eprintln!("{host} has no address yet");
                false
            }
        },
        Command::Vnc { host } => match engine.domain_vnc_port(&ws, &host)? {
            Some(port) => {
                println!("{port}");
                true
            }
            None => {
                eprintln!("{host} is not running");
                false
            }
        },
        Command::Ansible { host, playbook } => {
            engine.run_playbook(&ws, &host, playbook).await?;
            true
        }
        Command::Reboot { hosts } => {
            let topo = ws
                .load_topology()?
                .context("topology has not been built")?;
            let req = RebootRequest { topo: topo.name, nodes: hosts };
            let r = engine.reboot(&ws, &req)?;
            for h in &r.skipped {
                eprintln!("reboot: skipped unknown host {h}");
            }
            report("reboot", &r.failures)
        }
        Command::Pingwait { hosts } => {
            for host in &hosts {
                pingwait(&engine, &ws, host, &log).await?;
                println!("{host}: up");
            }
            true
        }
        Command::Wipe { hosts } => {
            let mut clean = true;
            for host in &hosts {
                if let Err(e) = engine.wipe(&ws, host) {
                    eprintln!("wipe {host}: {e}");
                    clean = false;
                }
            }
            clean
        }
    };
    Ok(clean)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = build_logger(opt.log_level);
    if !run(opt, log).await? {
        std::process::exit(1);
    }
    Ok(())
}
