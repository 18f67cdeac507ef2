// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting out unavailable local endpoints.
//!
//! The virtualization endpoint and the state store are local daemons. When
//! one is down, operations block here until it comes back; there is no
//! timeout.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{warn, Logger};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from(&rvn_config_toml::Liveness::default())
    }
}

impl From<&rvn_config_toml::Liveness> for LivenessPolicy {
    fn from(cfg: &rvn_config_toml::Liveness) -> Self {
        Self {
            initial_interval: cfg.initial_interval(),
            max_interval: cfg.max_interval(),
        }
    }
}

impl LivenessPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Calls `attempt` until it succeeds, sleeping with exponential backoff
    /// between attempts.
    pub fn wait_until<T, E: std::fmt::Display>(
        &self,
        log: &Logger,
        what: &str,
        mut attempt: impl FnMut() -> Result<T, E>,
    ) -> T {
        let mut backoff = self.backoff();
        loop {
            match attempt() {
                Ok(v) => return v,
                Err(e) => {
                    let delay =
                        backoff.next_backoff().unwrap_or(self.max_interval);
                    warn!(log, "{} unavailable, retrying", what;
                        "error" => %e,
                        "retry_in" => ?delay,
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retries_until_available() {
        let log = Logger::root(slog::Discard, slog::o!());
        let policy = LivenessPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
        };
        let mut attempts = 0;
        let got = policy.wait_until(&log, "endpoint", || {
            attempts += 1;
            if attempts < 5 {
                Err("down")
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(got, 5);
    }

    #[test]
    fn backoff_never_gives_up() {
        let policy = LivenessPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        };
        let mut b = policy.backoff();
        for _ in 0..1000 {
            let next = b.next_backoff().unwrap();
            // Randomization may stretch the interval by up to 50%.
            assert!(next <= Duration::from_millis(3));
        }
    }
}
