//! Configuration loading and validation.

use std::net::{AddrParseError, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use rampart_core::admission::AdmissionConfig;
use rampart_core::balancer::Policy;

/// A fatal configuration problem. These abort startup; nothing here is
/// recoverable at request time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A backend entry is not a parseable socket address.
    #[error("invalid backend address `{addr}`: {source}")]
    InvalidBackend {
        /// The offending entry as written in the config.
        addr: String,
        /// The underlying parse failure.
        source: AddrParseError,
    },
    /// The backend list is empty.
    #[error("no backends configured")]
    NoBackends,
    /// The policy name is not one of the supported ones.
    #[error(transparent)]
    UnknownPolicy(#[from] rampart_core::error::InvalidPolicy),
    /// An admission duration that must be positive is zero.
    #[error("admission `{field}` must be non-zero")]
    ZeroDuration {
        /// The offending field name.
        field: &'static str,
    },
}

/// Top-level gateway configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the gateway listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Upstream backend addresses, in registration order.
    pub backends: Vec<String>,
    /// Selection policy: `round-robin` or `least-connections`.
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Sticky-session table capacity.
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    /// Admission-control tuning.
    #[serde(default)]
    pub admission: AdmissionSection,
}

/// The `[admission]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSection {
    /// Requests allowed per client IP within the tracking window.
    pub rate_limit: usize,
    /// Sliding-window length in seconds.
    pub tracking_secs: u64,
    /// Brown-list block duration in seconds.
    pub brownlist_secs: u64,
    /// Capacity of each block/unblock signal channel.
    pub signal_capacity: usize,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            rate_limit: 20,
            tracking_secs: 20,
            brownlist_secs: 25,
            signal_capacity: 64,
        }
    }
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_policy() -> String {
    "round-robin".to_string()
}

fn default_session_capacity() -> usize {
    4096
}

impl Config {
    /// Load and parse configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Parse the configured backend addresses, rejecting malformed entries.
    pub fn backend_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        self.backends
            .iter()
            .map(|addr| {
                addr.parse().map_err(|source| ConfigError::InvalidBackend {
                    addr: addr.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Resolve the configured selection policy.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        Ok(self.policy.parse()?)
    }

    /// Assemble the admission-control parameters, rejecting zero durations.
    ///
    /// A zero window or block duration would only surface later as a panic
    /// inside a background timer, so it is refused here at startup instead.
    pub fn admission_config(&self) -> Result<AdmissionConfig, ConfigError> {
        if self.admission.tracking_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "tracking_secs",
            });
        }
        if self.admission.brownlist_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "brownlist_secs",
            });
        }
        Ok(AdmissionConfig {
            rate_limit: self.admission.rate_limit,
            tracking_window: Duration::from_secs(self.admission.tracking_secs),
            brownlist_duration: Duration::from_secs(self.admission.brownlist_secs),
            signal_capacity: self.admission.signal_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            listen = "127.0.0.1:8080"
            backends = ["127.0.0.1:9001", "127.0.0.1:9002"]
            policy = "least-connections"
            session_capacity = 128

            [admission]
            rate_limit = 10
            tracking_secs = 30
            brownlist_secs = 60
            signal_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.backend_addrs().unwrap().len(), 2);
        assert_eq!(config.policy().unwrap(), Policy::LeastConnections);
        let admission = config.admission_config().unwrap();
        assert_eq!(admission.rate_limit, 10);
        assert_eq!(admission.tracking_window, Duration::from_secs(30));
        assert_eq!(admission.brownlist_duration, Duration::from_secs(60));
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let config: Config = toml::from_str(r#"backends = ["127.0.0.1:9001"]"#).unwrap();

        assert_eq!(config.listen, default_listen());
        assert_eq!(config.policy().unwrap(), Policy::RoundRobin);
        assert_eq!(config.session_capacity, 4096);
        assert_eq!(config.admission.rate_limit, 20);
        assert_eq!(config.admission.tracking_secs, 20);
        assert_eq!(config.admission.brownlist_secs, 25);
    }

    #[test]
    fn malformed_backend_address_is_fatal() {
        let config: Config = toml::from_str(r#"backends = ["not-an-address"]"#).unwrap();
        assert!(matches!(
            config.backend_addrs(),
            Err(ConfigError::InvalidBackend { .. })
        ));
    }

    #[test]
    fn empty_backend_list_is_fatal() {
        let config: Config = toml::from_str("backends = []").unwrap();
        assert!(matches!(config.backend_addrs(), Err(ConfigError::NoBackends)));
    }

    #[test]
    fn unknown_policy_is_fatal() {
        let config: Config = toml::from_str(
            r#"
            backends = ["127.0.0.1:9001"]
            policy = "fastest"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.policy(),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn zero_admission_durations_are_fatal() {
        let config: Config = toml::from_str(
            r#"
            backends = ["127.0.0.1:9001"]

            [admission]
            tracking_secs = 0
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.admission_config(),
            Err(ConfigError::ZeroDuration {
                field: "tracking_secs"
            })
        ));

        let config: Config = toml::from_str(
            r#"
            backends = ["127.0.0.1:9001"]

            [admission]
            brownlist_secs = 0
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.admission_config(),
            Err(ConfigError::ZeroDuration {
                field: "brownlist_secs"
            })
        ));
    }
}
