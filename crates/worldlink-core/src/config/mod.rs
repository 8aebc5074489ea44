//! Configuration parsing and management.
//!
//! This module handles parsing of the link configuration file (TOML) that
//! describes where the world simulator lives, how the link reconnects, how
//! long requests may stay outstanding and which trucks are announced on
//! connect.
//!
//! Values can be overridden from the environment with
//! [`LinkConfig::apply_env_overrides`]; command-line flags in the daemon
//! binary take precedence over both.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fleet::{TruckId, TruckSnapshot, default_fleet};
use crate::reconnect::ReconnectPolicy;

/// Environment variable overriding [`SimulatorConfig::host`].
pub const ENV_HOST: &str = "WORLDLINK_HOST";
/// Environment variable overriding [`SimulatorConfig::port`].
pub const ENV_PORT: &str = "WORLDLINK_PORT";
/// Environment variable overriding [`SimulatorConfig::default_sim_speed`].
pub const ENV_SIM_SPEED: &str = "WORLDLINK_SIM_SPEED";
/// Environment variable overriding [`ReconnectPolicy::enabled`].
pub const ENV_RECONNECT_ENABLED: &str = "WORLDLINK_RECONNECT_ENABLED";
/// Environment variable overriding [`ReconnectPolicy::max_attempts`].
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "WORLDLINK_RECONNECT_MAX_ATTEMPTS";

/// Default cap on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Top-level link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Size of the generated fleet when `trucks` is empty.
    #[serde(default = "default_fleet_size")]
    pub default_fleet_size: usize,

    /// Simulator endpoint and transport settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Reconnection behaviour.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Per-request deadlines and housekeeping intervals.
    #[serde(default)]
    pub requests: RequestConfig,

    /// Trucks announced in the connect handshake.
    #[serde(default)]
    pub trucks: Vec<TruckSnapshot>,
}

const fn default_fleet_size() -> usize {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_fleet_size: default_fleet_size(),
            simulator: SimulatorConfig::default(),
            reconnect: ReconnectPolicy::default(),
            requests: RequestConfig::default(),
            trucks: Vec::new(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the parsed values fail
    /// [`LinkConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulator.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "simulator.host must not be empty".to_string(),
            ));
        }
        if self.simulator.port == 0 {
            return Err(ConfigError::Validation(
                "simulator.port must be non-zero".to_string(),
            ));
        }
        if self.simulator.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "simulator.connect_timeout must be non-zero".to_string(),
            ));
        }
        if self.simulator.max_frame_size == 0 {
            return Err(ConfigError::Validation(
                "simulator.max_frame_size must be non-zero".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "reconnect.multiplier must be a finite value >= 1.0, got {}",
                reconnect.multiplier
            )));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(ConfigError::Validation(
                "reconnect.initial_delay must not exceed reconnect.max_delay".to_string(),
            ));
        }
        if reconnect.enabled && reconnect.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "reconnect.max_attempts must be at least 1 when reconnection is enabled"
                    .to_string(),
            ));
        }

        let requests = &self.requests;
        for (name, value) in [
            ("requests.pickup_timeout", requests.pickup_timeout),
            ("requests.deliver_timeout", requests.deliver_timeout),
            ("requests.query_timeout", requests.query_timeout),
            ("requests.sweep_interval", requests.sweep_interval),
            ("requests.health_probe_timeout", requests.health_probe_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for truck in &self.trucks {
            if truck.truck_id < 0 {
                return Err(ConfigError::Validation(format!(
                    "truck id {} must be non-negative",
                    truck.truck_id
                )));
            }
            if !seen.insert(truck.truck_id) {
                return Err(ConfigError::Validation(format!(
                    "truck id {} is listed more than once",
                    truck.truck_id
                )));
            }
        }

        Ok(())
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.simulator.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.simulator.port = parse_override(ENV_PORT, &port)?;
        }
        if let Some(speed) = lookup(ENV_SIM_SPEED) {
            self.simulator.default_sim_speed = Some(parse_override(ENV_SIM_SPEED, &speed)?);
        }
        if let Some(enabled) = lookup(ENV_RECONNECT_ENABLED) {
            self.reconnect.enabled = parse_override(ENV_RECONNECT_ENABLED, &enabled)?;
        }
        if let Some(attempts) = lookup(ENV_RECONNECT_MAX_ATTEMPTS) {
            self.reconnect.max_attempts = parse_override(ENV_RECONNECT_MAX_ATTEMPTS, &attempts)?;
        }
        self.validate()
    }

    /// Returns the trucks announced on the first connect.
    #[must_use]
    pub fn initial_fleet(&self) -> Vec<TruckSnapshot> {
        if self.trucks.is_empty() {
            default_fleet(self.default_fleet_size)
        } else {
            self.trucks.clone()
        }
    }
}

fn parse_override<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Validation(format!("{key}={raw:?} is invalid: {e}")))
}

/// Simulator endpoint and transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Simulator host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Simulator TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bound on opening the socket and on the handshake reply.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Simulation speed set right after connecting. `None` leaves the
    /// simulator's own default in place.
    #[serde(default = "default_sim_speed")]
    pub default_sim_speed: Option<u32>,

    /// Disable Nagle's algorithm on the simulator socket.
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,

    /// Largest frame accepted from the simulator.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    12345
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_sim_speed() -> Option<u32> {
    Some(1000)
}

const fn default_tcp_nodelay() -> bool {
    true
}

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            default_sim_speed: default_sim_speed(),
            tcp_nodelay: default_tcp_nodelay(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl SimulatorConfig {
    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request deadlines and periodic housekeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Deadline for a pickup to be answered.
    #[serde(default = "default_command_timeout")]
    #[serde(with = "humantime_serde")]
    pub pickup_timeout: Duration,

    /// Deadline for a delivery to be answered.
    #[serde(default = "default_command_timeout")]
    #[serde(with = "humantime_serde")]
    pub deliver_timeout: Duration,

    /// Deadline for a truck query to be answered.
    #[serde(default = "default_query_timeout")]
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// How often expired requests are swept.
    #[serde(default = "default_sweep_interval")]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Bound on the health-probe query.
    #[serde(default = "default_health_probe_timeout")]
    #[serde(with = "humantime_serde")]
    pub health_probe_timeout: Duration,

    /// Truck queried by the health probe.
    #[serde(default = "default_health_probe_truck")]
    pub health_probe_truck: TruckId,

    /// How long `disconnect` waits for the disconnect command to flush.
    #[serde(default = "default_disconnect_grace")]
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,
}

const fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_health_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_health_probe_truck() -> TruckId {
    1
}

const fn default_disconnect_grace() -> Duration {
    Duration::from_millis(500)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            pickup_timeout: default_command_timeout(),
            deliver_timeout: default_command_timeout(),
            query_timeout: default_query_timeout(),
            sweep_interval: default_sweep_interval(),
            health_probe_timeout: default_health_probe_timeout(),
            health_probe_truck: default_health_probe_truck(),
            disconnect_grace: default_disconnect_grace(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = LinkConfig::from_toml("").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.simulator.address(), "localhost:12345");
        assert_eq!(config.simulator.default_sim_speed, Some(1000));
        assert_eq!(config.requests.pickup_timeout, Duration::from_secs(30));
        assert_eq!(config.requests.query_timeout, Duration::from_secs(10));
        assert_eq!(config.requests.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            default_fleet_size = 4

            [simulator]
            host = "sim.internal"
            port = 23456
            connect_timeout = "3s"
            default_sim_speed = 250
            tcp_nodelay = false

            [reconnect]
            enabled = true
            initial_delay = "500ms"
            max_delay = "10s"
            multiplier = 3.0
            max_attempts = 5

            [requests]
            pickup_timeout = "45s"
            query_timeout = "2s"
            health_probe_truck = 9

            [[trucks]]
            id = 1
            x = 0
            y = 0

            [[trucks]]
            id = 2
            x = 5
            y = 5
        "#;

        let config = LinkConfig::from_toml(toml).unwrap();
        assert_eq!(config.simulator.host, "sim.internal");
        assert_eq!(config.simulator.port, 23456);
        assert_eq!(config.simulator.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.simulator.default_sim_speed, Some(250));
        assert!(!config.simulator.tcp_nodelay);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert!((config.reconnect.multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.requests.pickup_timeout, Duration::from_secs(45));
        assert_eq!(config.requests.deliver_timeout, Duration::from_secs(30));
        assert_eq!(config.requests.health_probe_truck, 9);
        assert_eq!(
            config.initial_fleet(),
            vec![TruckSnapshot::idle(1, 0, 0), TruckSnapshot::idle(2, 5, 5)]
        );
    }

    #[test]
    fn test_initial_fleet_falls_back_to_default() {
        let config = LinkConfig {
            default_fleet_size: 2,
            ..LinkConfig::default()
        };
        assert_eq!(
            config.initial_fleet(),
            vec![TruckSnapshot::idle(1, 0, 0), TruckSnapshot::idle(2, 0, 0)]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "[simulator]\nport = 0",
            "[simulator]\nhost = \"  \"",
            "[reconnect]\nmultiplier = 0.5",
            "[reconnect]\ninitial_delay = \"1m\"\nmax_delay = \"1s\"",
            "[reconnect]\nmax_attempts = 0",
            "[requests]\nquery_timeout = \"0s\"",
            "[[trucks]]\nid = 1\n[[trucks]]\nid = 1",
            "[[trucks]]\nid = -3",
        ];
        for case in cases {
            let err = LinkConfig::from_toml(case).unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation(_)),
                "expected validation error for {case:?}, got {err}"
            );
        }
    }

    #[test]
    fn test_disabled_reconnect_allows_zero_attempts() {
        let config =
            LinkConfig::from_toml("[reconnect]\nenabled = false\nmax_attempts = 0").unwrap();
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_HOST, "10.0.0.7"),
            (ENV_PORT, "4000"),
            (ENV_SIM_SPEED, "50"),
            (ENV_RECONNECT_ENABLED, "false"),
            (ENV_RECONNECT_MAX_ATTEMPTS, "3"),
        ]
        .into_iter()
        .collect();

        let mut config = LinkConfig::default();
        config
            .apply_env_overrides_with(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.simulator.address(), "10.0.0.7:4000");
        assert_eq!(config.simulator.default_sim_speed, Some(50));
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_env_override_parse_failure() {
        let mut config = LinkConfig::default();
        let err = config
            .apply_env_overrides_with(|key| (key == ENV_PORT).then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn test_round_trip_through_file() {
        let original = LinkConfig {
            trucks: vec![TruckSnapshot::idle(3, 1, 2)],
            ..LinkConfig::default()
        };
        let rendered = original.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let loaded = LinkConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LinkConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
