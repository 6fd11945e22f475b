//! Configuration loading and typed config structures for the SPM federate.
//!
//! The configuration lives in `spm-config.yaml`. This module defines
//! strongly-typed structs that mirror the YAML structure, a loader that
//! reads the file, and validation of the values the tick loop depends on.
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dispatch::DispatchMode;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of its permitted range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level federate configuration.
///
/// Mirrors the structure of `spm-config.yaml`. Values are fixed at process
/// start and never change during a run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FederationConfig {
    /// Run shape: federate count, duration, step width, dispatch mode.
    #[serde(default)]
    pub federation: RunConfig,

    /// Bus connection and subject naming.
    #[serde(default)]
    pub bus: BusConfig,

    /// Parameters of the built-in controllers.
    #[serde(default)]
    pub controllers: ControllerConfig,

    /// Result sink settings.
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FederationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `NATS_URL` overrides `bus.nats_url`
    /// - `SPM_FEDERATE_COUNT` overrides `federation.federate_count`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, applying env overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected values with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `SPM_FEDERATE_COUNT` is not a
    /// number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("NATS_URL") {
            self.bus.nats_url = val;
        }
        if let Ok(val) = std::env::var("SPM_FEDERATE_COUNT") {
            self.federation.federate_count =
                val.trim().parse().map_err(|e| ConfigError::Invalid {
                    reason: format!("SPM_FEDERATE_COUNT is not a number: {e}"),
                })?;
        }
        Ok(())
    }

    /// Check the values the tick loop relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.federation;
        if run.federate_count == 0 {
            return Err(invalid("federation.federate_count must be at least 1"));
        }
        if run.step_secs == 0 {
            return Err(invalid("federation.step_secs must be at least 1"));
        }
        if run.simulated_duration_secs < run.step_secs {
            return Err(invalid(
                "federation.simulated_duration_secs must be at least one step",
            ));
        }
        if !(self.controllers.depot_capacity_kw.is_finite()
            && self.controllers.depot_capacity_kw > 0.0)
        {
            return Err(invalid("controllers.depot_capacity_kw must be positive"));
        }
        if !(self.controllers.default_max_power_kw.is_finite()
            && self.controllers.default_max_power_kw >= 0.0)
        {
            return Err(invalid(
                "controllers.default_max_power_kw must be zero or positive",
            ));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_owned(),
    }
}

/// Shape of one run, shared by every federate in the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunConfig {
    /// Number of sibling federates launched by the process.
    #[serde(default = "default_federate_count")]
    pub federate_count: u32,

    /// Length of the simulated timeline in seconds.
    #[serde(default = "default_simulated_duration_secs")]
    pub simulated_duration_secs: u64,

    /// Width of one tick in simulated seconds.
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,

    /// How site controllers are executed within a tick.
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    /// Time requests allowed per handshake before the federate gives up
    /// (0 = retry forever).
    #[serde(default = "default_max_grant_attempts")]
    pub max_grant_attempts: u32,

    /// Simulated seconds between progress log lines.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            federate_count: default_federate_count(),
            simulated_duration_secs: default_simulated_duration_secs(),
            step_secs: default_step_secs(),
            dispatch_mode: DispatchMode::default(),
            max_grant_attempts: default_max_grant_attempts(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

/// Bus connection settings and subject naming.
///
/// Subjects are derived per federate index `N`:
/// - inbound events: `{upstream_prefix}{N}.{upstream_publication}`
/// - outbound commands: `{federate_prefix}{N}.{federate_publication}`
/// - time requests: `{federate_prefix}{N}.TIME_REQUEST`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BusConfig {
    /// NATS messaging URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Name prefix of the upstream simulator's federates.
    #[serde(default = "default_upstream_prefix")]
    pub upstream_prefix: String,

    /// Publication carrying charging events.
    #[serde(default = "default_upstream_publication")]
    pub upstream_publication: String,

    /// Name prefix of this process's federates.
    #[serde(default = "default_federate_prefix")]
    pub federate_prefix: String,

    /// Publication carrying power commands.
    #[serde(default = "default_federate_publication")]
    pub federate_publication: String,

    /// How long a tick waits for its inbound message before treating it as
    /// empty (milliseconds).
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

impl BusConfig {
    /// Federate name for index `n`, e.g. `SPM_FED0`.
    pub fn federate_name(&self, n: u32) -> String {
        format!("{}{n}", self.federate_prefix)
    }

    /// Subject the upstream simulator publishes events on for federate `n`.
    pub fn inbound_subject(&self, n: u32) -> String {
        format!("{}{n}.{}", self.upstream_prefix, self.upstream_publication)
    }

    /// Subject federate `n` publishes commands on.
    pub fn outbound_subject(&self, n: u32) -> String {
        format!("{}.{}", self.federate_name(n), self.federate_publication)
    }

    /// Subject federate `n` sends time requests to.
    pub fn time_subject(&self, n: u32) -> String {
        format!("{}.TIME_REQUEST", self.federate_name(n))
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            upstream_prefix: default_upstream_prefix(),
            upstream_publication: default_upstream_publication(),
            federate_prefix: default_federate_prefix(),
            federate_publication: default_federate_publication(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

/// Parameters of the built-in site controllers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Total power available at a ride-hail depot (kW).
    #[serde(default = "default_depot_capacity_kw")]
    pub depot_capacity_kw: f64,

    /// Per-vehicle limit used when an event does not carry `maxPowerInKW`.
    #[serde(default = "default_max_power_kw")]
    pub default_max_power_kw: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            depot_capacity_kw: default_depot_capacity_kw(),
            default_max_power_kw: default_max_power_kw(),
        }
    }
}

/// Result sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputConfig {
    /// Whether published batches are also appended to CSV.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory the CSV files are written to.
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,

    /// File name prefix; federate `N` writes `{prefix}.{N}.csv`.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl OutputConfig {
    /// CSV path for federate `n`.
    pub fn path_for(&self, n: u32) -> PathBuf {
        self.directory.join(format!("{}.{n}.csv", self.file_prefix))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_output_directory(),
            file_prefix: default_file_prefix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

const fn default_federate_count() -> u32 {
    1
}

const fn default_simulated_duration_secs() -> u64 {
    // 60 simulated hours.
    216_000
}

pub(crate) const fn default_step_secs() -> u64 {
    60
}

const fn default_max_grant_attempts() -> u32 {
    1000
}

const fn default_progress_interval_secs() -> u64 {
    1800
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_owned()
}

fn default_upstream_prefix() -> String {
    "BEAM_FED".to_owned()
}

fn default_upstream_publication() -> String {
    "CHARGING_VEHICLES".to_owned()
}

fn default_federate_prefix() -> String {
    "SPM_FED".to_owned()
}

fn default_federate_publication() -> String {
    "CHARGING_COMMANDS".to_owned()
}

const fn default_receive_timeout_ms() -> u64 {
    1000
}

const fn default_depot_capacity_kw() -> f64 {
    1000.0
}

const fn default_max_power_kw() -> f64 {
    7.2
}

fn default_output_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "out".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = FederationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.federation.federate_count, 1);
        assert_eq!(config.federation.step_secs, 60);
        assert_eq!(config.federation.simulated_duration_secs, 60 * 3600);
        assert_eq!(config.federation.dispatch_mode, DispatchMode::Sequential);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped: FederationConfig =
            serde_yml::from_str(include_str!("../../../spm-config.yaml")).unwrap();
        assert!(shipped.validate().is_ok());
        assert_eq!(shipped, FederationConfig::default());
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
federation:
  federate_count: 4
  simulated_duration_secs: 7200
  step_secs: 30
  dispatch_mode: concurrent
  max_grant_attempts: 5
  progress_interval_secs: 600

bus:
  upstream_prefix: "UP_"
  upstream_publication: "EVENTS"
  federate_prefix: "CTRL_"
  federate_publication: "COMMANDS"
  receive_timeout_ms: 250

controllers:
  depot_capacity_kw: 350.0
  default_max_power_kw: 11.0

output:
  enabled: false
  directory: "/tmp/spm"
  file_prefix: "commands"

logging:
  level: "debug"
  format: json
"#;
        let config = FederationConfig::parse(yaml).unwrap();
        assert_eq!(config.federation.step_secs, 30);
        assert_eq!(config.federation.dispatch_mode, DispatchMode::Concurrent);
        assert_eq!(config.federation.max_grant_attempts, 5);
        assert_eq!(config.bus.receive_timeout_ms, 250);
        assert!(!config.output.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.bus.inbound_subject(2), "UP_2.EVENTS");
        assert_eq!(config.bus.outbound_subject(2), "CTRL_2.COMMANDS");
        assert_eq!(config.bus.time_subject(0), "CTRL_0.TIME_REQUEST");
        assert_eq!(
            config.output.path_for(3),
            PathBuf::from("/tmp/spm/commands.3.csv")
        );
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = FederationConfig::parse("federation:\n  step_secs: 15\n").unwrap();
        assert_eq!(config.federation.step_secs, 15);
        assert_eq!(config.bus.upstream_prefix, "BEAM_FED");
        assert_eq!(config.bus.inbound_subject(0), "BEAM_FED0.CHARGING_VEHICLES");
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(FederationConfig::parse("").is_ok());
    }

    #[test]
    fn zero_step_is_rejected() {
        let result = FederationConfig::parse("federation:\n  step_secs: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn duration_shorter_than_step_is_rejected() {
        let yaml = "federation:\n  step_secs: 60\n  simulated_duration_secs: 30\n";
        assert!(matches!(
            FederationConfig::parse(yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn non_positive_depot_capacity_is_rejected() {
        let yaml = "controllers:\n  depot_capacity_kw: 0.0\n";
        assert!(matches!(
            FederationConfig::parse(yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let result = FederationConfig::parse("federation: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }
}
