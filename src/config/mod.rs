//! Metrics configuration.
//!
//! `MetricsOptions` can be built in code or loaded from YAML files and
//! environment variables.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "messaging-metrics.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESSAGING_METRICS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESSAGING_METRICS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MESSAGING_METRICS_LOG";

/// Errors loading configuration.
pub type ConfigError = ::config::ConfigError;

/// What the metrics extension records and how it labels it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    /// Record per-message-type metrics in addition to transport metrics.
    pub message_metrics: bool,
    /// Instance label to use instead of the bus name.
    pub instance_name: Option<String>,
    /// Count incoming messages without a `msg-id` header as errored.
    pub count_unidentified_as_error: bool,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            message_metrics: false,
            instance_name: None,
            count_unidentified_as_error: true,
        }
    }
}

impl MetricsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_metrics(mut self, enabled: bool) -> Self {
        self.message_metrics = enabled;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn with_count_unidentified_as_error(mut self, enabled: bool) -> Self {
        self.count_unidentified_as_error = enabled;
        self
    }

    /// Load options from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `messaging-metrics.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `MESSAGING_METRICS__MESSAGE_METRICS=true`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
