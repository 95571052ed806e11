//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/opt/otel-extension.toml` (optional, path overridable
//!    with `LAMBDA_OTEL_CONFIG_FILE`)
//! 3. Standard Lambda and collector environment variables
//! 4. Extension-specific environment variables (`LAMBDA_OTEL_*`)
//!
//! # Supported Standard Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `AWS_LAMBDA_RUNTIME_API` | `extension.runtime_api` | Runtime API `host:port` |
//! | `OPENTELEMETRY_COLLECTOR_CONFIG_URI` | `collector.config_uri` | Collector config location |
//! | `OPENTELEMETRY_EXTENSION_LOG_LEVEL` | `log_level` | Extension log level |
//!
//! Extension-specific variables use `__` to separate nested keys, for
//! example `LAMBDA_OTEL_SHUTDOWN__MAX_GRACE=1500`.
//!
//! The collector's environment is resolved separately by [`CollectorEnv`],
//! which also translates deprecated variable names.

use crate::supervisor::CollectorCommand;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/opt/otel-extension.toml";
const CONFIG_PATH_ENV: &str = "LAMBDA_OTEL_CONFIG_FILE";
const ENV_PREFIX: &str = "LAMBDA_OTEL_";

/// Default location of the collector executable inside a layer.
pub const DEFAULT_COLLECTOR_PATH: &str = "/opt/collector/otelcol";
/// Default collector configuration location.
pub const DEFAULT_COLLECTOR_CONFIG_URI: &str = "/opt/collector-config/config.yaml";
/// Name used when the executable name cannot be determined.
pub const FALLBACK_EXTENSION_NAME: &str = "collector";

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extensions API settings.
    pub extension: ExtensionConfig,
    /// Collector subprocess settings.
    pub collector: CollectorConfig,
    /// Shutdown grace period bounds.
    pub shutdown: ShutdownConfig,
    /// Log level override, as an `EnvFilter` directive.
    pub log_level: Option<String>,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// The config file defaults to `/opt/otel-extension.toml` and may be
    /// moved with `LAMBDA_OTEL_CONFIG_FILE`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from_path(path)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        Self::figment(config_path, |key| std::env::var(key).ok()).extract()
    }

    fn figment<P, F>(config_path: P, lookup: F) -> Figment
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment
            .merge(standard_env(lookup))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Creates a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Name to register with, defaulting to the executable's file name.
    ///
    /// Lambda rejects registrations whose name does not match the file
    /// name under `/opt/extensions`.
    pub fn extension_name(&self) -> String {
        self.extension
            .name
            .clone()
            .or_else(executable_name)
            .unwrap_or_else(|| FALLBACK_EXTENSION_NAME.to_string())
    }
}

fn executable_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    exe.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

/// Extensions API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Name to register under. Defaults to the executable name.
    pub name: Option<String>,
    /// Runtime API address, normally from `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Timeout for registration and error reports in milliseconds.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            name: None,
            runtime_api: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Collector subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Path to the collector executable.
    pub path: PathBuf,
    /// Collector configuration URI, passed as `--config`.
    pub config_uri: Option<String>,
    /// Extra arguments appended after `--config`.
    pub args: Vec<String>,
    /// Environment variables set on the collector in addition to the
    /// inherited environment.
    pub env: HashMap<String, String>,
    /// Whether the collector shares this process's stdout and stderr.
    pub inherit_stdio: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_COLLECTOR_PATH),
            config_uri: Some(DEFAULT_COLLECTOR_CONFIG_URI.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            inherit_stdio: true,
        }
    }
}

impl CollectorConfig {
    /// Builds the launch command, applying the resolved environment.
    pub fn command(&self, env: &CollectorEnv) -> CollectorCommand {
        let mut command = CollectorCommand::new(&self.path).inherit_stdio(self.inherit_stdio);

        if let Some(uri) = &self.config_uri {
            command = command.arg("--config").arg(uri);
        }

        command.args(self.args.iter().cloned()).envs(env.vars.clone())
    }
}

/// Bounds applied to the shutdown grace period.
///
/// The grace period is taken from the SHUTDOWN event's deadline and clamped
/// into `[min_grace, max_grace]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Minimum grace period in milliseconds.
    #[serde(with = "duration_ms")]
    pub min_grace: Duration,
    /// Maximum grace period in milliseconds.
    #[serde(with = "duration_ms")]
    pub max_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            min_grace: Duration::from_millis(100),
            max_grace: Duration::from_millis(2000),
        }
    }
}

/// A deprecated environment variable and the name that replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deprecation {
    /// The legacy variable name.
    pub deprecated: &'static str,
    /// The variable the value is copied to.
    pub replacement: &'static str,
    /// Guidance logged alongside the warning.
    pub note: &'static str,
}

/// Deprecated collector variables that are still honoured.
pub const DEPRECATED_ENV_VARS: &[Deprecation] = &[Deprecation {
    deprecated: "SUMOLOGIC_HTTP_TRACES_ENDPOINT_URL",
    replacement: "SUMO_OTLP_HTTP_ENDPOINT_URL",
    note: "see https://help.sumologic.com/docs/send-data/hosted-collectors/http-source/otlp/",
}];

/// Environment overrides for the collector subprocess.
///
/// The collector inherits this process's environment; `vars` holds only
/// the values set on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorEnv {
    /// Variables to set on the collector.
    pub vars: HashMap<String, String>,
    /// Deprecated variables found in the environment.
    pub deprecations: Vec<Deprecation>,
}

impl CollectorEnv {
    /// Resolves overrides from this process's environment.
    pub fn from_process(overrides: &HashMap<String, String>) -> Self {
        Self::resolve(std::env::vars(), overrides)
    }

    /// Resolves overrides from an explicit environment.
    ///
    /// Configured overrides are applied first. A deprecated variable that is
    /// present then replaces its successor, matching the behaviour of
    /// earlier releases.
    pub fn resolve<I>(environment: I, overrides: &HashMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let environment: HashMap<String, String> = environment.into_iter().collect();
        let mut resolved = Self {
            vars: overrides.clone(),
            deprecations: Vec::new(),
        };

        for deprecation in DEPRECATED_ENV_VARS {
            if let Some(value) = environment.get(deprecation.deprecated) {
                resolved
                    .vars
                    .insert(deprecation.replacement.to_string(), value.clone());
                resolved.deprecations.push(*deprecation);
            }
        }

        resolved
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the extension name.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension.name = Some(name.into());
        self
    }

    /// Sets the runtime API address.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.extension.runtime_api = Some(address.into());
        self
    }

    /// Sets the collector executable.
    pub fn collector_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.collector.path = path.into();
        self
    }

    /// Sets the collector configuration URI.
    pub fn collector_config_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.collector.config_uri = Some(uri.into());
        self
    }

    /// Adds an environment variable for the collector.
    pub fn collector_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.collector.env.insert(key.into(), value.into());
        self
    }

    /// Sets the grace period bounds.
    pub fn grace_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.config.shutdown.min_grace = min;
        self.config.shutdown.max_grace = max;
        self
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = Some(level.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialExtensionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct PartialCollectorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    config_uri: Option<String>,
}

/// Partial config for standard env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "is_partial_extension_empty")]
    extension: PartialExtensionConfig,
    #[serde(skip_serializing_if = "is_partial_collector_empty")]
    collector: PartialCollectorConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

fn is_partial_extension_empty(config: &PartialExtensionConfig) -> bool {
    config.runtime_api.is_none()
}

fn is_partial_collector_empty(config: &PartialCollectorConfig) -> bool {
    config.config_uri.is_none()
}

fn standard_env<F>(lookup: F) -> Serialized<PartialConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let config = PartialConfig {
        extension: PartialExtensionConfig {
            runtime_api: non_empty("AWS_LAMBDA_RUNTIME_API"),
        },
        collector: PartialCollectorConfig {
            config_uri: non_empty("OPENTELEMETRY_COLLECTOR_CONFIG_URI"),
        },
        log_level: non_empty("OPENTELEMETRY_EXTENSION_LOG_LEVEL"),
    };

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
