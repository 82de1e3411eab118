use crate::transport::BrokerEndpoint;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "SYNTISED";
pub const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReplayConfig {
    #[serde(default)]
    pub csv: CsvConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub replay: ReplayOptions,
    #[serde(default)]
    pub thing_model: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Flat `COLUMN_<n>_<FIELD>` overrides; merged with the process environment.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    #[serde(default)]
    pub file: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
    #[serde(default)]
    pub ignore_columns: Vec<String>,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::new(),
            delimiter: default_delimiter(),
            timestamp_column: default_timestamp_column(),
            timestamp_format: TimestampFormat::default(),
            ignore_columns: Vec::new(),
        }
    }
}

impl CsvConfig {
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }

    /// True for every column that carries telemetry: not the timestamp, not ignored.
    pub fn is_data_column(&self, name: &str) -> bool {
        name != self.timestamp_column && !self.ignore_columns.iter().any(|ignored| ignored == name)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampFormat {
    #[default]
    Iso,
    #[serde(alias = "unix", alias = "unix_ms", alias = "epoch-ms")]
    UnixMs,
}

impl TimestampFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampFormat::Iso => "iso",
            TimestampFormat::UnixMs => "unix-ms",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub tls: Option<MqttTlsConfig>,
}

impl MqttConfig {
    /// Salt mixed into derived identities: the broker principal, or empty.
    pub fn identity_salt(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttTlsConfig {
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayOptions {
    #[serde(default = "default_true")]
    pub realtime: bool,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub late_rows: LateRowPolicy,
    #[serde(default)]
    pub non_numeric: NonNumericPolicy,
    #[serde(default)]
    pub clock: ClockZone,
    #[serde(default)]
    pub repeat: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            late_rows: LateRowPolicy::default(),
            non_numeric: NonNumericPolicy::default(),
            clock: ClockZone::default(),
            repeat: false,
        }
    }
}

/// What to do with a row whose time-of-day has already passed today.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LateRowPolicy {
    #[default]
    Skip,
    CatchUp,
}

/// How telemetry treats cell values that are not finite numbers.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NonNumericPolicy {
    #[default]
    Drop,
    Null,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClockZone {
    #[default]
    Local,
    Utc,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("`{key}` is required")]
    Missing { key: &'static str },
    #[error("`{key}` is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

const fn default_qos() -> u8 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}

impl ReplayConfig {
    /// Loads `config/local.*`, then `path` (if any), then `SYNTISED_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("csv.ignore_columns")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Checks everything the `columns` command needs: the CSV side only.
    pub fn validate_source(&self) -> Result<(), ConfigurationError> {
        if self.csv.file.as_os_str().is_empty() {
            return Err(ConfigurationError::Missing { key: "csv.file" });
        }

        if self.csv.timestamp_column.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "csv.timestamp_column",
            });
        }

        if self.csv.delimiter.len() != 1 || !self.csv.delimiter.is_ascii() {
            return Err(ConfigurationError::Invalid {
                key: "csv.delimiter",
                reason: format!(
                    "expected a single ASCII character, got `{}`",
                    self.csv.delimiter
                ),
            });
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.validate_source()?;

        if self.mqtt.url.trim().is_empty() {
            return Err(ConfigurationError::Missing { key: "mqtt.url" });
        }

        BrokerEndpoint::parse(&self.mqtt.url).map_err(|err| ConfigurationError::Invalid {
            key: "mqtt.url",
            reason: err.to_string(),
        })?;

        if self.mqtt.qos > 2 {
            return Err(ConfigurationError::Invalid {
                key: "mqtt.qos",
                reason: format!("expected 0, 1 or 2, got {}", self.mqtt.qos),
            });
        }

        if self.replay.max_wait_ms == 0 {
            return Err(ConfigurationError::Invalid {
                key: "replay.max_wait_ms",
                reason: "must be a positive number of milliseconds".to_string(),
            });
        }

        Ok(())
    }
}
