//! Configuration loading shared by all RSM services
//!
//! One TOML file (`rsm.toml`) configures every process. Resolution order for
//! the file itself:
//! 1. Command-line `--config` argument (highest priority)
//! 2. `RSM_CONFIG` environment variable
//! 3. `~/.config/rsm/rsm.toml`
//! 4. `/etc/rsm/rsm.toml`
//!
//! A missing file is not fatal: compiled defaults are used and a warning is
//! logged by `Config::log_source` once the service has installed its logger. Secrets may come from the environment (a `.env` file in the working
//! directory is honoured) and override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RSM_CONFIG";
/// Broker password override
pub const BROKER_PASSWORD_ENV_VAR: &str = "RSM_BROKER_PASSWORD";
/// Legacy broker password variable used by the first deployment's `.env`
pub const LEGACY_BROKER_PASSWORD_ENV_VAR: &str = "MQTT_PASSWORD";
/// Store password override
pub const STORE_PASSWORD_ENV_VAR: &str = "RSM_STORE_PASSWORD";

/// Complete configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Team name; namespaces the topic, credentials and database
    pub team: String,
    /// Identifies this edge device in payloads (defaults to host name)
    pub device_id: Option<String>,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub edge: EdgeConfig,
    pub ingest: IngestConfig,
    pub enrichment: EnrichmentConfig,
    pub logging: LoggingConfig,
    /// Where this configuration was read from
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Origin of a loaded configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    #[default]
    Defaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            team: "team14".to_string(),
            device_id: None,
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            edge: EdgeConfig::default(),
            ingest: IngestConfig::default(),
            enrichment: EnrichmentConfig::default(),
            logging: LoggingConfig::default(),
            source: ConfigSource::Defaults,
        }
    }
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to the team name
    pub username: Option<String>,
    pub password: Option<String>,
    /// Defaults to `iot/<team>/sensor`
    pub topic: Option<String>,
    pub keep_alive_secs: u64,
    /// Largest packet accepted or sent; a base64 clip is several hundred KB
    pub max_packet_bytes: usize,
    /// How long a publisher waits for the broker's PUBACK
    pub ack_timeout_secs: u64,
    /// How long startup waits for the first CONNACK
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic: None,
            keep_alive_secs: 30,
            max_packet_bytes: 2 * 1024 * 1024,
            ack_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

/// InfluxDB (1.x HTTP API) connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    /// Defaults to `<team>_db`
    pub database: Option<String>,
    pub measurement: String,
    /// Defaults to the team name
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            database: None,
            measurement: "room_sensors_raw".to_string(),
            username: None,
            password: None,
            request_timeout_secs: 30,
        }
    }
}

/// Edge publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub publish_interval_secs: u64,
    pub i2c_bus: PathBuf,
    pub sensor_address: u16,
    /// Input device name; `None` uses the system default
    pub audio_device: Option<String>,
    pub capture_secs: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub recordings_dir: PathBuf,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 20,
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            sensor_address: 0x38,
            audio_device: None,
            capture_secs: 4,
            sample_rate: 44_100,
            channels: 1,
            recordings_dir: PathBuf::from("recordings"),
        }
    }
}

/// Ingest subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub receive_dir: PathBuf,
    pub playback: bool,
    /// Output device name for playback; `None` uses the system default
    pub playback_device: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            receive_dir: PathBuf::from("received"),
            playback: true,
            playback_device: None,
        }
    }
}

/// Enrichment poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Sleep when a poll finds nothing new
    pub idle_sleep_ms: u64,
    /// Sleep after a processed batch
    pub batch_sleep_ms: u64,
    /// Most records fetched per poll; each carries a full audio clip
    pub batch_size: usize,
    pub audio_dir: PathBuf,
    /// External scorer; the clip path is appended as the last argument
    pub classifier_command: Vec<String>,
    pub confidence_threshold: f64,
    /// SQLite file holding the watermark across restarts
    pub checkpoint_path: Option<PathBuf>,
    /// JSON-lines file receiving every enriched result
    pub results_file: Option<PathBuf>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 2_000,
            batch_sleep_ms: 1_000,
            batch_size: 20,
            audio_dir: PathBuf::from("audio_clips"),
            classifier_command: Vec::new(),
            confidence_threshold: 0.6,
            checkpoint_path: None,
            results_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration for a service
    ///
    /// `cli_path` is the value of the service's `--config` flag, if any. An
    /// explicitly named file must exist; an auto-discovered one may not.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        // .env is optional; absence is the common case
        let _ = dotenvy::dotenv();

        let mut config = match resolve_config_path(cli_path)? {
            Some(path) => {
                let mut config = Self::from_file(&path)?;
                config.source = ConfigSource::File(path);
                config
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{} ({})", e, path.display())))?;
        Ok(config)
    }

    /// Report where the configuration came from
    ///
    /// Loading happens before the logger exists, so services call this
    /// right after `logging::init`.
    pub fn log_source(&self) {
        match &self.source {
            ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
            ConfigSource::Defaults => warn!("No rsm.toml found; using compiled defaults"),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply secrets supplied through the environment
    pub fn apply_env_overrides(&mut self) {
        if let Some(password) = env_non_empty(BROKER_PASSWORD_ENV_VAR)
            .or_else(|| env_non_empty(LEGACY_BROKER_PASSWORD_ENV_VAR))
        {
            self.broker.password = Some(password);
        }
        if let Some(password) = env_non_empty(STORE_PASSWORD_ENV_VAR) {
            self.store.password = Some(password);
        }
    }

    /// Reject settings no service can run with
    pub fn validate(&self) -> Result<()> {
        if self.team.trim().is_empty() {
            return Err(Error::Config("team must not be empty".to_string()));
        }
        if self.topic().trim().is_empty() {
            return Err(Error::Config("broker.topic must not be empty".to_string()));
        }
        if self.edge.publish_interval_secs == 0 {
            return Err(Error::Config(
                "edge.publish_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.edge.capture_secs == 0 || self.edge.sample_rate == 0 || self.edge.channels == 0 {
            return Err(Error::Config(
                "edge capture duration, sample rate and channels must be non-zero".to_string(),
            ));
        }
        if self.enrichment.idle_sleep_ms == 0 {
            return Err(Error::Config(
                "enrichment.idle_sleep_ms must be greater than zero".to_string(),
            ));
        }
        if self.enrichment.batch_size == 0 {
            return Err(Error::Config(
                "enrichment.batch_size must be greater than zero".to_string(),
            ));
        }
        let threshold = self.enrichment.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "enrichment.confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        Ok(())
    }

    /// Sensor topic, `iot/<team>/sensor` unless overridden
    pub fn topic(&self) -> String {
        self.broker
            .topic
            .clone()
            .unwrap_or_else(|| format!("iot/{}/sensor", self.team))
    }

    pub fn broker_username(&self) -> String {
        self.broker.username.clone().unwrap_or_else(|| self.team.clone())
    }

    pub fn store_database(&self) -> String {
        self.store
            .database
            .clone()
            .unwrap_or_else(|| format!("{}_db", self.team))
    }

    pub fn store_username(&self) -> String {
        self.store.username.clone().unwrap_or_else(|| self.team.clone())
    }

    /// Configured device id, else the host name, else `edge`
    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .or_else(|| env_non_empty("HOSTNAME"))
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "edge".to_string())
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl EdgeConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }
}

impl EnrichmentConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn batch_sleep(&self) -> Duration {
        Duration::from_millis(self.batch_sleep_ms)
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Locate the configuration file following the documented priority
pub fn resolve_config_path(cli_path: Option<&Path>) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    // Priority 2: Environment variable
    if let Some(path) = env_non_empty(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(Error::Config(format!(
                "{} points to a missing file: {}",
                CONFIG_ENV_VAR,
                path.display()
            )));
        }
        return Ok(Some(path));
    }

    // Priority 3 and 4: per-user, then system-wide
    let user_config = dirs::config_dir().map(|d| d.join("rsm").join("rsm.toml"));
    let system_config = PathBuf::from("/etc/rsm/rsm.toml");
    Ok(user_config
        .into_iter()
        .chain(std::iter::once(system_config))
        .find(|p| p.exists()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_team() {
        let config = Config::default();
        assert_eq!(config.topic(), "iot/team14/sensor");
        assert_eq!(config.broker_username(), "team14");
        assert_eq!(config.store_database(), "team14_db");
        assert_eq!(config.edge.publish_interval(), Duration::from_secs(20));
        assert_eq!(config.enrichment.idle_sleep(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            team = "team7"

            [broker]
            host = "10.0.0.5"

            [edge]
            publish_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.topic(), "iot/team7/sensor");
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.edge.publish_interval_secs, 5);
        assert_eq!(config.edge.capture_secs, 4);
        assert_eq!(config.store.measurement, "room_sensors_raw");
    }

    #[test]
    fn test_explicit_topic_wins() {
        let mut config = Config::default();
        config.broker.topic = Some("lab/sensor".to_string());
        assert_eq!(config.topic(), "lab/sensor");
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.edge.publish_interval_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = Config::default();
        config.enrichment.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml_str("team = ["),
            Err(Error::Config(_))
        ));
    }
}
