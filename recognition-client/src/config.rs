use crate::errors::ConfigError;
use crate::link::ConnectOptions;
use crate::pipeline::{ControllerOptions, ResultRouting};
use common::Resolution;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration, stored as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend connection settings
    pub server: ServerSection,

    /// Capture source settings
    pub capture: CaptureSection,

    /// Frame pipeline settings
    pub pipeline: PipelineSection,

    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// `quic://host:port`
    pub url: String,

    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub connect_timeout: Duration,

    /// How long to wait for the backend's config after connecting
    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub handshake_timeout: Duration,

    /// Consecutive transport errors before the link is dropped
    pub max_transport_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub width: u32,
    pub height: u32,

    /// Requested frame rate, clamped to what the backend allows
    pub fps: u32,

    /// Encoder quality in `[0, 1]`
    pub quality: f32,

    /// Delay before the synthetic camera delivers its first frame
    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub warmup: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Outstanding frames older than this are forgotten
    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub result_timeout: Duration,

    /// How often the CLI asks for a stats snapshot
    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub stats_interval: Duration,

    pub routing: ResultRouting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "quic://127.0.0.1:8443".to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_transport_errors: 3,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 5,
            quality: 0.7,
            warmup: Duration::ZERO,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            result_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(2),
            routing: ResultRouting::LatestArrival,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if self.server.url.trim().is_empty() {
            return invalid("server url cannot be empty");
        }
        if self.server.max_transport_errors == 0 {
            return invalid("max_transport_errors must be greater than 0");
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture resolution must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture fps must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.capture.quality) {
            return invalid("capture quality must be between 0 and 1");
        }
        if self.pipeline.result_timeout.is_zero() {
            return invalid("result_timeout must be greater than 0");
        }
        if self.pipeline.stats_interval.is_zero() {
            return invalid("stats_interval must be greater than 0");
        }
        Ok(())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            fps: self.capture.fps,
            quality: self.capture.quality,
            result_timeout: self.pipeline.result_timeout,
            default_resolution: Resolution::new(self.capture.width, self.capture.height),
            routing: self.pipeline.routing,
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.server.connect_timeout,
            handshake_timeout: self.server.handshake_timeout,
            max_transport_errors: self.server.max_transport_errors,
            ..ConnectOptions::default()
        }
    }
}

/// Loads, saves and validates the client configuration file.
pub struct ConfigManager {
    config_path: PathBuf,
    config: ClientConfig,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config: ClientConfig::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Loads the file, writing the defaults first if it does not exist.
    pub async fn load(&mut self) -> Result<(), ConfigError> {
        if !tokio::fs::try_exists(&self.config_path).await? {
            self.save().await?;
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config_path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&self.config)?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&self.config_path, content).await?;
        Ok(())
    }

    pub fn get_config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    pub fn update_config(&mut self, config: ClientConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn into_config(self) -> ClientConfig {
        self.config
    }
}

/// Environment-based configuration override
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub const SERVER_URL: &'static str = "RECOGNITION_SERVER_URL";
    pub const FPS: &'static str = "RECOGNITION_FPS";
    pub const QUALITY: &'static str = "RECOGNITION_QUALITY";
    pub const LOG_LEVEL: &'static str = "RECOGNITION_LOG_LEVEL";

    pub fn apply_overrides(config: &mut ClientConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Same as [`apply_overrides`](Self::apply_overrides) with a custom lookup.
    /// Unparsable values are ignored.
    pub fn apply_from(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(Self::SERVER_URL) {
            config.server.url = url;
        }
        if let Some(fps) = lookup(Self::FPS).and_then(|v| v.parse::<u32>().ok()) {
            config.capture.fps = fps;
        }
        if let Some(quality) = lookup(Self::QUALITY).and_then(|v| v.parse::<f32>().ok()) {
            config.capture.quality = quality;
        }
        if let Some(level) = lookup(Self::LOG_LEVEL) {
            config.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.fps, 5);
        assert_eq!(config.pipeline.result_timeout, Duration::from_secs(5));

        let options = config.controller_options();
        assert_eq!(options.default_resolution, Resolution::new(640, 480));
        assert_eq!(config.connect_options().max_transport_errors, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.capture.quality = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = ClientConfig::default();
        config.capture.fps = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.server.url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [capture]
            fps = 12

            [pipeline]
            result_timeout = 2500
            routing = "latest_dispatch"
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.fps, 12);
        assert_eq!(config.capture.quality, 0.7);
        assert_eq!(config.pipeline.result_timeout, Duration::from_millis(2500));
        assert_eq!(config.pipeline.routing, ResultRouting::LatestDispatch);
        assert_eq!(config.server.url, "quic://127.0.0.1:8443");
    }

    #[tokio::test]
    async fn test_manager_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("client.toml");

        let mut manager = ConfigManager::new(&path);
        manager.load().await.unwrap();
        assert!(path.exists());

        manager.get_config_mut().capture.fps = 9;
        manager.save().await.unwrap();

        let mut reloaded = ConfigManager::new(&path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get_config().capture.fps, 9);
    }

    #[tokio::test]
    async fn test_manager_refuses_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        tokio::fs::write(&path, "[capture]\nquality = 3.0\n").await.unwrap();

        let mut manager = ConfigManager::new(&path);
        assert!(matches!(manager.load().await, Err(ConfigError::Invalid { .. })));
        assert_eq!(manager.get_config().capture.quality, 0.7);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (EnvConfigOverride::SERVER_URL, "quic://10.0.0.2:9443"),
            (EnvConfigOverride::FPS, "15"),
            (EnvConfigOverride::QUALITY, "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        EnvConfigOverride::apply_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.url, "quic://10.0.0.2:9443");
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.capture.quality, 0.7);
        assert_eq!(config.logging.level, "info");
    }
}
