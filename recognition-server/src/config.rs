use common::{Resolution, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    /// Advertised upper bound for client frame rates
    pub max_fps: u32,
    pub default_fps: u32,
    pub supported_formats: Vec<String>,
    pub max_resolution: Resolution,
    /// Confidence at or above which a frame counts as recognized
    pub match_threshold: f64,
    /// First entry is the provider in use at startup
    pub providers: Vec<String>,
    /// Simulated processing time, picked uniformly per frame
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl ServerSettings {
    pub fn load() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8443)), // QUIC端口
            max_fps: 10,
            default_fps: 5,
            supported_formats: vec!["image/jpeg".to_string(), "image/png".to_string()],
            max_resolution: Resolution::new(1280, 720),
            match_threshold: 0.5,
            providers: vec!["SimulatedFaceMatch".to_string(), "SimulatedFallback".to_string()],
            min_latency: Duration::from_millis(30),
            max_latency: Duration::from_millis(120),
        }
    }

    /// Loopback, ephemeral port, no artificial latency.
    pub fn local() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            ..Self::load()
        }
    }

    pub fn default_provider(&self) -> &str {
        self.providers
            .first()
            .map(String::as_str)
            .unwrap_or("SimulatedFaceMatch")
    }

    pub fn supports_provider(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }

    /// The `config` event sent to clients.
    pub fn client_config(&self, provider: &str) -> ServerConfig {
        ServerConfig {
            provider: provider.to_string(),
            max_fps: self.max_fps.max(1),
            supported_formats: self.supported_formats.clone(),
            max_resolution: self.max_resolution,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_reflects_settings() {
        let settings = ServerSettings::load();
        let config = settings.client_config(settings.default_provider());
        assert_eq!(config.provider, "SimulatedFaceMatch");
        assert_eq!(config.max_fps, 10);
        assert!(config.supported_formats.iter().any(|f| f == "image/png"));
        assert_eq!(config.max_resolution, Resolution::new(1280, 720));
    }

    #[test]
    fn test_local_settings_are_instant() {
        let settings = ServerSettings::local();
        assert_eq!(settings.bind.port(), 0);
        assert!(settings.max_latency.is_zero());
        assert!(settings.supports_provider("SimulatedFallback"));
        assert!(!settings.supports_provider("Nope"));
    }
}
