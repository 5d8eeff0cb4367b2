use crate::config::ServerSettings;
use crate::registry::SessionRegistry;
use crate::scorer::{Scorer, SimulatedScorer};
use crate::stats::ServerStats;
use common::{Result, ServerEvent, StatsPayload, StreamError, ALPN_PROTOCOL};
use quinn::Endpoint;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info};

/// 所有连接共享的服务端状态
pub struct BackendState {
    pub settings: ServerSettings,
    pub stats: ServerStats,
    pub registry: SessionRegistry,
    pub scorer: Arc<dyn Scorer>,
    provider: RwLock<String>,
}

impl BackendState {
    pub fn new(settings: ServerSettings, scorer: Arc<dyn Scorer>) -> Self {
        let provider = settings.default_provider().to_string();
        Self {
            settings,
            stats: ServerStats::new(),
            registry: SessionRegistry::new(),
            scorer,
            provider: RwLock::new(provider),
        }
    }

    pub fn current_provider(&self) -> String {
        self.provider
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Switches the provider for every session. False if it is unknown.
    pub fn select_provider(&self, provider: &str) -> bool {
        if !self.settings.supports_provider(provider) {
            return false;
        }
        let mut current = self
            .provider
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != provider {
            info!("🔄 Provider: {} -> {}", current, provider);
            *current = provider.to_string();
        }
        true
    }

    pub fn stats_snapshot(&self) -> StatsPayload {
        self.stats
            .snapshot(&self.current_provider(), &self.settings.providers)
    }

    pub fn broadcast_stats(&self) -> usize {
        self.registry.broadcast(&ServerEvent::Stats(self.stats_snapshot()))
    }

    /// 单帧模拟处理延迟
    pub fn simulated_latency(&self) -> Duration {
        let min = self.settings.min_latency.as_millis() as u64;
        let max = self.settings.max_latency.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

pub struct RecognitionServer {
    endpoint: Endpoint,
    state: Arc<BackendState>,
}

impl RecognitionServer {
    pub fn bind(settings: ServerSettings) -> Result<Self> {
        Self::with_scorer(settings, Arc::new(SimulatedScorer::new()))
    }

    pub fn with_scorer(settings: ServerSettings, scorer: Arc<dyn Scorer>) -> Result<Self> {
        // 创建自签名证书
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| StreamError::ProtocolError(e.to_string()))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| StreamError::ProtocolError(e.to_string()))?;
        let key_der = cert.serialize_private_key_der();

        let mut crypto = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
            .map_err(|e| StreamError::ProtocolError(e.to_string()))?;
        crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        // 配置传输参数
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(4_u32.into());
        transport_config.max_concurrent_uni_streams(0_u32.into());
        transport_config.max_idle_timeout(Duration::from_secs(300).try_into().ok());
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        server_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(server_config, settings.bind)
            .map_err(|e| StreamError::QuicError(e.to_string()))?;

        Ok(Self {
            endpoint,
            state: Arc::new(BackendState::new(settings, scorer)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn state(&self) -> Arc<BackendState> {
        self.state.clone()
    }

    /// 接受连接，直到端点关闭
    pub async fn run(&self) -> Result<()> {
        info!("QUIC server running...");

        while let Some(conn) = self.endpoint.accept().await {
            let state = self.state.clone();

            tokio::spawn(async move {
                match conn.await {
                    Ok(connection) => {
                        info!("New QUIC connection from: {}", connection.remote_address());
                        if let Err(e) = crate::connection::handle_connection(connection, state).await {
                            error!("Connection error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Connection failed: {}", e);
                    }
                }
            });
        }

        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_switch_is_validated() {
        let state = BackendState::new(ServerSettings::local(), Arc::new(SimulatedScorer::new()));
        assert_eq!(state.current_provider(), "SimulatedFaceMatch");
        assert!(state.select_provider("SimulatedFallback"));
        assert_eq!(state.current_provider(), "SimulatedFallback");
        assert!(!state.select_provider("Unknown"));
        assert_eq!(state.current_provider(), "SimulatedFallback");
        assert_eq!(
            state.stats_snapshot().current_provider.as_deref(),
            Some("SimulatedFallback")
        );
    }

    #[test]
    fn test_simulated_latency_stays_in_range() {
        let settings = ServerSettings {
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(40),
            ..ServerSettings::local()
        };
        let state = BackendState::new(settings, Arc::new(SimulatedScorer::new()));
        for _ in 0..50 {
            let latency = state.simulated_latency();
            assert!(latency >= Duration::from_millis(20) && latency <= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn test_binds_ephemeral_port() {
        let server = RecognitionServer::bind(ServerSettings::local()).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        server.close();
    }
}
