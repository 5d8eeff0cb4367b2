use super::{ConnectOptions, EventTransport, TransportChannel, TransportSignal};
use crate::errors::ConnectionError;
use crate::pipeline::state::LinkState;
use common::{ClientEvent, ServerConfig, ServerEvent, SessionStartPayload};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Owns the transport channel for one connection at a time.
///
/// The link state is written by the controller's transition function;
/// the session only consults it to decide whether a send is attempted.
pub struct LinkSession {
    transport: Arc<dyn EventTransport>,
    options: ConnectOptions,
    state: LinkState,
    channel: Option<TransportChannel>,
    /// 握手期间收到的信号，优先重放
    pending: VecDeque<TransportSignal>,
    server_config: Option<ServerConfig>,
    consecutive_errors: u32,
    url: Option<String>,
}

impl LinkSession {
    pub fn new(transport: Arc<dyn EventTransport>, options: ConnectOptions) -> Self {
        Self {
            transport,
            options,
            state: LinkState::Disconnected,
            channel: None,
            pending: VecDeque::new(),
            server_config: None,
            consecutive_errors: 0,
            url: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn server_config(&self) -> Option<&ServerConfig> {
        self.server_config.as_ref()
    }

    pub(crate) fn set_server_config(&mut self, config: ServerConfig) {
        self.server_config = Some(config);
    }

    /// Opens the transport and waits for the backend's `config`.
    ///
    /// Not cancel safe: dropping the future mid-handshake leaves the
    /// transport half open.
    pub async fn open(&mut self, url: &str) -> Result<ServerConfig, ConnectionError> {
        self.close();

        let mut channel = self.transport.open(url, &self.options).await?;

        let hello = ClientEvent::SessionStart(SessionStartPayload {
            client_id: self.options.client_id.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        if channel.outbound.send(hello).is_err() {
            channel.shutdown.cancel();
            return Err(ConnectionError::Closed {
                reason: "channel closed before session start".to_string(),
            });
        }

        let timeout = self.options.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let mut early = VecDeque::new();

        let config = loop {
            let signal = match tokio::time::timeout_at(deadline, channel.inbound.recv()).await {
                Ok(signal) => signal,
                Err(_) => {
                    channel.shutdown.cancel();
                    return Err(ConnectionError::HandshakeTimeout { timeout });
                }
            };

            match signal {
                Some(TransportSignal::Event(ServerEvent::Config(config))) => break config,
                Some(TransportSignal::Event(other)) => {
                    debug!("Buffering {} received before config", other.name());
                    early.push_back(TransportSignal::Event(other));
                }
                Some(TransportSignal::Error { reason }) => {
                    channel.shutdown.cancel();
                    return Err(ConnectionError::Transport { reason });
                }
                Some(TransportSignal::Closed { reason }) => {
                    channel.shutdown.cancel();
                    return Err(ConnectionError::Closed { reason });
                }
                None => {
                    return Err(ConnectionError::Closed {
                        reason: "transport dropped during handshake".to_string(),
                    });
                }
            }
        };

        info!("✓ Session established with {} (provider: {})", url, config.provider);
        self.channel = Some(channel);
        self.pending = early;
        self.server_config = Some(config.clone());
        self.consecutive_errors = 0;
        self.url = Some(url.to_string());
        Ok(config)
    }

    /// Tears the channel down. Idempotent. Returns whether a channel was open.
    pub fn close(&mut self) -> bool {
        self.pending.clear();
        self.server_config = None;
        self.consecutive_errors = 0;
        match self.channel.take() {
            Some(channel) => {
                channel.shutdown.cancel();
                debug!(
                    "Transport channel to {} closed",
                    self.url.take().unwrap_or_default()
                );
                true
            }
            None => false,
        }
    }

    /// Best-effort send. Dropped (and logged) unless the link is usable.
    pub fn send(&self, event: ClientEvent) -> bool {
        if !self.state.can_send() {
            warn!("Dropping {}: link is {:?}", event.name(), self.state);
            return false;
        }
        let Some(channel) = self.channel.as_ref() else {
            warn!("Dropping {}: no open channel", event.name());
            return false;
        };
        let name = event.name();
        if channel.outbound.send(event).is_err() {
            warn!("Dropping {}: transport writer is gone", name);
            return false;
        }
        true
    }

    /// Next signal from the transport. Never resolves while closed.
    ///
    /// Cancel safe.
    pub async fn next_signal(&mut self) -> TransportSignal {
        if let Some(signal) = self.pending.pop_front() {
            return signal;
        }
        let Some(channel) = self.channel.as_mut() else {
            return std::future::pending().await;
        };
        match channel.inbound.recv().await {
            Some(signal) => signal,
            None => TransportSignal::Closed {
                reason: "transport dropped".to_string(),
            },
        }
    }

    /// 记录一次传输错误，返回连续错误数
    pub(crate) fn record_error(&mut self) -> u32 {
        self.consecutive_errors += 1;
        self.consecutive_errors
    }

    pub(crate) fn record_healthy(&mut self) {
        self.consecutive_errors = 0;
    }

    pub(crate) fn error_budget_exhausted(&self) -> bool {
        self.consecutive_errors >= self.options.max_transport_errors.max(1)
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown.cancel();
        }
    }
}
