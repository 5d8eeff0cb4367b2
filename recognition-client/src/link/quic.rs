// QUIC 事件通道
//
// One bidirectional stream per session, carrying length-prefixed JSON events
// in both directions. A writer and a reader task bridge the stream to the
// channel halves handed to the session.

use super::{ConnectOptions, EventTransport, TransportChannel, TransportSignal};
use crate::errors::ConnectionError;
use async_trait::async_trait;
use common::{decode_event, encode_event, frame_codec, ClientEvent, ServerEvent, ALPN_PROTOCOL};
use futures::{SinkExt, StreamExt};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub struct QuicTransport {
    endpoint: Mutex<Option<Endpoint>>,
}

impl QuicTransport {
    pub fn new() -> Self {
        Self {
            endpoint: Mutex::new(None),
        }
    }

    fn create_client_config() -> ClientConfig {
        // 跳过服务器证书验证（后端使用自签名证书）
        let mut crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Duration::from_secs(60).try_into().ok());
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));

        let mut client_config = ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(transport_config));
        client_config
    }

    async fn ensure_endpoint(&self, server: SocketAddr) -> Result<Endpoint, ConnectionError> {
        let mut endpoint_guard = self.endpoint.lock().await;

        if let Some(endpoint) = endpoint_guard.as_ref() {
            return Ok(endpoint.clone());
        }

        let bind: SocketAddr = if server.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = Endpoint::client(bind).map_err(|e| ConnectionError::ConnectFailed {
            reason: format!("failed to create endpoint: {}", e),
        })?;
        *endpoint_guard = Some(endpoint.clone());
        Ok(endpoint)
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves `quic://host:port` (or a bare `host:port`), preferring IPv4.
pub async fn resolve_server_addr(url: &str) -> Result<SocketAddr, ConnectionError> {
    let trimmed = url.trim();
    let authority = match trimmed.split_once("://") {
        Some(("quic", rest)) => rest,
        Some(_) => {
            return Err(ConnectionError::InvalidUrl {
                url: url.to_string(),
            })
        }
        None => trimmed,
    };
    let authority = authority.trim_end_matches('/');
    if authority.is_empty() {
        return Err(ConnectionError::InvalidUrl {
            url: url.to_string(),
        });
    }

    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(authority)
        .await
        .map_err(|_| ConnectionError::InvalidUrl {
            url: url.to_string(),
        })?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| ConnectionError::InvalidUrl {
            url: url.to_string(),
        })
}

#[async_trait]
impl EventTransport for QuicTransport {
    async fn open(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<TransportChannel, ConnectionError> {
        let server_addr = resolve_server_addr(url).await?;
        let endpoint = self.ensure_endpoint(server_addr).await?;

        let connecting = endpoint
            .connect_with(Self::create_client_config(), server_addr, "localhost")
            .map_err(|e| ConnectionError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let connection = tokio::time::timeout(options.connect_timeout, connecting)
            .await
            .map_err(|_| ConnectionError::ConnectFailed {
                reason: format!("no answer from {} within {:?}", server_addr, options.connect_timeout),
            })?
            .map_err(|e| ConnectionError::ConnectFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to recognition backend at {}", server_addr);

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(write_events(
            FramedWrite::new(send, frame_codec()),
            outbound_rx,
            inbound_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(read_events(
            FramedRead::new(recv, frame_codec()),
            inbound_tx,
            shutdown.clone(),
        ));
        tokio::spawn(close_on_shutdown(connection, shutdown.clone()));

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown,
        })
    }
}

async fn write_events(
    mut sink: FramedWrite<SendStream, LengthDelimitedCodec>,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = outbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let frame = match encode_event(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", event.name(), e);
                continue;
            }
        };

        if let Err(e) = sink.send(frame).await {
            let _ = signals.send(TransportSignal::Closed {
                reason: format!("write failed: {}", e),
            });
            shutdown.cancel();
            break;
        }
        trace!("Sent {}", event.name());
    }

    let _ = sink.get_mut().finish().await;
}

async fn read_events(
    mut stream: FramedRead<RecvStream, LengthDelimitedCodec>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        let signal = match next {
            Some(Ok(frame)) => match decode_event::<ServerEvent>(&frame) {
                Ok(event) => {
                    trace!("Received {}", event.name());
                    TransportSignal::Event(event)
                }
                Err(e) => {
                    warn!("Undecodable event from backend: {}", e);
                    TransportSignal::Error {
                        reason: format!("undecodable event: {}", e),
                    }
                }
            },
            Some(Err(e)) => {
                let _ = signals.send(TransportSignal::Closed {
                    reason: format!("read failed: {}", e),
                });
                break;
            }
            None => {
                let _ = signals.send(TransportSignal::Closed {
                    reason: "backend closed the stream".to_string(),
                });
                break;
            }
        };

        if signals.send(signal).is_err() {
            break;
        }
    }
}

async fn close_on_shutdown(connection: Connection, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {
            connection.close(0u32.into(), b"client disconnect");
            debug!("QUIC connection closed by client");
        }
        reason = connection.closed() => {
            debug!("QUIC connection closed: {}", reason);
            shutdown.cancel();
        }
    }
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_literal_addresses() {
        let addr = resolve_server_addr("quic://127.0.0.1:8443").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8443".parse().unwrap());

        let bare = resolve_server_addr("127.0.0.1:9000/").await.unwrap();
        assert_eq!(bare.port(), 9000);
    }

    #[tokio::test]
    async fn test_rejects_foreign_schemes_and_garbage() {
        for url in ["https://127.0.0.1:8443", "quic://", "not an address"] {
            let err = resolve_server_addr(url).await.unwrap_err();
            assert_eq!(
                err,
                ConnectionError::InvalidUrl {
                    url: url.to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_times_out() {
        let transport = QuicTransport::new();
        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(200),
            ..ConnectOptions::default()
        };
        // discard 端口上没有监听者
        let result = transport.open("quic://127.0.0.1:9", &options).await;
        assert!(matches!(result, Err(ConnectionError::ConnectFailed { .. })));
    }
}
