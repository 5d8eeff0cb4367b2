// 内存传输（测试与演示用）
//
// Each `open` hands the far end of the channel to a `MemoryAcceptor`, which
// plays the backend.

use super::{ConnectOptions, EventTransport, TransportChannel, TransportSignal};
use crate::errors::ConnectionError;
use async_trait::async_trait;
use common::{ClientEvent, ServerConfig, ServerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MemoryTransport {
    greeting: Option<ServerConfig>,
    refuse: AtomicBool,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// The backend's end of one in-memory connection.
pub struct MemoryPeer {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                greeting: None,
                refuse: AtomicBool::new(false),
                peers: peers_tx,
            },
            MemoryAcceptor { peers: peers_rx },
        )
    }

    /// Every opened channel starts with `config` already queued.
    pub fn with_greeting(config: ServerConfig) -> (Self, MemoryAcceptor) {
        let (mut transport, acceptor) = Self::new();
        transport.greeting = Some(config);
        (transport, acceptor)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn open(
        &self,
        url: &str,
        _options: &ConnectOptions,
    ) -> Result<TransportChannel, ConnectionError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailed {
                reason: format!("connection to {} refused", url),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        if let Some(config) = &self.greeting {
            let _ = inbound_tx.send(TransportSignal::Event(ServerEvent::Config(config.clone())));
        }

        let peer = MemoryPeer {
            events: outbound_rx,
            signals: inbound_tx,
            shutdown: shutdown.clone(),
        };
        if self.peers.send(peer).is_err() {
            debug!("No acceptor for in-memory connection to {}", url);
        }

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown,
        })
    }
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

impl MemoryPeer {
    pub fn push(&self, event: ServerEvent) -> bool {
        self.signals.send(TransportSignal::Event(event)).is_ok()
    }

    /// Reports a transport error without closing.
    pub fn fail(&self, reason: &str) -> bool {
        self.signals
            .send(TransportSignal::Error {
                reason: reason.to_string(),
            })
            .is_ok()
    }

    pub fn close(&self, reason: &str) -> bool {
        self.signals
            .send(TransportSignal::Closed {
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Next event sent by the client, `None` once the client hung up.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = self.shutdown.cancelled() => self.events.try_recv().ok(),
        }
    }

    /// Everything the client sent so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
