//! Event channel to the recognition backend.

mod memory;
mod quic;
mod session;

pub use memory::{MemoryAcceptor, MemoryPeer, MemoryTransport};
pub use quic::{resolve_server_addr, QuicTransport};
pub use session::LinkSession;

use crate::errors::ConnectionError;
use async_trait::async_trait;
use common::{ClientEvent, ServerEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event(ServerEvent),
    /// Something went wrong but the channel is still open.
    Error { reason: String },
    /// The channel is gone.
    Closed { reason: String },
}

/// An open, ordered, bidirectional event channel.
pub struct TransportChannel {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<TransportSignal>,
    /// Cancelling tears the channel down.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Consecutive transport errors tolerated before the link is dropped.
    pub max_transport_errors: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_transport_errors: 3,
        }
    }
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<TransportChannel, ConnectionError>;
}
