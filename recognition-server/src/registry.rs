use common::ServerEvent;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// 已开始会话的发送队列（用于广播）
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: Uuid, outbound: mpsc::UnboundedSender<ServerEvent>) {
        info!("Registering session: {}", session_id);
        self.sessions.insert(session_id, outbound);
    }

    pub fn unregister(&self, session_id: &Uuid) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!("Unregistering session: {}", session_id);
        }
        removed
    }

    /// Sends `event` to every session. Returns how many accepted it.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if entry.value().send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Session {} no longer accepts events", entry.key());
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
