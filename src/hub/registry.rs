// Registry of connected, synchronized sessions

use crate::hub::session::{Session, SessionInfo, SessionStatus};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// All routing-visible sessions, keyed by peer address.
///
/// Reads happen on every routed letter, writes only on connect and
/// disconnect, hence the `RwLock`.
pub struct Registry {
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mark the session connected and make it routable
    pub async fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        session.set_status(SessionStatus::Connected);
        tracing::info!(
            "Client {} registered from {} (delay {:.4}s, offset {:.4}s)",
            session.identity,
            session.addr,
            session.clock.net_delay,
            session.clock.offset()
        );
        if let Some(previous) = sessions.insert(session.addr, session) {
            previous.set_status(SessionStatus::Disconnected);
            previous.abort();
        }
    }

    /// Remove a session; it is marked disconnected under the same lock
    pub async fn unregister(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(addr)?;
        removed.set_status(SessionStatus::Disconnected);
        tracing::info!("Client {} unregistered from {}", removed.identity, addr);
        Some(removed)
    }

    /// Connected sessions under `path`, filtered by `uid` unless it is empty
    pub async fn find(&self, path: &str, uid: &str) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.is_connected())
            .filter(|s| s.identity.path == path && (uid.is_empty() || s.identity.uid == uid))
            .cloned()
            .collect()
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(addr).cloned()
    }

    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| SessionInfo::from(s.as_ref())).collect()
    }

    /// Drop every session, aborting their handlers
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.set_status(SessionStatus::Disconnected);
            session.abort();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
