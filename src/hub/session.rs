// Connected client sessions

use crate::hub::clock::ClockState;
use crate::hub::error::{FrameError, HubError, Result};
use crate::hub::frame::FrameWriter;
use crate::hub::handshake::ClientIdentity;
use crate::hub::letter::preview;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client connection.
///
/// Every frame goes out under the lock so frames from different senders
/// never interleave.
pub struct Connection {
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    write_timeout: Duration,
}

impl Connection {
    pub fn new<W>(writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            write_timeout,
        }
    }

    /// Send one frame, giving up after the write timeout
    pub async fn send(&self, payload: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.write_frame(payload.as_bytes())).await
        {
            Ok(written) => {
                written?;
                Ok(())
            }
            Err(_) => Err(HubError::Timeout("writing a frame")),
        }
    }

    pub async fn close(&self) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// An identified, clock-synchronized client
pub struct Session {
    pub addr: SocketAddr,
    pub identity: ClientIdentity,
    pub clock: ClockState,
    pub connection: Connection,
    status: Mutex<SessionStatus>,
    cancel: CancellationToken,
    messages: AtomicU64,
    latest: Mutex<String>,
    bag_reports: Mutex<HashMap<String, String>>,
}

impl Session {
    pub fn new(
        addr: SocketAddr,
        identity: ClientIdentity,
        clock: ClockState,
        connection: Connection,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            identity,
            clock,
            connection,
            status: Mutex::new(SessionStatus::Connecting),
            cancel,
            messages: AtomicU64::new(0),
            latest: Mutex::new(String::new()),
            bag_reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    /// Token cancelled when the session is torn down
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Abort the session: its handler stops reading and unregisters it
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn send(&self, payload: &str) -> Result<()> {
        self.connection.send(payload).await
    }

    /// Count an incoming frame and remember a preview of it
    pub fn record_message(&self, text: &str) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = preview(text).to_string();
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn latest_message(&self) -> String {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store_bag_report(&self, bag: &str, dump: &str) {
        self.bag_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bag.to_string(), dump.to_string());
    }

    /// Latest dump the client sent for `bag`
    pub fn bag_report(&self, bag: &str) -> Option<String> {
        self.bag_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bag)
            .cloned()
    }
}

/// Monitoring snapshot of one session
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub path: String,
    pub uid: String,
    pub delay: f64,
    pub offset: f64,
    pub messages: u64,
    pub latest: String,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            addr: session.addr,
            path: session.identity.path.clone(),
            uid: session.identity.uid.clone(),
            delay: session.clock.net_delay,
            offset: session.clock.offset(),
            messages: session.message_count(),
            latest: session.latest_message(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hub::frame::FrameReader;

    /// Session whose writes land in an in-memory pipe
    pub(crate) fn test_session(
        port: u16,
        path: &str,
        uid: &str,
        clock: ClockState,
    ) -> (Session, FrameReader<tokio::io::DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(ours, Duration::from_secs(1));
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let session = Session::new(
            addr,
            ClientIdentity::new(path, uid),
            clock,
            connection,
            CancellationToken::new(),
        );
        (session, FrameReader::new(theirs, 1024 * 1024))
    }

    #[tokio::test]
    async fn test_session_send_is_framed() {
        let (session, mut peer) = test_session(1, "/a", "a1", ClockState::local());
        session.send("YouAreGoodToGo").await.unwrap();
        session.send("Echo,1.0").await.unwrap();

        assert_eq!(peer.read_next().await.unwrap().unwrap(), b"YouAreGoodToGo");
        assert_eq!(peer.read_next().await.unwrap().unwrap(), b"Echo,1.0");
    }

    #[tokio::test]
    async fn test_session_stats_and_reports() {
        let (session, _peer) = test_session(2, "/a", "a1", ClockState::local());
        assert_eq!(session.status(), SessionStatus::Connecting);

        session.record_message("Keep-Alive,1.0");
        session.record_message("{\"uid\": \"x\"}");
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.latest_message(), "{\"uid\": \"x\"}");

        session.store_bag_report("Bag-Pending", "{}");
        assert_eq!(session.bag_report("Bag-Pending").as_deref(), Some("{}"));
        assert!(session.bag_report("Bag-Failed").is_none());

        let info = SessionInfo::from(&session);
        assert_eq!(info.path, "/a");
        assert_eq!(info.messages, 2);
    }

    #[tokio::test]
    async fn test_abort_cancels_token() {
        let (session, _peer) = test_session(3, "/a", "a1", ClockState::local());
        let token = session.cancel_token().clone();
        session.abort();
        assert!(token.is_cancelled());
    }
}
