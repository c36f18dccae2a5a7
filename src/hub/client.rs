// Client side of the control center protocol

use crate::hub::bag::{MailMan, Resolution, BAG_NAMES};
use crate::hub::clock::{echo_reply, parse_echo_reply};
use crate::hub::config::ClientConfig;
use crate::hub::error::{HubError, ProtocolError, Result};
use crate::hub::frame::FrameReader;
use crate::hub::handshake::{self, ClientIdentity};
use crate::hub::letter::{preview, Letter, Payload, KEEP_ALIVE_PREFIX};
use crate::hub::session::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cloneable sending side of a connected client
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    identity: ClientIdentity,
    connection: Connection,
    mail: MailMan,
}

impl ClientHandle {
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// `path?uid` of this client, used as `src` of its letters
    pub fn address(&self) -> String {
        self.inner.identity.address()
    }

    pub fn mail(&self) -> &MailMan {
        &self.inner.mail
    }

    /// Local clock reading, skew included
    pub fn now(&self) -> f64 {
        self.inner.config.now()
    }

    pub async fn send_raw(&self, payload: &str) -> Result<()> {
        self.inner.connection.send(payload).await
    }

    pub async fn send_letter(&self, letter: &Letter) -> Result<()> {
        let json = letter.to_json().map_err(ProtocolError::from)?;
        self.send_raw(&json).await
    }

    /// Mint a letter, park it awaiting a response and send it
    pub async fn request(&self, dst: &str, content: &str) -> Result<Letter> {
        let letter = self
            .inner
            .mail
            .mk_letter(&self.address(), dst, content, Some(self.now()))
            .await;
        self.inner
            .mail
            .await_response(&letter, self.inner.config.response_timeout())
            .await;
        self.send_letter(&letter).await?;
        Ok(letter)
    }

    /// Wait until the letter under `uid` has left the pending bag
    pub async fn settle(&self, uid: &str) -> Resolution {
        let bags = self.inner.mail.bags();
        while bags.pending.contains(uid).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if bags.finished.contains(uid).await {
            Resolution::Finished
        } else if bags.failed.contains(uid).await {
            Resolution::Failed
        } else {
            Resolution::Absent
        }
    }
}

/// A synchronized connection to the control center
pub struct HubClient {
    handle: ClientHandle,
    incoming: mpsc::UnboundedReceiver<Letter>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl HubClient {
    /// Authenticate, answer the clock probes, and start the background loops
    /// once the hub reports the client ready.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let key = config.shared_key()?;
        let identity = config.identity();

        let mut stream = TcpStream::connect(config.server_addr()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        handshake::introduce(&mut stream, &key, &identity).await?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(BufReader::new(read_half), config.max_frame_bytes);
        let connection = Connection::new(write_half, config.write_timeout());

        tokio::time::timeout(
            config.sync_timeout(),
            answer_sync(&mut reader, &connection, &config),
        )
        .await
        .map_err(|_| HubError::Timeout("waiting for clock sync"))??;

        tracing::info!("Connected to control center as {}", identity);

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mail = MailMan::with_random_name(&identity.address(), cancel.child_token());
        let handle = ClientHandle {
            inner: Arc::new(ClientInner {
                config,
                identity,
                connection,
                mail,
            }),
        };

        let (tx, incoming) = mpsc::unbounded_channel();
        tasks.spawn(receive_loop(reader, handle.clone(), tx, cancel.clone()));
        if let Some(period) = handle.inner.config.keep_alive() {
            tasks.spawn(keep_alive_loop(handle.clone(), period, cancel.clone()));
        }

        Ok(Self {
            handle,
            incoming,
            cancel,
            tasks,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn identity(&self) -> &ClientIdentity {
        self.handle.identity()
    }

    pub fn mail(&self) -> &MailMan {
        self.handle.mail()
    }

    pub async fn send_raw(&self, payload: &str) -> Result<()> {
        self.handle.send_raw(payload).await
    }

    pub async fn send_letter(&self, letter: &Letter) -> Result<()> {
        self.handle.send_letter(letter).await
    }

    pub async fn request(&self, dst: &str, content: &str) -> Result<Letter> {
        self.handle.request(dst, content).await
    }

    /// Next incoming letter; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Letter> {
        self.incoming.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Letter> {
        tokio::time::timeout(timeout, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn close(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        if let Err(e) = self.handle.inner.connection.close().await {
            tracing::debug!("Closing connection failed: {}", e);
        }
        self.handle.inner.mail.shutdown().await;
        tracing::info!("Disconnected {}", self.handle.inner.identity);
    }
}

/// Echo every probe until the hub says `YouAreGoodToGo`
async fn answer_sync<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    connection: &Connection,
    config: &ClientConfig,
) -> Result<()> {
    let mut probes = 0usize;
    loop {
        let body = reader.read_next().await?.ok_or(HubError::Closed)?;
        let text = String::from_utf8(body).map_err(ProtocolError::from)?;
        match Payload::classify(&text, &[]) {
            Payload::Echo(fields) => {
                connection.send(&echo_reply(fields, config.now())).await?;
                probes += 1;
            }
            Payload::Ready => {
                tracing::debug!("Clock sync finished after {} probes", probes);
                return Ok(());
            }
            _ => tracing::debug!("Ignoring frame before ready: {}", preview(&text)),
        }
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    handle: ClientHandle,
    tx: mpsc::UnboundedSender<Letter>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.read_next() => frame,
            _ = cancel.cancelled() => break,
        };
        let text = match frame {
            Ok(Some(body)) => match String::from_utf8(body) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Dropping non utf-8 frame: {}", e);
                    continue;
                }
            },
            Ok(None) => {
                tracing::info!("Control center closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Connection to control center failed: {}", e);
                break;
            }
        };

        if let Err(e) = handle_frame(&text, &handle, &tx).await {
            tracing::warn!("Failed to answer {}: {}", preview(&text), e);
            if is_fatal(&e) {
                break;
            }
        }
    }
    cancel.cancel();
}

async fn handle_frame(
    text: &str,
    handle: &ClientHandle,
    tx: &mpsc::UnboundedSender<Letter>,
) -> Result<()> {
    match Payload::classify(text, &BAG_NAMES) {
        Payload::Echo(fields) => {
            if parse_echo_reply(fields).is_none() {
                handle.send_raw(&echo_reply(fields, handle.now())).await?;
            }
        }
        Payload::AcquireBags(name) => match handle.mail().bags().by_name(name) {
            Some(bag) => {
                let dump = bag.dumps().await.map_err(ProtocolError::from)?;
                handle.send_raw(&format!("{}:{}", name, dump)).await?;
            }
            None => tracing::warn!("Control center asked for unknown bag {}", name),
        },
        Payload::Letter(json) => {
            let letter = Letter::from_json(json)?;
            if handle.mail().bags().pending.contains(&letter.uid).await {
                match handle.mail().resolve(&letter).await {
                    Resolution::Finished => tracing::info!("Letter {} finished", letter.uid),
                    Resolution::Failed => tracing::info!("Letter {} failed", letter.uid),
                    Resolution::Absent => {}
                }
            }
            if tx.send(letter).is_err() {
                tracing::debug!("Incoming letter dropped, receiver is gone");
            }
        }
        Payload::Ready | Payload::KeepAlive => {}
        Payload::BagReport { .. } | Payload::Unknown(_) => {
            tracing::warn!("Can not handle message: {}", preview(text));
        }
    }
    Ok(())
}

/// Write failures end the connection; a bad payload only drops that frame
fn is_fatal(err: &HubError) -> bool {
    matches!(
        err,
        HubError::Io(_) | HubError::Timeout(_) | HubError::Protocol(ProtocolError::Frame(_))
    )
}

async fn keep_alive_loop(handle: ClientHandle, period: Duration, cancel: CancellationToken) {
    let mut timer = tokio::time::interval(period);
    // The first tick fires immediately; the hub just heard from us.
    timer.tick().await;
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let beat = format!("{},{}", KEEP_ALIVE_PREFIX, handle.now());
        if let Err(e) = handle.send_raw(&beat).await {
            tracing::warn!("Keep-alive failed: {}", e);
            cancel.cancel();
            break;
        }
    }
}
