// Control center server: accept loop and per-connection handlers

use crate::hub::bag::{MailMan, BAG_NAMES};
use crate::hub::clock::{self, ClockState};
use crate::hub::config::HubConfig;
use crate::hub::error::{HubError, ProtocolError, Result};
use crate::hub::frame::{FrameReader, FrameWriter};
use crate::hub::handshake::{self, SharedKey};
use crate::hub::letter::{preview, Letter, Payload, ACQUIRE_BAGS_PREFIX, READY};
use crate::hub::registry::Registry;
use crate::hub::router::{RouteOutcome, Router};
use crate::hub::session::{Connection, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// State shared by every connection handler of one server
struct HubContext {
    config: HubConfig,
    key: SharedKey,
    registry: Arc<Registry>,
    router: Arc<Router>,
}

/// A running control center
pub struct HubServer {
    ctx: Arc<HubContext>,
    mail: Arc<MailMan>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl HubServer {
    /// Bind the listener and start accepting clients
    pub async fn start(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let key = config.shared_key()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let hub = config.hub_identity();
        let registry = Arc::new(Registry::new());
        let mail = Arc::new(MailMan::with_random_name(
            &hub.address(),
            cancel.child_token(),
        ));
        let router = Arc::new(Router::new(
            config.station_name.clone(),
            hub,
            registry.clone(),
            mail.clone(),
        ));

        tracing::info!(
            "Control center listening on {} (key fingerprint {})",
            local_addr,
            key.fingerprint()
        );

        let status_interval = config.status_interval_secs;
        let ctx = Arc::new(HubContext {
            config,
            key,
            registry,
            router,
        });

        tasks.spawn(accept_loop(
            listener,
            ctx.clone(),
            cancel.clone(),
            tasks.clone(),
        ));

        if status_interval > 0 {
            tasks.spawn(status_loop(
                ctx.registry.clone(),
                Duration::from_secs(status_interval),
                cancel.clone(),
            ));
        }

        Ok(Self {
            ctx,
            mail,
            local_addr,
            cancel,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HubConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.ctx.registry.clone()
    }

    pub fn router(&self) -> Arc<Router> {
        self.ctx.router.clone()
    }

    /// The hub's own mail context
    pub fn mail(&self) -> Arc<MailMan> {
        self.mail.clone()
    }

    /// Send a letter on the hub's behalf and wait for its response in the
    /// background; the letter expires into `failed` if none arrives.
    pub async fn post(&self, dst: &str, content: &str) -> (Letter, RouteOutcome) {
        let src = self.ctx.config.hub_identity().address();
        let letter = self.mail.mk_letter(&src, dst, content, None).await;
        self.mail
            .await_response(&letter, self.ctx.config.response_timeout())
            .await;
        let outcome = self
            .ctx
            .router
            .route_from(&letter, &ClockState::local())
            .await;
        (letter, outcome)
    }

    /// Stop accepting, drop every session and wait for all tasks to end
    pub async fn shutdown(&self) {
        tracing::info!("Control center shutting down");
        self.cancel.cancel();
        self.ctx.registry.clear().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.mail.shutdown().await;
        tracing::info!("Control center stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<HubContext>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("Client {} connected", addr);
                        tasks.spawn(handle_connection(
                            stream,
                            addr,
                            ctx.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Listener shutting down");
                break;
            }
        }
    }
}

async fn status_loop(registry: Arc<Registry>, interval: Duration, cancel: CancellationToken) {
    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = cancel.cancelled() => break,
        }
        for info in registry.snapshot().await {
            tracing::info!(
                "{} ({}) {} | delay {:.4}s | offset {:.4}s | {} messages | latest {:?}",
                info.path,
                info.uid,
                info.addr,
                info.delay,
                info.offset,
                info.messages,
                info.latest
            );
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<HubContext>,
    cancel: CancellationToken,
) {
    match serve_connection(stream, addr, &ctx, cancel).await {
        Ok(()) => tracing::info!("Client {} disconnected", addr),
        Err(HubError::Auth) => {
            tracing::warn!("Client {} provided invalid key. Disconnecting.", addr)
        }
        Err(HubError::Protocol(ProtocolError::Frame(e))) => {
            tracing::warn!("Client {} dropped: {}", addr, e)
        }
        Err(e) => tracing::error!("Client {} dropped: {}", addr, e),
    }
}

/// Run one connection from handshake to teardown
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: &HubContext,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(BufReader::new(read_half), ctx.config.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half);

    let handshake = async {
        let identity = handshake::accept(&mut reader, &ctx.key).await?;
        // Letters to the hub path never reach a client.
        if identity.path == ctx.config.hub_path {
            return Err(HubError::from(ProtocolError::ReservedPath(identity.path)));
        }
        tracing::info!("Client {} at {} is connecting", identity, addr);
        let clock = clock::synchronize(&mut reader, &mut writer, ctx.config.sync_settings()).await?;
        Ok::<_, HubError>((identity, clock))
    };
    let (identity, clock) = tokio::select! {
        result = tokio::time::timeout(ctx.config.handshake_timeout(), handshake) => {
            result.map_err(|_| HubError::Timeout("handshaking"))??
        }
        _ = cancel.cancelled() => return Ok(()),
    };

    let connection = Connection::new(writer.into_inner(), ctx.config.write_timeout());
    let session = Arc::new(Session::new(addr, identity, clock, connection, cancel));

    ctx.registry.register(session.clone()).await;
    let result = match session.send(READY).await {
        Ok(()) => receive_loop(&mut reader, &session, ctx).await,
        Err(e) => Err(e),
    };

    ctx.registry.unregister(&addr).await;
    session.abort();
    if let Err(e) = session.connection.close().await {
        tracing::debug!("Closing {} failed: {}", addr, e);
    }
    result
}

async fn receive_loop<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    session: &Session,
    ctx: &HubContext,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            frame = reader.read_next() => frame?,
            _ = session.cancel_token().cancelled() => return Ok(()),
        };
        let Some(body) = frame else {
            return Ok(());
        };
        if body.is_empty() {
            return Err(ProtocolError::EmptyBody.into());
        }

        let text = String::from_utf8(body).map_err(ProtocolError::from)?;
        tracing::debug!(
            "Received message from {}: {} ({} bytes)",
            session.identity,
            preview(&text),
            text.len()
        );
        session.record_message(&text);
        handle_message(&text, session, ctx).await?;
    }
}

async fn handle_message(text: &str, session: &Session, ctx: &HubContext) -> Result<()> {
    match Payload::classify(text, &BAG_NAMES) {
        Payload::Letter(json) => match Letter::from_json(json) {
            Ok(letter) => {
                ctx.router.route(&letter, session).await;
            }
            Err(e) => {
                tracing::warn!("Dropping malformed letter from {}: {}", session.identity, e)
            }
        },
        Payload::KeepAlive => {
            if ctx.config.acquire_bags {
                for name in BAG_NAMES {
                    session
                        .send(&format!("{}{}", ACQUIRE_BAGS_PREFIX, name))
                        .await?;
                }
            }
        }
        Payload::BagReport { bag, dump } => {
            tracing::debug!("Bag report {} from {} ({} bytes)", bag, session.identity, dump.len());
            session.store_bag_report(bag, dump);
        }
        Payload::Echo(_) => {
            tracing::debug!("Late echo reply from {}", session.identity);
        }
        Payload::Ready | Payload::AcquireBags(_) | Payload::Unknown(_) => {
            tracing::warn!(
                "Can not handle message from {}: {}",
                session.identity,
                preview(text)
            );
        }
    }
    Ok(())
}
