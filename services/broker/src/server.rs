// TCP front end: accept loop, per-connection handshake, and the reader and
// writer halves of each client link.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use gmsg_authz::User;
use gmsg_broker::Broker;
use gmsg_transport::{ConnectionInfo, TcpServer, TransportConfig};
use gmsg_wire::{ClientOp, ClientOpCodec, Limits, PROTOCOL_VERSION, ServerInfo, ServerOp};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::auth::{AUTHORIZATION_VIOLATION, AuthContext, AuthRequest, Authenticator};
use crate::config::BrokerConfig;
use crate::dispatch::{Flow, Session};

pub const AUTHENTICATION_TIMEOUT: &str = "Authentication Timeout";

// Bound on draining a closing client's queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type LinkReader = FramedRead<OwnedReadHalf, ClientOpCodec>;
type LinkWriter = FramedWrite<OwnedWriteHalf, ClientOpCodec>;

struct ServerState {
    config: BrokerConfig,
    broker: Arc<Broker>,
    auth: Authenticator,
    info: ServerInfo,
}

impl ServerState {
    fn limits(&self) -> Limits {
        Limits {
            max_control_line: self.config.max_control_line,
            max_payload: self.config.max_payload,
        }
    }
}

/// A running broker listener.
///
/// Dropping the handle stops the listener and closes every client link, the
/// same as [`shutdown`](Self::shutdown) without waiting for it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind the client listener and start accepting connections.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let auth = Authenticator::from_config(&config)?;
        let listener = TcpServer::bind(config.bind, TransportConfig::default())
            .await
            .context("bind client listener")?;
        let local_addr = listener.local_addr()?;
        let info = ServerInfo {
            server_id: new_server_id(),
            server_name: config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            proto: PROTOCOL_VERSION,
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            auth_required: auth.auth_required(),
            tls_required: config.tls_required,
            max_payload: config.max_payload,
        };
        let state = Arc::new(ServerState {
            config,
            broker: Arc::new(Broker::new()),
            auth,
            info,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));
        tracing::info!(addr = %local_addr, server_id = %state.info.server_id, "client listener started");
        Ok(Self {
            local_addr,
            state,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL a client can connect with.
    pub fn client_url(&self) -> String {
        format!("gio://{}", self.local_addr)
    }

    pub fn server_id(&self) -> &str {
        &self.state.info.server_id
    }

    pub fn broker(&self) -> &Broker {
        &self.state.broker
    }

    /// Replace the configured users. Connected clients keep the permissions
    /// they authenticated with.
    pub fn reload_users(&self, users: &[User]) -> Result<()> {
        self.state.auth.reload_users(users)
    }

    /// Stop accepting, close every client link and wait for the connection
    /// tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.accept_task.await
            && !err.is_cancelled()
        {
            tracing::warn!(error = %err, "accept task failed");
        }
        tracing::info!(addr = %self.local_addr, "client listener stopped");
    }
}

async fn accept_loop(
    listener: TcpServer,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, info)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let conn_id = info.id.0;
                        if let Err(err) = handle_connection(state, stream, info, shutdown).await {
                            tracing::debug!(conn_id, error = %err, "client connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    conn: ConnectionInfo,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, ClientOpCodec::new(state.limits()));
    let mut writer = FramedWrite::new(write_half, ClientOpCodec::new(state.limits()));
    writer
        .send(ServerOp::Info(state.info.clone()))
        .await
        .context("send INFO")?;

    let Some((auth, verbose)) = authenticate(&state, &mut reader, &mut writer).await? else {
        let _ = writer.close().await;
        return Ok(());
    };
    tracing::debug!(
        conn_id = conn.id.0,
        peer = %conn.peer_addr,
        user = auth.username.as_deref().unwrap_or("-"),
        "client connected"
    );

    let (client, outbound) = state
        .broker
        .register_client(state.config.client_queue_capacity);
    let writer_task = tokio::spawn(write_loop(writer, outbound));
    let mut session = Session::new(
        Arc::clone(&state.broker),
        Arc::clone(&client),
        auth,
        verbose,
        state.config.max_pings_out,
    );
    // CONNECT was consumed by the auth step, so acknowledge it here.
    if verbose {
        session.acknowledge().await;
    }

    let ping_every = Duration::from_millis(state.config.ping_interval_ms);
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_every,
        ping_every.max(Duration::from_millis(1)),
    );
    let result = loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break Ok(()),
            _ = ping.tick(), if !ping_every.is_zero() => {
                if session.ping_tick().await == Flow::Close {
                    break Ok(());
                }
            }
            frame = reader.next() => match frame {
                None => break Ok(()),
                Some(Ok(op)) => {
                    if session.handle(op).await == Flow::Close {
                        break Ok(());
                    }
                }
                Some(Err(err)) => {
                    session.protocol_error(&err).await;
                    break Err(anyhow::Error::from(err).context("decode client frame"));
                }
            },
        }
    };

    state.broker.remove_client(&client);
    drop(session);
    drop(client);
    // The queue closes once the last handle is gone; whatever is left in it
    // (a final -ERR) is written before the socket shuts down.
    let mut writer_task = writer_task;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    tracing::debug!(conn_id = conn.id.0, "client disconnected");
    result
}

/// Wait for CONNECT when credentials are required. Returns `None` after the
/// refusal has been sent.
async fn authenticate(
    state: &ServerState,
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
) -> Result<Option<(AuthContext, bool)>> {
    if !state.auth.auth_required() {
        return Ok(Some((AuthContext::anonymous(), false)));
    }
    let timeout = Duration::from_millis(state.config.auth_timeout_ms);
    let first = match tokio::time::timeout(timeout, reader.next()).await {
        Err(_) => {
            metrics::counter!("gmsg_broker_auth_failures_total").increment(1);
            writer
                .send(ServerOp::Err(AUTHENTICATION_TIMEOUT.to_string()))
                .await?;
            return Ok(None);
        }
        Ok(None) => return Ok(None),
        Ok(Some(frame)) => frame?,
    };
    let connect = match &first {
        ClientOp::Connect(info) => Some(info),
        _ => None,
    };
    let request = AuthRequest {
        connect,
        tls_identity: None,
    };
    match state.auth.authenticate(&request) {
        Some(ctx) => Ok(Some((ctx, connect.is_some_and(|info| info.verbose)))),
        None => {
            metrics::counter!("gmsg_broker_auth_failures_total").increment(1);
            tracing::debug!(
                user = connect.and_then(|info| info.user.as_deref()).unwrap_or("-"),
                "authorization failed"
            );
            writer
                .send(ServerOp::Err(AUTHORIZATION_VIOLATION.to_string()))
                .await?;
            Ok(None)
        }
    }
}

async fn write_loop(mut writer: LinkWriter, mut outbound: mpsc::Receiver<ServerOp>) {
    while let Some(op) = outbound.recv().await {
        if let Err(err) = writer.feed(op).await {
            tracing::debug!(error = %err, "client write failed");
            return;
        }
        while let Ok(op) = outbound.try_recv() {
            if let Err(err) = writer.feed(op).await {
                tracing::debug!(error = %err, "client write failed");
                return;
            }
        }
        if let Err(err) = writer.flush().await {
            tracing::debug!(error = %err, "client flush failed");
            return;
        }
    }
    let _ = writer.close().await;
}

// Also resolves when the handle is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn new_server_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}
