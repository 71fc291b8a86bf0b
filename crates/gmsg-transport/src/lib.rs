// TCP transport primitives and the dialer seam used by clients.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport-level configuration defaults.
///
/// ```
/// use gmsg_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.nodelay);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Stable connection identifier used for tracing/logging.
///
/// ```
/// use gmsg_transport::ConnectionId;
///
/// let id = ConnectionId(7);
/// assert_eq!(id.0, 7);
/// ```
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone)]
/// Metadata about an accepted connection.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// One established byte stream, split into halves.
pub struct Link {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub peer: String,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

impl Link {
    pub fn from_tcp(stream: TcpStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }
}

/// Opens links to servers.
///
/// The client reaches brokers only through this trait, so tests can swap in
/// in-memory streams and deployments can add encryption.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Link>;

    /// Wrap an established link in a secure session.
    async fn upgrade(&self, link: Link, _server_name: &str) -> io::Result<Link> {
        drop(link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "secure transport is not available on this dialer",
        ))
    }

    fn supports_secure(&self) -> bool {
        false
    }
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Link> {
        let stream = connect_timeout(addr, timeout).await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Link::from_tcp(stream, peer))
    }
}

pub async fn connect_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

/// TCP listener that tags accepted streams with connection ids.
///
/// ```no_run
/// # async fn run() -> anyhow::Result<()> {
/// use gmsg_transport::{TcpServer, TransportConfig};
///
/// let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
/// let (stream, info) = server.accept().await?;
/// # drop((stream, info));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    transport: TransportConfig,
    next_id: AtomicU64,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, transport: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind TCP listener on {addr}"))?;
        Ok(Self {
            listener,
            transport,
            next_id: AtomicU64::new(0),
        })
    }

    pub async fn accept(&self) -> Result<(TcpStream, ConnectionInfo)> {
        let (stream, peer_addr) = self.listener.accept().await.context("accept TCP connection")?;
        if self.transport.nodelay {
            stream.set_nodelay(true).context("set TCP_NODELAY")?;
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(conn_id = id.0, peer = %peer_addr, "accepted connection");
        Ok((stream, ConnectionInfo { id, peer_addr }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("read TCP local address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes() {
        let server = TcpServer::bind("127.0.0.1:0".parse().expect("addr"), TransportConfig::default())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr").to_string();
        let accept = tokio::spawn(async move {
            let (mut stream, info) = server.accept().await.expect("accept");
            assert_eq!(info.id, ConnectionId(1));
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            buf
        });

        let mut link = TcpDialer::default()
            .dial(&addr, Duration::from_secs(1))
            .await
            .expect("dial");
        link.writer.write_all(b"PING").await.expect("write");
        assert_eq!(&accept.await.expect("join"), b"PING");
    }

    #[tokio::test]
    async fn dial_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let result = TcpDialer::default().dial(&addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn default_dialer_has_no_secure_upgrade() {
        let (client, _server) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let link = Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: "memory".to_string(),
        };
        let dialer = TcpDialer::default();
        assert!(!dialer.supports_secure());
        let err = dialer.upgrade(link, "localhost").await.expect_err("unsupported");
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
