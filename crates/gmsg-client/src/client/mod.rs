// Connection handle and its public operations.
//
// A `Connection` is a cheap clone of one shared state. Background work per
// connection:
// - a reader task per link, feeding subscriptions and PONG waiters
// - a ping timer per link
// - a reconnect task while the link is down
// - one callback dispatcher for the connection's lifetime
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gmsg_wire::ServerInfo;

mod callbacks;
mod handshake;
mod pending;
mod pool;
mod reader;
mod reconnect;
mod request;
pub(crate) mod shared;
mod subscription;

pub use callbacks::{AsyncError, ConnectionCallback, ErrorCallback};
pub(crate) use callbacks::Callbacks;
pub use subscription::{MessageHandler, Subscription};

use shared::Shared;
use subscription::TargetKind;

use crate::config::Options;
use crate::{Error, Message, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Disconnected => "DISCONNECTED",
            Status::Connecting => "CONNECTING",
            Status::Connected => "CONNECTED",
            Status::Reconnecting => "RECONNECTING",
            Status::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("url", &self.connected_url())
            .finish()
    }
}

impl Connection {
    /// Connect to the first reachable server in the pool.
    ///
    /// Transport failures move on to the next server and end in
    /// [`Error::NoServers`]. An authorization or protocol rejection fails
    /// immediately, and no lifecycle callback fires in either case.
    pub async fn connect(options: Options) -> Result<Self> {
        let urls = options.server_urls()?;
        let shared = Arc::new(Shared::new(options, urls));
        shared.set_status(Status::Connecting);
        let candidates = shared.pool.lock().len();
        let mut last_error = None;
        for idx in 0..candidates {
            let Some(url) = shared.pool.lock().url(idx) else {
                break;
            };
            shared.pool.lock().record_attempt(idx);
            match handshake::establish(&shared, &url).await {
                Ok(link) => {
                    reconnect::install_link(&shared, idx, link, false).await?;
                    tracing::info!(server = %url, "connected");
                    return Ok(shared.connection());
                }
                Err(
                    err @ (Error::Authorization
                    | Error::ProtocolMismatch { .. }
                    | Error::SecureConnectionRequired
                    | Error::SecureConnectionWanted),
                ) => {
                    shared.set_status(Status::Closed);
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(server = %url, error = %err, "connect attempt failed");
                    shared.record_error(&err);
                    last_error = Some(err);
                }
            }
        }
        shared.set_status(Status::Closed);
        if let Some(err) = last_error {
            tracing::warn!(error = %err, "no server accepted the connection");
        }
        Err(Error::NoServers)
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// URL of the server currently connected to, as configured.
    pub fn connected_url(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        self.shared
            .pool
            .lock()
            .current_url()
            .map(|url| url.original.clone())
    }

    pub fn connected_server_id(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        self.shared.server_info().map(|info| info.server_id)
    }

    /// Servers still in the pool, in the order they will be tried.
    pub fn servers(&self) -> Vec<String> {
        self.shared
            .pool
            .lock()
            .urls()
            .into_iter()
            .map(|url| url.original)
            .collect()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info()
    }

    /// Largest payload the server accepts; zero before the first INFO.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    pub fn stats(&self) -> Statistics {
        self.shared.stats()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscription_count()
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_parts(subject, None, payload.into()).await
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_parts(subject, Some(reply), payload.into()).await
    }

    pub async fn publish_msg(&self, msg: &Message) -> Result<()> {
        self.publish_parts(&msg.subject, msg.reply.as_deref(), msg.payload.clone())
            .await
    }

    /// Subjects are checked for shape only; the server decides whether
    /// wildcards or permissions make a publish invalid.
    pub(crate) async fn publish_parts(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<()> {
        check_publish_subject(subject)?;
        if let Some(reply) = reply {
            check_publish_subject(reply)?;
        }
        let max = self.shared.max_payload();
        let size = payload.len();
        if max > 0 && size > max {
            return Err(Error::MaxPayload { size, max });
        }
        let op = gmsg_wire::ClientOp::Pub {
            subject: subject.to_string(),
            reply_to: reply.map(str::to_string),
            payload,
        }
        .to_bytes()?;
        self.shared.send_op(&op, true).await?;
        self.shared.count_out(size);
        Ok(())
    }

    /// Subscribe with a handler that runs on a task of its own, in delivery
    /// order.
    pub async fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.shared
            .subscribe(subject, None, TargetKind::Callback(Arc::new(handler)))
            .await
    }

    pub async fn queue_subscribe<F>(&self, subject: &str, queue: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.shared
            .subscribe(subject, Some(queue), TargetKind::Callback(Arc::new(handler)))
            .await
    }

    /// Subscribe for consumption with [`Subscription::next_msg`].
    pub async fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.shared.subscribe(subject, None, TargetKind::Queue).await
    }

    pub async fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.shared
            .subscribe(subject, Some(queue), TargetKind::Queue)
            .await
    }

    /// Round-trip a PING, so every operation sent before it has been
    /// processed by the server.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush(self.shared.options.flush_timeout).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        self.shared.flush(timeout).await
    }

    /// Close the connection. Pending flushes and requests fail with
    /// [`Error::ConnectionClosed`] and all subscriptions end. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

fn check_publish_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(Error::BadSubject(subject.to_string()));
    }
    Ok(())
}
