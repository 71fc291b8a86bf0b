// Request/reply over per-request inbox subjects.
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::Connection;
use super::subscription::TargetKind;
use crate::{Error, Message, Result};

impl Connection {
    /// A fresh subject of the form `_INBOX.<token>.<n>`, unique to this
    /// connection.
    pub fn new_inbox(&self) -> String {
        self.shared.new_inbox()
    }

    /// Publish `payload` with a new inbox as reply subject and wait for the
    /// first reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = self.new_inbox();
        let (tx, rx) = oneshot::channel();
        let sub = self
            .shared
            .subscribe(&inbox, None, TargetKind::Waiter(tx))
            .await?;
        sub.auto_unsubscribe(1).await?;
        if let Err(err) = self.publish_parts(subject, Some(&inbox), payload.into()).await {
            let _ = sub.unsubscribe().await;
            return Err(err);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) if self.is_closed() => Err(Error::ConnectionClosed),
            Ok(Err(_)) => Err(Error::BadSubscription),
            Err(_) => {
                let _ = sub.unsubscribe().await;
                Err(Error::Timeout)
            }
        }
    }

    /// [`Connection::request`] with the configured request timeout.
    pub async fn request_default(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Message> {
        let timeout = self.shared.options.request_timeout;
        self.request(subject, payload, timeout).await
    }

    /// Publish `payload` to the reply subject of `msg`.
    pub async fn respond(&self, msg: &Message, payload: impl Into<Bytes>) -> Result<()> {
        let reply = msg.reply.as_deref().ok_or(Error::BadSubject(String::new()))?;
        self.publish(reply, payload).await
    }
}
