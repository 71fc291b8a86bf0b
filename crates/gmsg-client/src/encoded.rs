// Typed publish/subscribe over a pluggable payload codec.
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::client::shared::Shared;
use crate::{Connection, Error, Message, Result, Subscription};

const SEND_CHANNEL_DEPTH: usize = 1024;

/// Converts values to and from message payloads.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes>;
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| Error::Codec(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|err| Error::Codec(err.to_string()))
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub subject: String,
    pub reply: Option<String>,
    pub value: T,
}

/// A [`Connection`] that encodes payloads with `C`.
///
/// ```no_run
/// # async fn run() -> gmsg_client::Result<()> {
/// use gmsg_client::{EncodedConnection, Options};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Person { name: String, age: u32 }
///
/// let conn = EncodedConnection::json(Options::new().connect().await?);
/// conn.subscribe("people", |msg: gmsg_client::Decoded<Person>| {
///     println!("{} is {}", msg.value.name, msg.value.age);
/// })
/// .await?;
/// conn.publish("people", &Person { name: "derek".into(), age: 22 }).await?;
/// # Ok(())
/// # }
/// ```
pub struct EncodedConnection<C: Codec = JsonCodec> {
    conn: Connection,
    codec: Arc<C>,
}

impl<C: Codec> Clone for EncodedConnection<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl EncodedConnection<JsonCodec> {
    pub fn json(conn: Connection) -> Self {
        Self::new(conn, JsonCodec)
    }
}

impl<C: Codec> EncodedConnection<C> {
    pub fn new(conn: Connection, codec: C) -> Self {
        Self {
            conn,
            codec: Arc::new(codec),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, value: &T) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.conn.publish(subject, payload).await
    }

    pub async fn publish_request<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        reply: &str,
        value: &T,
    ) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.conn.publish_with_reply(subject, reply, payload).await
    }

    pub async fn request<T, R>(&self, subject: &str, value: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.codec.encode(value)?;
        let reply = self.conn.request(subject, payload, timeout).await?;
        self.codec.decode(&reply.payload)
    }

    pub async fn subscribe<T, F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: Fn(Decoded<T>) + Send + Sync + 'static,
    {
        let adapter = self.adapter(handler);
        self.conn.subscribe(subject, adapter).await
    }

    pub async fn queue_subscribe<T, F>(
        &self,
        subject: &str,
        queue: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: Fn(Decoded<T>) + Send + Sync + 'static,
    {
        let adapter = self.adapter(handler);
        self.conn.queue_subscribe(subject, queue, adapter).await
    }

    // Decode failures go to the error callback with the subscription's sid.
    fn adapter<T, F>(&self, handler: F) -> impl Fn(Message) + Send + Sync + 'static
    where
        T: DeserializeOwned + 'static,
        F: Fn(Decoded<T>) + Send + Sync + 'static,
    {
        let codec = Arc::clone(&self.codec);
        let shared: Weak<Shared> = Arc::downgrade(&self.conn.shared);
        move |msg: Message| {
            match codec.decode::<T>(&msg.payload) {
                Ok(value) => handler(Decoded {
                    subject: msg.subject,
                    reply: msg.reply,
                    value,
                }),
                Err(err) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.report_async(Some(msg.sid), Some(msg.subject), err);
                    }
                }
            }
        }
    }

    /// Publish every value sent on the returned channel to `subject`.
    pub fn bind_send_channel<T>(&self, subject: &str) -> mpsc::Sender<T>
    where
        T: Serialize + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<T>(SEND_CHANNEL_DEPTH);
        let conn = self.conn.clone();
        let codec = Arc::clone(&self.codec);
        let subject = subject.to_string();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                // Encode before awaiting so `T` need not be `Sync`.
                let published = match codec.encode(&value) {
                    Ok(payload) => conn.publish(&subject, payload).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = published {
                    tracing::warn!(subject = %subject, error = %err, "bound channel publish failed");
                    if matches!(err, Error::ConnectionClosed) {
                        break;
                    }
                }
            }
        });
        tx
    }

    /// Decode messages on `subject` into `sender` until the subscription
    /// ends or the receiving side goes away.
    pub async fn bind_recv_channel<T>(
        &self,
        subject: &str,
        sender: mpsc::Sender<T>,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let sub = self.conn.subscribe_sync(subject).await?;
        let reader = sub.clone();
        let codec = Arc::clone(&self.codec);
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(msg) => match codec.decode::<T>(&msg.payload) {
                        Ok(value) => {
                            if sender.send(value).await.is_err() {
                                let _ = reader.unsubscribe().await;
                                break;
                            }
                        }
                        Err(err) => {
                            reader
                                .shared
                                .report_async(Some(msg.sid), Some(msg.subject), err);
                        }
                    },
                    Err(Error::SlowConsumer { .. }) => continue,
                    Err(_) => break,
                }
            }
        });
        Ok(sub)
    }

    pub async fn flush(&self) -> Result<()> {
        self.conn.flush().await
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn json_codec_encodes_structs_and_strings() {
        let codec = JsonCodec;
        let person = Person {
            name: "derek".to_string(),
            age: 22,
        };
        let bytes = codec.encode(&person).expect("encode");
        assert_eq!(&bytes[..], br#"{"name":"derek","age":22}"#);
        let back: Person = codec.decode(&bytes).expect("decode");
        assert_eq!(back, person);

        assert_eq!(&codec.encode("hello").expect("encode")[..], b"\"hello\"");
    }

    #[test]
    fn json_codec_reports_bad_input() {
        let err = JsonCodec.decode::<Person>(b"not json").expect_err("invalid");
        assert!(matches!(err, Error::Codec(_)));
    }
}
