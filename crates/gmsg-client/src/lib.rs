//! Client for the gmessage broker.
//!
//! # Purpose
//! [`Connection`] speaks the text protocol to one server at a time out of a
//! pool, keeps subscriptions alive across reconnects, and offers
//! request/reply on top of inbox subjects. [`EncodedConnection`] adds typed
//! payloads through a [`Codec`].
//!
//! # Key invariants
//! - Operations from one caller reach the server in call order; a reconnect
//!   re-sends subscriptions before anything buffered while disconnected.
//! - Publishing never waits on a slow subscriber. Messages past a
//!   subscription's pending limits are dropped and reported once.
//! - After [`Connection::close`] returns, every operation fails with
//!   [`Error::ConnectionClosed`] and no handler runs again.
//!
//! # Examples
//! ```no_run
//! # async fn run() -> gmsg_client::Result<()> {
//! use std::time::Duration;
//!
//! let conn = gmsg_client::connect("gio://127.0.0.1:4222").await?;
//! let sub = conn.subscribe_sync("updates").await?;
//! conn.publish("updates", "hello").await?;
//! let msg = sub.next_msg(Duration::from_secs(1)).await?;
//! assert_eq!(&msg.payload[..], b"hello");
//! conn.close().await;
//! # Ok(())
//! # }
//! ```
pub(crate) mod client;
pub mod config;
mod encoded;
mod error;
mod message;

pub use client::{
    AsyncError, Connection, ConnectionCallback, ErrorCallback, MessageHandler, Statistics, Status,
    Subscription,
};
pub use config::{DEFAULT_URL, Options, ServerUrl};
pub use encoded::{Codec, Decoded, EncodedConnection, JsonCodec};
pub use error::{Error, Result};
pub use message::Message;

/// Connect to `url` with default options.
pub async fn connect(url: &str) -> Result<Connection> {
    Options::new().url(url).connect().await
}
