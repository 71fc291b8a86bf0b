// Lifecycle and async-error callbacks.
//
// Callbacks never run on the task that detected the event: the reader, the
// reconnect loop, and callers of `close` only enqueue an event, and a single
// dispatcher task invokes user code in enqueue order. A callback may therefore
// call back into the connection without deadlocking.
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::Connection;
use crate::Error;

pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Connection, AsyncError) + Send + Sync>;

/// An error raised outside any caller's operation, such as a slow consumer
/// or a permission violation reported by the server.
#[derive(Debug)]
pub struct AsyncError {
    pub sid: Option<u64>,
    pub subject: Option<String>,
    pub error: Error,
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.sid, &self.subject) {
            (Some(sid), Some(subject)) => write!(f, "{} (sid {sid}, subject {subject})", self.error),
            _ => write!(f, "{}", self.error),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) disconnected: Option<ConnectionCallback>,
    pub(crate) reconnected: Option<ConnectionCallback>,
    pub(crate) closed: Option<ConnectionCallback>,
    pub(crate) error: Option<ErrorCallback>,
}

pub(crate) enum Event {
    Disconnected(Connection),
    Reconnected(Connection),
    Closed(Connection),
    Error(Connection, AsyncError),
}

/// Sending half of the dispatcher queue.
#[derive(Debug)]
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventQueue {
    /// Spawn the dispatcher. It exits once every sender is dropped and the
    /// queue drains.
    pub(crate) fn start(callbacks: Callbacks) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callbacks.dispatch(event);
            }
        });
        Self { tx }
    }

    pub(crate) fn push(&self, event: Event) {
        // Fails only after the runtime dropped the dispatcher.
        let _ = self.tx.send(event);
    }
}

impl Callbacks {
    fn dispatch(&self, event: Event) {
        match event {
            Event::Disconnected(conn) => {
                if let Some(callback) = &self.disconnected {
                    callback(&conn);
                }
            }
            Event::Reconnected(conn) => {
                if let Some(callback) = &self.reconnected {
                    callback(&conn);
                }
            }
            Event::Closed(conn) => {
                if let Some(callback) = &self.closed {
                    callback(&conn);
                }
            }
            Event::Error(conn, error) => match &self.error {
                Some(callback) => callback(&conn, error),
                None => tracing::warn!(error = %error, "unhandled async error"),
            },
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Disconnected(_) => f.write_str("Disconnected"),
            Event::Reconnected(_) => f.write_str("Reconnected"),
            Event::Closed(_) => f.write_str("Closed"),
            Event::Error(_, error) => write!(f, "Error({error})"),
        }
    }
}
