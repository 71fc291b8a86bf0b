use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection lost before the operation completed")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("no servers available for connection")]
    NoServers,
    #[error("authorization violation")]
    Authorization,
    #[error("server speaks protocol {got}, need at least {min}")]
    ProtocolMismatch { min: u32, got: u32 },
    #[error("secure connection required by server")]
    SecureConnectionRequired,
    #[error("secure connection not available on server")]
    SecureConnectionWanted,
    #[error("stale connection")]
    StaleConnection,
    #[error("{0}")]
    Server(String),
    #[error("{0}")]
    PermissionsViolation(String),
    #[error("slow consumer, messages dropped on subscription {sid} ({subject})")]
    SlowConsumer { sid: u64, subject: String },
    #[error("invalid subject {0:?}")]
    BadSubject(String),
    #[error("invalid subscription")]
    BadSubscription,
    #[error("maximum messages delivered")]
    MaxMessages,
    #[error("operation requires a synchronous subscription")]
    SyncSubscriptionRequired,
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayload { size: usize, max: usize },
    #[error("reconnect buffer exceeded")]
    ReconnectBufferExceeded,
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] gmsg_wire::Error),
}

impl Error {
    /// Map `-ERR` text from the server to an error. Text is compared
    /// case-insensitively with quotes stripped.
    pub(crate) fn from_server_text(text: &str) -> Self {
        let normalized = text.trim().trim_matches('\'').to_lowercase();
        if normalized == "authorization violation" {
            Error::Authorization
        } else if normalized == "stale connection" {
            Error::StaleConnection
        } else if normalized.starts_with("permissions violation") {
            Error::PermissionsViolation(normalized)
        } else {
            Error::Server(normalized)
        }
    }

    /// True for `-ERR` replies that leave the link usable.
    pub(crate) fn is_async_protocol_error(&self) -> bool {
        match self {
            Error::PermissionsViolation(_) => true,
            Error::Server(text) => text.starts_with("invalid subject"),
            _ => false,
        }
    }
}
