//! Text protocol spoken between gmessage clients and the broker.
//!
//! Operations are CRLF-terminated control lines with case-sensitive verbs.
//! `PUB` and `MSG` carry a length-prefixed payload, and `INFO` and `CONNECT`
//! carry a JSON object.
pub mod codec;
pub mod proto;
pub mod subject;

pub use codec::{ClientOpCodec, Limits, ServerOpCodec};
pub use proto::{
    ClientOp, ConnectInfo, DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD, PROTOCOL_VERSION,
    ServerInfo, ServerOp,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("unknown protocol operation {0:?}")]
    UnknownOp(String),
    #[error("invalid arguments for {op}: {line:?}")]
    InvalidArgs { op: &'static str, line: String },
    #[error("control line exceeds {0} bytes")]
    MaxControlLine(usize),
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    MaxPayload { size: usize, max: usize },
    #[error("payload not terminated by CRLF")]
    MissingPayloadTerminator,
    #[error("control line is not valid utf-8")]
    InvalidUtf8,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
