// Protocol operations and their line encoding.
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CRLF: &[u8] = b"\r\n";
/// Protocol revision spoken by this crate. Sent in INFO and CONNECT.
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_MAX_CONTROL_LINE: usize = 4096;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Server greeting sent as `INFO {json}` right after accept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: u32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub max_payload: usize,
}

/// Client options sent as `CONNECT {json}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default)]
    pub tls_required: bool,
}

/// Operations sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Ok,
    Err(String),
    Ping,
    Pong,
}

impl ClientOp {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ClientOp::Connect(info) => {
                let json = serde_json::to_vec(info).map_err(Error::Serialize)?;
                buf.reserve(json.len() + 10);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ClientOp::Pub {
                subject,
                reply_to,
                payload,
            } => {
                let header = match reply_to {
                    Some(reply) => format!("PUB {subject} {reply} {}\r\n", payload.len()),
                    None => format!("PUB {subject} {}\r\n", payload.len()),
                };
                put_with_payload(buf, header.as_bytes(), payload);
            }
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => {
                let line = match queue_group {
                    Some(queue) => format!("SUB {subject} {queue} {sid}\r\n"),
                    None => format!("SUB {subject} {sid}\r\n"),
                };
                buf.put_slice(line.as_bytes());
            }
            ClientOp::Unsub { sid, max_msgs } => {
                let line = match max_msgs {
                    Some(max) => format!("UNSUB {sid} {max}\r\n"),
                    None => format!("UNSUB {sid}\r\n"),
                };
                buf.put_slice(line.as_bytes());
            }
            ClientOp::Ping => buf.put_slice(b"PING\r\n"),
            ClientOp::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl ServerOp {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ServerOp::Info(info) => {
                let json = serde_json::to_vec(info).map_err(Error::Serialize)?;
                buf.reserve(json.len() + 7);
                buf.put_slice(b"INFO ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ServerOp::Msg {
                subject,
                sid,
                reply_to,
                payload,
            } => {
                let header = match reply_to {
                    Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
                    None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
                };
                put_with_payload(buf, header.as_bytes(), payload);
            }
            ServerOp::Ok => buf.put_slice(b"+OK\r\n"),
            ServerOp::Err(text) => {
                buf.put_slice(format!("-ERR '{text}'\r\n").as_bytes());
            }
            ServerOp::Ping => buf.put_slice(b"PING\r\n"),
            ServerOp::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_with_payload(buf: &mut BytesMut, header: &[u8], payload: &[u8]) {
    buf.reserve(header.len() + payload.len() + 2);
    buf.put_slice(header);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}
