// Incremental decoding of protocol operations from a byte buffer.
//
// Control lines are CRLF terminated and capped at `max_control_line`; PUB and
// MSG carry a length-prefixed payload that must be followed by CRLF. Decoders
// return `Ok(None)` until a full operation is buffered.
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::{
    ClientOp, ConnectInfo, DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD, ServerInfo, ServerOp,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_control_line: usize,
    pub max_payload: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Server-side codec: decodes client operations, encodes server operations.
#[derive(Debug, Clone, Default)]
pub struct ClientOpCodec {
    limits: Limits,
}

/// Client-side codec: decodes server operations, encodes client operations.
#[derive(Debug, Clone, Default)]
pub struct ServerOpCodec {
    limits: Limits,
}

impl ClientOpCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl ServerOpCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.limits.max_payload = max_payload;
    }
}

// Locate the end of the control line, excluding the CRLF.
fn find_line_end(src: &[u8], max_control_line: usize) -> Result<Option<usize>> {
    let window = src.len().min(max_control_line + 2);
    match src[..window].windows(2).position(|pair| pair == b"\r\n") {
        Some(pos) => Ok(Some(pos)),
        None if src.len() > max_control_line + 1 => Err(Error::MaxControlLine(max_control_line)),
        None => Ok(None),
    }
}

fn line_str(src: &[u8], end: usize) -> Result<&str> {
    std::str::from_utf8(&src[..end]).map_err(|_| Error::InvalidUtf8)
}

fn invalid(op: &'static str, line: &str) -> Error {
    Error::InvalidArgs {
        op,
        line: line.to_string(),
    }
}

fn parse_num<T: std::str::FromStr>(op: &'static str, line: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| invalid(op, line))
}

// Split `VERB rest`; the verb is case-sensitive.
fn split_verb(line: &str) -> (&str, &str) {
    match line.find([' ', '\t']) {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    }
}

// Consume a control line plus its length-prefixed payload, if fully buffered.
fn take_payload(
    src: &mut BytesMut,
    line_end: usize,
    size: usize,
    max_payload: usize,
) -> Result<Option<Bytes>> {
    if size > max_payload {
        return Err(Error::MaxPayload {
            size,
            max: max_payload,
        });
    }
    let start = line_end + 2;
    let total = start + size + 2;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    if &src[start + size..total] != b"\r\n" {
        return Err(Error::MissingPayloadTerminator);
    }
    let frame = src.split_to(total).freeze();
    Ok(Some(frame.slice(start..start + size)))
}

impl Decoder for ClientOpCodec {
    type Item = ClientOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientOp>> {
        let Some(end) = find_line_end(src, self.limits.max_control_line)? else {
            return Ok(None);
        };
        let line = line_str(src, end)?.to_string();
        let (verb, rest) = split_verb(&line);
        let op = match verb {
            "PUB" => {
                let args: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, reply_to, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some(reply.to_string()), *size),
                    _ => return Err(invalid("PUB", &line)),
                };
                let size: usize = parse_num("PUB", &line, size)?;
                let Some(payload) = take_payload(src, end, size, self.limits.max_payload)? else {
                    return Ok(None);
                };
                return Ok(Some(ClientOp::Pub {
                    subject: subject.to_string(),
                    reply_to,
                    payload,
                }));
            }
            "SUB" => {
                let args: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, queue_group, sid) = match args.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some(queue.to_string()), *sid),
                    _ => return Err(invalid("SUB", &line)),
                };
                ClientOp::Sub {
                    subject: subject.to_string(),
                    queue_group,
                    sid: parse_num("SUB", &line, sid)?,
                }
            }
            "UNSUB" => {
                let args: Vec<&str> = rest.split_ascii_whitespace().collect();
                match args.as_slice() {
                    [sid] => ClientOp::Unsub {
                        sid: parse_num("UNSUB", &line, sid)?,
                        max_msgs: None,
                    },
                    [sid, max] => ClientOp::Unsub {
                        sid: parse_num("UNSUB", &line, sid)?,
                        max_msgs: Some(parse_num("UNSUB", &line, max)?),
                    },
                    _ => return Err(invalid("UNSUB", &line)),
                }
            }
            "CONNECT" => {
                let info: ConnectInfo = serde_json::from_str(rest).map_err(Error::Deserialize)?;
                ClientOp::Connect(info)
            }
            "PING" => ClientOp::Ping,
            "PONG" => ClientOp::Pong,
            _ => return Err(Error::UnknownOp(line)),
        };
        let _ = src.split_to(end + 2);
        Ok(Some(op))
    }
}

impl Decoder for ServerOpCodec {
    type Item = ServerOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>> {
        let Some(end) = find_line_end(src, self.limits.max_control_line)? else {
            return Ok(None);
        };
        let line = line_str(src, end)?.to_string();
        let (verb, rest) = split_verb(&line);
        let op = match verb {
            "MSG" => {
                let args: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, sid, reply_to, size) = match args.as_slice() {
                    [subject, sid, size] => (*subject, *sid, None, *size),
                    [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
                    _ => return Err(invalid("MSG", &line)),
                };
                let sid: u64 = parse_num("MSG", &line, sid)?;
                let size: usize = parse_num("MSG", &line, size)?;
                let Some(payload) = take_payload(src, end, size, self.limits.max_payload)? else {
                    return Ok(None);
                };
                return Ok(Some(ServerOp::Msg {
                    subject: subject.to_string(),
                    sid,
                    reply_to,
                    payload,
                }));
            }
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(rest).map_err(Error::Deserialize)?;
                ServerOp::Info(info)
            }
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            _ => return Err(Error::UnknownOp(line)),
        };
        let _ = src.split_to(end + 2);
        Ok(Some(op))
    }
}

impl Encoder<ServerOp> for ClientOpCodec {
    type Error = Error;

    fn encode(&mut self, item: ServerOp, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

impl Encoder<ClientOp> for ServerOpCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}
