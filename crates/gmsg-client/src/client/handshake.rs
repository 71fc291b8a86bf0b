// Link setup: dial, read INFO, send CONNECT and wait for the PONG that
// confirms the server accepted it.
use std::io;

use futures::StreamExt;
use gmsg_transport::{BoxReader, BoxWriter, Link};
use gmsg_wire::{ClientOp, ServerInfo, ServerOp, ServerOpCodec};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::codec::FramedRead;

use super::shared::{PING_OP, PONG_OP, Shared};
use crate::config::{MIN_SERVER_PROTOCOL, ServerUrl};
use crate::{Error, Result};

pub(crate) type LinkReader = FramedRead<BoxReader, ServerOpCodec>;

pub(crate) struct Established {
    pub(crate) reader: LinkReader,
    pub(crate) writer: BufWriter<BoxWriter>,
    pub(crate) info: ServerInfo,
}

pub(crate) async fn establish(shared: &Shared, url: &ServerUrl) -> Result<Established> {
    let timeout = shared.options.timeout;
    let dialer = &shared.options.dialer;
    let link = dialer.dial(&url.addr(), timeout).await?;
    let Link {
        reader,
        writer,
        peer,
    } = link;
    let mut reader = FramedRead::new(reader, ServerOpCodec::default());

    let info = match next_op(&mut reader, timeout).await? {
        ServerOp::Info(info) => info,
        other => {
            return Err(Error::Server(format!(
                "expected INFO from {peer}, got {other:?}"
            )));
        }
    };
    if info.proto < MIN_SERVER_PROTOCOL {
        return Err(Error::ProtocolMismatch {
            min: MIN_SERVER_PROTOCOL,
            got: info.proto,
        });
    }

    let want_secure = shared.options.secure || url.is_secure();
    if info.tls_required && !want_secure {
        return Err(Error::SecureConnectionRequired);
    }
    if want_secure && !info.tls_required {
        return Err(Error::SecureConnectionWanted);
    }
    let (mut reader, writer) = if want_secure {
        let link = Link {
            reader: reader.into_inner(),
            writer,
            peer,
        };
        let secured = dialer.upgrade(link, &url.host).await?;
        (
            FramedRead::new(secured.reader, ServerOpCodec::default()),
            secured.writer,
        )
    } else {
        (reader, writer)
    };
    if info.max_payload > 0 {
        reader.decoder_mut().set_max_payload(info.max_payload);
    }

    let mut writer = BufWriter::new(writer);
    let connect = ClientOp::Connect(shared.options.connect_info(url, want_secure)).to_bytes()?;
    writer.write_all(&connect).await?;
    writer.write_all(PING_OP).await?;
    writer.flush().await?;

    let mut info = info;
    loop {
        match next_op(&mut reader, timeout).await? {
            ServerOp::Pong => break,
            ServerOp::Ok | ServerOp::Msg { .. } => {}
            ServerOp::Ping => {
                writer.write_all(PONG_OP).await?;
                writer.flush().await?;
            }
            ServerOp::Info(update) => info = update,
            ServerOp::Err(text) => return Err(Error::from_server_text(&text)),
        }
    }
    Ok(Established {
        reader,
        writer,
        info,
    })
}

async fn next_op(reader: &mut LinkReader, timeout: std::time::Duration) -> Result<ServerOp> {
    match tokio::time::timeout(timeout, reader.next()).await {
        Err(_) => Err(Error::Timeout),
        Ok(None) => Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection during handshake",
        ))),
        Ok(Some(result)) => Ok(result?),
    }
}
