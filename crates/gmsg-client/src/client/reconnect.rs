// Link installation and the reconnect loop.
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;

use super::handshake::{self, Established};
use super::pending::PendingBuffer;
use super::reader;
use super::shared::{IoState, Origin, Shared};
use crate::{Error, Result};

/// Make `link` the connection's live link.
///
/// With `replay` set this finishes a reconnect: subscriptions are re-sent in
/// creation order, then the operations buffered while disconnected, all
/// before any new caller can write. Returns `Ok(false)` if the connection was
/// closed while the link was being set up.
pub(crate) async fn install_link(
    shared: &Arc<Shared>,
    idx: usize,
    link: Established,
    replay: bool,
) -> Result<bool> {
    let Established {
        reader,
        mut writer,
        info,
    } = link;
    let mut io = shared.lock_io().await;
    if replay {
        let IoState::Reconnecting(pending) = &mut *io else {
            return Ok(false);
        };
        let limit = shared.options.reconnect_buf_size;
        let pending = std::mem::replace(pending, PendingBuffer::new(limit));
        tracing::debug!(buffered_bytes = pending.len(), "replaying subscriptions");
        let pending = pending.into_bytes();
        let mut replayed = BytesMut::new();
        let written = match shared.encode_replay(&mut replayed) {
            Ok(()) => {
                async {
                    writer.write_all(&replayed).await?;
                    writer.write_all(&pending).await?;
                    writer.flush().await
                }
                .await
                .map_err(Error::from)
            }
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            *io = IoState::Reconnecting(PendingBuffer::restore(pending, limit));
            return Err(err);
        }
    }

    let link_id = shared.next_link_id();
    *io = IoState::Connected { writer, link_id };
    let reader_task = tokio::spawn(reader::run(Arc::clone(shared), reader, link_id));
    let pinger_task = tokio::spawn(reader::pinger(Arc::clone(shared), link_id));
    shared.link_established(idx, info, reader_task, pinger_task);
    if replay {
        shared.reconnected();
    }
    Ok(true)
}

/// Walk the server pool until a link is installed or every server has used
/// up its attempts, in which case the connection closes.
pub(crate) fn run(shared: Arc<Shared>) -> BoxFuture<'static, ()> {
    async move {
        loop {
            let candidate = shared
                .pool
                .lock()
                .next_candidate(shared.options.max_reconnect, shared.options.reconnect_wait);
            let Some((idx, url, wait)) = candidate else {
                break;
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            if shared.is_closed() {
                return;
            }
            shared.pool.lock().record_attempt(idx);
            tracing::debug!(server = %url, "attempting reconnect");
            let link = match handshake::establish(&shared, &url).await {
                Ok(link) => link,
                Err(err) => {
                    tracing::debug!(server = %url, error = %err, "reconnect attempt failed");
                    shared.record_error(&err);
                    continue;
                }
            };
            match install_link(&shared, idx, link, true).await {
                Ok(true) => {
                    tracing::info!(server = %url, "reconnected");
                    return;
                }
                Ok(false) => return,
                Err(err) => {
                    tracing::warn!(server = %url, error = %err, "replay after reconnect failed");
                    shared.record_error(&err);
                }
            }
        }

        let mut io = shared.lock_io().await;
        if matches!(*io, IoState::Reconnecting(_)) {
            tracing::warn!("reconnect attempts exhausted, closing connection");
            shared.record_error(&Error::NoServers);
            shared.close_locked(&mut io, Origin::Reconnect).await;
        }
    }
    .boxed()
}
