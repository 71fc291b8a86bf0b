// Per-link background tasks: the protocol reader and the ping timer.
use std::io;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};

use super::handshake::LinkReader;
use super::shared::{LinkFailure, Origin, Shared};
use crate::Error;

/// Read operations until the link ends, then hand the failure to the
/// connection. A reader for a replaced link exits without touching state.
pub(crate) fn run(shared: Arc<Shared>, mut reader: LinkReader, link_id: u64) -> BoxFuture<'static, ()> {
    async move {
        let failure = loop {
            match reader.next().await {
                Some(Ok(op)) => {
                    if let Some(failure) = shared.process_op(op, link_id) {
                        break failure;
                    }
                }
                Some(Err(err)) => {
                    break LinkFailure {
                        error: err.into(),
                        fatal: false,
                    };
                }
                None => {
                    break LinkFailure {
                        error: Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )),
                        fatal: false,
                    };
                }
            }
        };
        let mut io = shared.lock_io().await;
        if io.is_link(link_id) {
            shared
                .link_failed_locked(&mut io, failure.error, failure.fatal, Origin::Reader)
                .await;
        }
    }
    .boxed()
}

/// Send PING every `ping_interval`; the link is stale once more than
/// `max_pings_out` go unanswered.
pub(crate) fn pinger(shared: Arc<Shared>, link_id: u64) -> BoxFuture<'static, ()> {
    async move {
        let period = shared.options.ping_interval;
        if period.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !shared.ping_tick(link_id).await {
                return;
            }
        }
    }
    .boxed()
}
