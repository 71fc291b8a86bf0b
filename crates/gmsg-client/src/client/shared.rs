// State shared by a connection handle and its background tasks.
//
// All writes to the server go through `io`, an async mutex that also holds
// the link state, so a write, a state transition and a subscription replay can
// never interleave. Everything else lives behind short synchronous locks that
// are never held across an await.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use gmsg_transport::BoxWriter;
use gmsg_wire::{ClientOp, ServerInfo, ServerOp};
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::callbacks::{AsyncError, Event, EventQueue};
use super::pending::PendingBuffer;
use super::pool::ServerPool;
use super::reconnect;
use super::subscription::{Delivery, SubEntry, Subscription, TargetKind};
use super::{Connection, Statistics, Status};
use crate::config::{Options, ServerUrl};
use crate::{Error, Message, Result};

pub(crate) const PING_OP: &[u8] = b"PING\r\n";
pub(crate) const PONG_OP: &[u8] = b"PONG\r\n";
const INBOX_PREFIX: &str = "_INBOX";
const INBOX_TOKEN_LEN: usize = 22;

pub(crate) enum IoState {
    Connected {
        writer: BufWriter<BoxWriter>,
        link_id: u64,
    },
    Reconnecting(PendingBuffer),
    Closed,
}

impl IoState {
    pub(crate) fn is_link(&self, id: u64) -> bool {
        matches!(self, IoState::Connected { link_id, .. } if *link_id == id)
    }
}

/// The task that observed a failure. It is never aborted by its own cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Caller,
    Reader,
    Pinger,
    Reconnect,
}

#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub(crate) error: Error,
    pub(crate) fatal: bool,
}

#[derive(Default)]
pub(crate) struct Tasks {
    reader: Option<JoinHandle<()>>,
    pinger: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&mut self, origin: Origin) {
        let handles = [
            (Origin::Reader, &mut self.reader),
            (Origin::Pinger, &mut self.pinger),
            (Origin::Reconnect, &mut self.reconnect),
        ];
        for (owner, slot) in handles {
            if owner != origin
                && let Some(handle) = slot.take()
            {
                handle.abort();
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

pub(crate) struct Shared {
    pub(crate) options: Options,
    io: tokio::sync::Mutex<IoState>,
    status: Mutex<Status>,
    pub(crate) pool: Mutex<ServerPool>,
    info: Mutex<Option<ServerInfo>>,
    max_payload: AtomicUsize,
    pongs: Mutex<VecDeque<Option<oneshot::Sender<()>>>>,
    pings_out: AtomicU32,
    subs: Mutex<BTreeMap<u64, Arc<SubEntry>>>,
    next_sid: AtomicU64,
    next_link: AtomicU64,
    tasks: Mutex<Tasks>,
    events: EventQueue,
    counters: Counters,
    last_error: Mutex<Option<String>>,
    inbox_prefix: String,
    next_inbox: AtomicU64,
}

impl Shared {
    pub(crate) fn new(options: Options, urls: Vec<ServerUrl>) -> Self {
        let events = EventQueue::start(options.callbacks.clone());
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(INBOX_TOKEN_LEN)
            .map(char::from)
            .collect();
        Self {
            options,
            io: tokio::sync::Mutex::new(IoState::Closed),
            status: Mutex::new(Status::Disconnected),
            pool: Mutex::new(ServerPool::new(urls)),
            info: Mutex::new(None),
            max_payload: AtomicUsize::new(0),
            pongs: Mutex::new(VecDeque::new()),
            pings_out: AtomicU32::new(0),
            subs: Mutex::new(BTreeMap::new()),
            next_sid: AtomicU64::new(0),
            next_link: AtomicU64::new(0),
            tasks: Mutex::new(Tasks::default()),
            events,
            counters: Counters::default(),
            last_error: Mutex::new(None),
            inbox_prefix: format!("{INBOX_PREFIX}.{token}"),
            next_inbox: AtomicU64::new(0),
        }
    }

    pub(crate) fn connection(self: &Arc<Self>) -> Connection {
        Connection {
            shared: Arc::clone(self),
        }
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub(crate) fn record_error(&self, error: &Error) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn server_info(&self) -> Option<ServerInfo> {
        self.info.lock().clone()
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> Statistics {
        Statistics {
            in_msgs: self.counters.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.counters.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.counters.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.counters.out_bytes.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn new_inbox(&self) -> String {
        let seq = self.next_inbox.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{seq}", self.inbox_prefix)
    }

    pub(crate) fn report_async(self: &Arc<Self>, sid: Option<u64>, subject: Option<String>, error: Error) {
        self.events.push(Event::Error(
            self.connection(),
            AsyncError {
                sid,
                subject,
                error,
            },
        ));
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) async fn lock_io(&self) -> tokio::sync::MutexGuard<'_, IoState> {
        self.io.lock().await
    }

    /// Record a freshly installed link. Called with the io lock held.
    pub(crate) fn link_established(
        &self,
        idx: usize,
        info: ServerInfo,
        reader: JoinHandle<()>,
        pinger: JoinHandle<()>,
    ) {
        if info.max_payload > 0 {
            self.max_payload.store(info.max_payload, Ordering::Release);
        }
        *self.info.lock() = Some(info);
        self.pool.lock().mark_connected(idx);
        self.pings_out.store(0, Ordering::Release);
        self.set_status(Status::Connected);
        let mut tasks = self.tasks.lock();
        tasks.reader = Some(reader);
        tasks.pinger = Some(pinger);
    }

    pub(crate) fn reconnected(self: &Arc<Self>) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gmsg_client_reconnects_total").increment(1);
        self.events.push(Event::Reconnected(self.connection()));
    }

    /// SUB for every live subscription in creation order, with the remaining
    /// count for those that auto-unsubscribe.
    pub(crate) fn encode_replay(&self, buf: &mut BytesMut) -> Result<()> {
        let subs = self.subs.lock();
        for entry in subs.values().filter(|entry| entry.is_active()) {
            ClientOp::Sub {
                subject: entry.subject.clone(),
                queue_group: entry.queue.clone(),
                sid: entry.sid,
            }
            .encode(buf)?;
            let max = entry.max();
            if max > 0 {
                let remaining = max.saturating_sub(entry.delivered());
                if remaining > 0 {
                    ClientOp::Unsub {
                        sid: entry.sid,
                        max_msgs: Some(remaining),
                    }
                    .encode(buf)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn send_op(self: &Arc<Self>, op: &[u8], carry_over: bool) -> Result<()> {
        let mut io = self.io.lock().await;
        self.write_locked(&mut io, op, carry_over, Origin::Caller).await
    }

    /// Write one encoded operation. While reconnecting the operation is
    /// buffered. If the live link fails mid-write, `carry_over` decides
    /// whether the operation moves to the reconnect buffer.
    pub(crate) async fn write_locked(
        self: &Arc<Self>,
        io: &mut IoState,
        op: &[u8],
        carry_over: bool,
        origin: Origin,
    ) -> Result<()> {
        let err = match io {
            IoState::Closed => return Err(Error::ConnectionClosed),
            IoState::Reconnecting(pending) => return pending.push(op),
            IoState::Connected { writer, .. } => match write_flush(writer, op).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            },
        };
        self.link_failed_locked(io, Error::Io(err), false, origin).await;
        match io {
            IoState::Reconnecting(pending) if carry_over => pending.push(op),
            IoState::Reconnecting(_) => Err(Error::Disconnected),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// SUB and UNSUB. The server learns about subscriptions on the next link
    /// through the replay, so nothing is buffered while reconnecting.
    async fn write_control_locked(self: &Arc<Self>, io: &mut IoState, op: &[u8]) -> Result<()> {
        if matches!(io, IoState::Reconnecting(_)) {
            return Ok(());
        }
        match self.write_locked(io, op, false, Origin::Caller).await {
            Ok(()) | Err(Error::Disconnected) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// React to losing the current link: reconnect when allowed, otherwise
    /// close. A no-op unless the link is still the connected one.
    pub(crate) async fn link_failed_locked(
        self: &Arc<Self>,
        io: &mut IoState,
        error: Error,
        fatal: bool,
        origin: Origin,
    ) {
        if !matches!(io, IoState::Connected { .. }) {
            return;
        }
        tracing::warn!(error = %error, fatal, "server link lost");
        self.record_error(&error);
        if fatal || !self.options.allow_reconnect {
            self.close_locked(io, origin).await;
            return;
        }
        *io = IoState::Reconnecting(PendingBuffer::new(self.options.reconnect_buf_size));
        self.set_status(Status::Reconnecting);
        self.pongs.lock().clear();
        self.pings_out.store(0, Ordering::Release);
        metrics::counter!("gmsg_client_disconnects_total").increment(1);
        self.events.push(Event::Disconnected(self.connection()));
        let mut tasks = self.tasks.lock();
        tasks.abort(origin);
        tasks.reconnect = Some(tokio::spawn(reconnect::run(Arc::clone(self))));
    }

    /// Close for good. Idempotent. Tasks are aborted last since `origin` may
    /// be running this very code.
    pub(crate) async fn close_locked(self: &Arc<Self>, io: &mut IoState, origin: Origin) {
        let was_connected = match std::mem::replace(io, IoState::Closed) {
            IoState::Closed => return,
            IoState::Connected { mut writer, .. } => {
                let shutdown = async {
                    writer.flush().await?;
                    writer.shutdown().await
                };
                if let Ok(Err(err)) = tokio::time::timeout(self.options.timeout, shutdown).await {
                    tracing::debug!(error = %err, "link shutdown failed");
                }
                true
            }
            IoState::Reconnecting(_) => false,
        };
        self.set_status(Status::Closed);
        self.pongs.lock().clear();
        let subs = std::mem::take(&mut *self.subs.lock());
        for entry in subs.values() {
            entry.cancel(true);
        }
        let conn = self.connection();
        if was_connected {
            self.events.push(Event::Disconnected(conn.clone()));
        }
        self.events.push(Event::Closed(conn));
        tracing::debug!("connection closed");
        self.tasks.lock().abort(origin);
    }

    pub(crate) async fn close(self: &Arc<Self>) {
        let mut io = self.io.lock().await;
        self.close_locked(&mut io, Origin::Caller).await;
    }

    pub(crate) async fn flush(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut io = self.io.lock().await;
            if matches!(*io, IoState::Closed) {
                return Err(Error::ConnectionClosed);
            }
            self.pongs.lock().push_back(Some(tx));
            if let Err(err) = self.write_locked(&mut io, PING_OP, false, Origin::Caller).await {
                if matches!(err, Error::ReconnectBufferExceeded) {
                    self.pongs.lock().pop_back();
                }
                return Err(err);
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) if self.is_closed() => Err(Error::ConnectionClosed),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// One ping-timer tick. Returns false once the timer should stop.
    pub(crate) async fn ping_tick(self: &Arc<Self>, link_id: u64) -> bool {
        let mut io = self.io.lock().await;
        if !io.is_link(link_id) {
            return false;
        }
        let outstanding = self.pings_out.fetch_add(1, Ordering::AcqRel) + 1;
        if outstanding > self.options.max_pings_out {
            self.link_failed_locked(&mut io, Error::StaleConnection, false, Origin::Pinger)
                .await;
            return false;
        }
        self.pongs.lock().push_back(None);
        self.write_locked(&mut io, PING_OP, false, Origin::Pinger)
            .await
            .is_ok()
    }

    async fn send_pong(self: Arc<Self>, link_id: u64) {
        let mut io = self.io.lock().await;
        if io.is_link(link_id) {
            let _ = self.write_locked(&mut io, PONG_OP, false, Origin::Caller).await;
        }
    }

    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        kind: TargetKind,
    ) -> Result<Subscription> {
        gmsg_wire::subject::validate_pattern(subject)
            .map_err(|_| Error::BadSubject(subject.to_string()))?;
        if let Some(queue) = queue
            && (queue.is_empty() || queue.chars().any(char::is_whitespace))
        {
            return Err(Error::BadSubject(queue.to_string()));
        }
        let mut io = self.io.lock().await;
        if matches!(*io, IoState::Closed) {
            return Err(Error::ConnectionClosed);
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let limits = (
            self.options.pending_msgs_limit,
            self.options.pending_bytes_limit,
        );
        let (entry, receiver) = SubEntry::new(sid, subject, queue, kind, limits);
        self.subs.lock().insert(sid, Arc::clone(&entry));
        let op = ClientOp::Sub {
            subject: subject.to_string(),
            queue_group: queue.map(str::to_string),
            sid,
        }
        .to_bytes()?;
        self.write_control_locked(&mut io, &op).await?;
        Ok(Subscription {
            entry,
            shared: Arc::clone(self),
            receiver: receiver.map(|rx| Arc::new(tokio::sync::Mutex::new(rx))),
        })
    }

    /// Remove `sid` now, or after `max` messages in total.
    pub(crate) async fn unsubscribe(self: &Arc<Self>, sid: u64, max: Option<u64>) -> Result<()> {
        let mut io = self.io.lock().await;
        if matches!(*io, IoState::Closed) {
            return Err(Error::ConnectionClosed);
        }
        let entry = self
            .subs
            .lock()
            .get(&sid)
            .cloned()
            .ok_or(Error::BadSubscription)?;
        match max {
            Some(max) if max > entry.delivered() => entry.set_max(max),
            Some(_) => {
                self.subs.lock().remove(&sid);
                entry.finish();
            }
            None => {
                self.subs.lock().remove(&sid);
                entry.cancel(false);
            }
        }
        let op = ClientOp::Unsub { sid, max_msgs: max }.to_bytes()?;
        self.write_control_locked(&mut io, &op).await
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub(crate) fn count_out(&self, size: usize) {
        self.counters.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.counters.out_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Handle one operation read from link `link_id`. Returns the failure
    /// that ends the link, if any.
    pub(crate) fn process_op(self: &Arc<Self>, op: ServerOp, link_id: u64) -> Option<LinkFailure> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply_to,
                payload,
            } => self.deliver(Message::delivered(subject, reply_to, payload, sid)),
            ServerOp::Ping => {
                tokio::spawn(Arc::clone(self).send_pong(link_id));
            }
            ServerOp::Pong => {
                self.pings_out.store(0, Ordering::Release);
                if let Some(Some(waiter)) = self.pongs.lock().pop_front() {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Ok => {}
            ServerOp::Info(info) => {
                if info.max_payload > 0 {
                    self.max_payload.store(info.max_payload, Ordering::Release);
                }
                *self.info.lock() = Some(info);
            }
            ServerOp::Err(text) => {
                let error = Error::from_server_text(&text);
                if error.is_async_protocol_error() {
                    self.record_error(&error);
                    self.report_async(None, None, error);
                } else {
                    let fatal = !matches!(error, Error::StaleConnection);
                    return Some(LinkFailure { error, fatal });
                }
            }
        }
        None
    }

    fn deliver(self: &Arc<Self>, msg: Message) {
        self.counters.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .in_bytes
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
        // Delivery never blocks, so the registry lock covers it and a
        // finished subscription is gone before its consumer wakes.
        let mut subs = self.subs.lock();
        let Some(entry) = subs.get(&msg.sid).cloned() else {
            return;
        };
        let outcome = entry.deliver(msg);
        if entry.reached_max() {
            subs.remove(&entry.sid);
        }
        drop(subs);
        match outcome {
            Delivery::Delivered | Delivery::Ignored | Delivery::LimitReached => {}
            Delivery::Dropped => {
                metrics::counter!("gmsg_client_slow_consumer_drops_total").increment(1);
            }
            Delivery::SlowConsumer => {
                metrics::counter!("gmsg_client_slow_consumer_drops_total").increment(1);
                tracing::warn!(sid = entry.sid, subject = %entry.subject, "slow consumer, dropping messages");
                self.report_async(
                    Some(entry.sid),
                    Some(entry.subject.clone()),
                    Error::SlowConsumer {
                        sid: entry.sid,
                        subject: entry.subject.clone(),
                    },
                );
            }
        }
    }
}

async fn write_flush(writer: &mut BufWriter<BoxWriter>, op: &[u8]) -> std::io::Result<()> {
    writer.write_all(op).await?;
    writer.flush().await
}
