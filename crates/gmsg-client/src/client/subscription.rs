// Subscription registry entries and the delivery targets behind them.
//
// The reader task hands every MSG to `SubEntry::deliver`, which never blocks:
// callback and queue targets sit behind unbounded channels guarded by the
// pending limits, and a request waiter is a single oneshot slot.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::Shared;
use crate::{Error, Message, Result};

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

const STATE_ACTIVE: u8 = 0;
const STATE_UNSUBSCRIBED: u8 = 1;
const STATE_MAX_REACHED: u8 = 2;
const STATE_CONNECTION_CLOSED: u8 = 3;

pub(crate) enum DeliveryTarget {
    Callback(mpsc::UnboundedSender<Message>),
    Queue(mpsc::UnboundedSender<Message>),
    Waiter(oneshot::Sender<Message>),
}

/// How a subscription is consumed.
pub(crate) enum TargetKind {
    Callback(MessageHandler),
    Queue,
    Waiter(oneshot::Sender<Message>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Ignored,
    /// Dropped; the subscription is already marked slow.
    Dropped,
    /// Dropped, and this message is the one that made the subscription slow.
    SlowConsumer,
    /// Delivered, and the subscription has now received its maximum.
    LimitReached,
}

pub(crate) struct SubEntry {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    target: Mutex<Option<DeliveryTarget>>,
    delivered: AtomicU64,
    max: AtomicU64,
    pending_msgs: AtomicUsize,
    pending_bytes: AtomicUsize,
    limit_msgs: AtomicUsize,
    limit_bytes: AtomicUsize,
    slow: AtomicBool,
    slow_unreported: AtomicBool,
    dropped: AtomicU64,
    state: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SubEntry {
    /// Build an entry and, for a queue target, the receiver `next_msg` reads.
    pub(crate) fn new(
        sid: u64,
        subject: &str,
        queue: Option<&str>,
        kind: TargetKind,
        limits: (usize, usize),
    ) -> (Arc<Self>, Option<mpsc::UnboundedReceiver<Message>>) {
        let mut receiver = None;
        let mut handler = None;
        let target = match kind {
            TargetKind::Callback(callback) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handler = Some((callback, rx));
                DeliveryTarget::Callback(tx)
            }
            TargetKind::Queue => {
                let (tx, rx) = mpsc::unbounded_channel();
                receiver = Some(rx);
                DeliveryTarget::Queue(tx)
            }
            TargetKind::Waiter(tx) => DeliveryTarget::Waiter(tx),
        };
        let entry = Arc::new(Self {
            sid,
            subject: subject.to_string(),
            queue: queue.map(str::to_string),
            target: Mutex::new(Some(target)),
            delivered: AtomicU64::new(0),
            max: AtomicU64::new(0),
            pending_msgs: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            limit_msgs: AtomicUsize::new(limits.0),
            limit_bytes: AtomicUsize::new(limits.1),
            slow: AtomicBool::new(false),
            slow_unreported: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
            worker: Mutex::new(None),
        });
        if let Some((callback, rx)) = handler {
            let worker = spawn_worker(Arc::clone(&entry), rx, callback);
            *entry.worker.lock() = Some(worker);
        }
        (entry, receiver)
    }

    pub(crate) fn deliver(&self, msg: Message) -> Delivery {
        if self.state.load(Ordering::Acquire) != STATE_ACTIVE {
            return Delivery::Ignored;
        }
        let count = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        let max = self.max.load(Ordering::Acquire);
        if max > 0 && count > max {
            return Delivery::Ignored;
        }
        let reached = max > 0 && count == max;

        let mut target = self.target.lock();
        if matches!(target.as_ref(), Some(DeliveryTarget::Waiter(_))) {
            if let Some(DeliveryTarget::Waiter(tx)) = target.take() {
                let _ = tx.send(msg);
            }
            self.state.store(STATE_MAX_REACHED, Ordering::Release);
            return Delivery::LimitReached;
        }
        let outcome = match target.as_ref() {
            None | Some(DeliveryTarget::Waiter(_)) => return Delivery::Ignored,
            Some(DeliveryTarget::Callback(tx)) | Some(DeliveryTarget::Queue(tx)) => {
                let size = msg.payload.len();
                if self.over_limits(size) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if self.slow.swap(true, Ordering::AcqRel) {
                        Delivery::Dropped
                    } else {
                        self.slow_unreported.store(true, Ordering::Release);
                        Delivery::SlowConsumer
                    }
                } else {
                    self.slow.store(false, Ordering::Release);
                    self.pending_msgs.fetch_add(1, Ordering::AcqRel);
                    self.pending_bytes.fetch_add(size, Ordering::AcqRel);
                    if tx.send(msg).is_err() {
                        self.release(size);
                        return Delivery::Ignored;
                    }
                    if reached {
                        Delivery::LimitReached
                    } else {
                        Delivery::Delivered
                    }
                }
            }
        };
        // The server stops at `max` whether or not the last message was
        // dropped here, so the entry retires either way.
        if reached {
            // Dropping the sender lets the consumer drain what is queued.
            *target = None;
            self.state.store(STATE_MAX_REACHED, Ordering::Release);
        }
        outcome
    }

    fn over_limits(&self, size: usize) -> bool {
        let limit_msgs = self.limit_msgs.load(Ordering::Acquire);
        let limit_bytes = self.limit_bytes.load(Ordering::Acquire);
        (limit_msgs > 0 && self.pending_msgs.load(Ordering::Acquire) + 1 > limit_msgs)
            || (limit_bytes > 0 && self.pending_bytes.load(Ordering::Acquire) + size > limit_bytes)
    }

    fn release(&self, size: usize) {
        self.pending_msgs.fetch_sub(1, Ordering::AcqRel);
        self.pending_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    pub(crate) fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::Release);
    }

    pub(crate) fn max(&self) -> u64 {
        self.max.load(Ordering::Acquire)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ACTIVE
    }

    pub(crate) fn reached_max(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_MAX_REACHED
    }

    /// Stop delivery, drop the target and abort the callback worker. A
    /// handler call already running finishes first.
    pub(crate) fn cancel(&self, connection_closed: bool) {
        let state = if connection_closed {
            STATE_CONNECTION_CLOSED
        } else {
            STATE_UNSUBSCRIBED
        };
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            state,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.target.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    /// Stop delivery once the maximum is reached by an UNSUB with a count
    /// already behind the delivered counter.
    pub(crate) fn finish(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_MAX_REACHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.target.lock().take();
    }

    fn is_cancelled(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            STATE_UNSUBSCRIBED | STATE_CONNECTION_CLOSED
        )
    }

    fn closed_error(&self) -> Error {
        match self.state.load(Ordering::Acquire) {
            STATE_MAX_REACHED => Error::MaxMessages,
            STATE_CONNECTION_CLOSED => Error::ConnectionClosed,
            _ => Error::BadSubscription,
        }
    }
}

fn spawn_worker(
    entry: Arc<SubEntry>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    handler: MessageHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            entry.release(msg.payload.len());
            if entry.is_cancelled() {
                break;
            }
            handler(msg);
        }
    })
}

/// Handle to a subscription.
///
/// Dropping the handle does not unsubscribe; callback subscriptions keep
/// running until [`Subscription::unsubscribe`] or connection close.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) entry: Arc<SubEntry>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) receiver: Option<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.entry.sid)
            .field("subject", &self.entry.subject)
            .field("queue", &self.entry.queue)
            .finish()
    }
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.entry.sid
    }

    pub fn subject(&self) -> &str {
        &self.entry.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.entry.queue.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.entry.is_active()
    }

    /// Messages counted against the auto-unsubscribe limit so far.
    pub fn delivered(&self) -> u64 {
        self.entry.delivered()
    }

    pub fn dropped(&self) -> u64 {
        self.entry.dropped.load(Ordering::Relaxed)
    }

    /// Messages and bytes queued but not yet consumed.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.entry.pending_msgs.load(Ordering::Acquire),
            self.entry.pending_bytes.load(Ordering::Acquire),
        )
    }

    /// Zero disables a limit.
    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) {
        self.entry.limit_msgs.store(msgs, Ordering::Release);
        self.entry.limit_bytes.store(bytes, Ordering::Release);
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.shared.unsubscribe(self.entry.sid, None).await
    }

    /// Remove the subscription after `max` messages in total.
    pub async fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        self.shared.unsubscribe(self.entry.sid, Some(max)).await
    }

    /// Next message on a synchronous subscription.
    ///
    /// A subscription that dropped messages reports [`Error::SlowConsumer`]
    /// once before delivering again.
    pub async fn next_msg(&self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Like [`Subscription::next_msg`] without a deadline.
    pub async fn recv(&self) -> Result<Message> {
        let Some(receiver) = &self.receiver else {
            return Err(Error::SyncSubscriptionRequired);
        };
        if self.entry.is_cancelled() {
            return Err(self.entry.closed_error());
        }
        if self.entry.slow_unreported.swap(false, Ordering::AcqRel) {
            return Err(Error::SlowConsumer {
                sid: self.entry.sid,
                subject: self.entry.subject.clone(),
            });
        }
        let mut rx = receiver.lock().await;
        match rx.recv().await {
            Some(msg) => {
                self.entry.release(msg.payload.len());
                Ok(msg)
            }
            None => Err(self.entry.closed_error()),
        }
    }
}
