// Routing core shared by every client connection of one broker process.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use bytes::Bytes;
use gmsg_wire::ServerOp;
use gmsg_wire::subject;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::sublist::{Sublist, SublistError};
use crate::{BrokerError, Result};

pub type ClientId = u64;

pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 8192;

/// Broker-side view of one connected client.
///
/// All outbound traffic for the client (deliveries and protocol replies) goes
/// through one bounded queue drained by the connection's writer task, which
/// keeps MSG and PONG in the order they were produced.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    sender: mpsc::Sender<ServerOp>,
    subs: Mutex<HashMap<u64, Arc<Subscriber>, RandomState>>,
    dropped: AtomicU64,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a protocol reply, waiting for room if the client is behind.
    pub async fn send(&self, op: ServerOp) -> Result<()> {
        self.sender
            .send(op)
            .await
            .map_err(|_| BrokerError::ClientGone(self.id))
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    /// Messages dropped because the client's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One SUB registration of one client.
#[derive(Debug)]
pub struct Subscriber {
    client_id: ClientId,
    sid: u64,
    subject: String,
    queue: Option<String>,
    sender: mpsc::Sender<ServerOp>,
    client: Weak<ClientHandle>,
    delivered: AtomicU64,
    // Zero means no auto-unsubscribe limit.
    max: AtomicU64,
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id && self.sid == other.sid
    }
}

impl Subscriber {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

enum Delivery {
    Sent { limit_reached: bool },
    Skipped,
}

/// Interest registry plus fan-out.
///
/// Queue groups pick one member per publish with a broker-wide round-robin
/// cursor taken modulo the group size, members in registration order. A
/// member that cannot take the message passes it to the next one.
#[derive(Debug, Default)]
pub struct Broker {
    sublist: Sublist<Arc<Subscriber>>,
    next_client_id: AtomicU64,
    queue_cursor: AtomicUsize,
    clients: AtomicUsize,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(
        &self,
        queue_capacity: usize,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<ServerOp>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ClientHandle {
            id,
            sender,
            subs: Mutex::new(HashMap::with_hasher(RandomState::new())),
            dropped: AtomicU64::new(0),
        });
        let clients = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("gmsg_broker_connections").set(clients as f64);
        (handle, receiver)
    }

    /// Drop every registration the client still holds.
    pub fn remove_client(&self, client: &ClientHandle) {
        let subs: Vec<Arc<Subscriber>> = client.subs.lock().drain().map(|(_, sub)| sub).collect();
        for sub in subs {
            self.forget(&sub);
        }
        let clients = self
            .clients
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::gauge!("gmsg_broker_connections").set(clients as f64);
        metrics::gauge!("gmsg_broker_subscriptions").set(self.sublist.count() as f64);
    }

    pub fn subscribe(
        &self,
        client: &Arc<ClientHandle>,
        pattern: &str,
        queue: Option<&str>,
        sid: u64,
    ) -> Result<()> {
        subject::validate_pattern(pattern)
            .map_err(|_| BrokerError::InvalidSubject(pattern.to_string()))?;
        let mut subs = client.subs.lock();
        if subs.contains_key(&sid) {
            tracing::debug!(client = client.id, sid, "duplicate sid ignored");
            return Ok(());
        }
        let sub = Arc::new(Subscriber {
            client_id: client.id,
            sid,
            subject: pattern.to_string(),
            queue: queue.map(str::to_string),
            sender: client.sender.clone(),
            client: Arc::downgrade(client),
            delivered: AtomicU64::new(0),
            max: AtomicU64::new(0),
        });
        self.sublist.insert(pattern, queue, Arc::clone(&sub))?;
        subs.insert(sid, sub);
        drop(subs);
        metrics::gauge!("gmsg_broker_subscriptions").set(self.sublist.count() as f64);
        Ok(())
    }

    /// Remove a subscription now, or once it has delivered `max_msgs` in total.
    ///
    /// Unknown sids are ignored.
    pub fn unsubscribe(&self, client: &ClientHandle, sid: u64, max_msgs: Option<u64>) {
        let sub = {
            let mut subs = client.subs.lock();
            let Some(sub) = subs.get(&sid) else {
                return;
            };
            if let Some(max) = max_msgs
                && max > 0
                && sub.delivered() < max
            {
                sub.max.store(max, Ordering::Release);
                return;
            }
            subs.remove(&sid)
        };
        if let Some(sub) = sub {
            self.forget(&sub);
        }
    }

    /// Route one message to every matching subscriber. Returns how many
    /// deliveries were queued.
    pub fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> usize {
        metrics::counter!("gmsg_broker_publish_total").increment(1);
        let matched = self.sublist.match_subject(subject);
        let mut delivered = 0;
        for sub in &matched.plain {
            if self.deliver(sub, subject, reply_to, &payload) {
                delivered += 1;
            }
        }
        for (_, members) in &matched.queues {
            // Start at the cursor and fall through to the next member when
            // the chosen one cannot take the message.
            let start = self.queue_cursor.fetch_add(1, Ordering::Relaxed);
            let taken = (0..members.len())
                .map(|offset| &members[start.wrapping_add(offset) % members.len()])
                .any(|member| self.deliver(member, subject, reply_to, &payload));
            if taken {
                delivered += 1;
            }
        }
        metrics::counter!("gmsg_broker_delivered_total").increment(delivered as u64);
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.sublist.count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    fn deliver(&self, sub: &Arc<Subscriber>, subject: &str, reply_to: Option<&str>, payload: &Bytes) -> bool {
        match self.try_deliver(sub, subject, reply_to, payload) {
            Delivery::Sent { limit_reached } => {
                if limit_reached {
                    self.expire(sub);
                }
                true
            }
            Delivery::Skipped => false,
        }
    }

    fn try_deliver(
        &self,
        sub: &Subscriber,
        subject: &str,
        reply_to: Option<&str>,
        payload: &Bytes,
    ) -> Delivery {
        let count = sub.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        let max = sub.max.load(Ordering::Acquire);
        if max > 0 && count > max {
            return Delivery::Skipped;
        }
        let op = ServerOp::Msg {
            subject: subject.to_string(),
            sid: sub.sid,
            reply_to: reply_to.map(str::to_string),
            payload: payload.clone(),
        };
        match sub.sender.try_send(op) {
            Ok(()) => Delivery::Sent {
                limit_reached: max > 0 && count == max,
            },
            Err(TrySendError::Full(_)) => {
                // Drop the new message rather than stall the publisher. It was
                // never sent, so it does not count toward the limit.
                sub.delivered.fetch_sub(1, Ordering::AcqRel);
                if let Some(client) = sub.client.upgrade() {
                    client.dropped.fetch_add(1, Ordering::Relaxed);
                }
                metrics::counter!("gmsg_broker_slow_consumer_drops_total").increment(1);
                tracing::warn!(client = sub.client_id, sid = sub.sid, subject, "slow consumer, message dropped");
                Delivery::Skipped
            }
            Err(TrySendError::Closed(_)) => Delivery::Skipped,
        }
    }

    // Auto-unsubscribe limit reached: drop from both the trie and the client map.
    fn expire(&self, sub: &Arc<Subscriber>) {
        if let Some(client) = sub.client.upgrade() {
            client.subs.lock().remove(&sub.sid);
        }
        self.forget(sub);
    }

    fn forget(&self, sub: &Arc<Subscriber>) {
        match self.sublist.remove(&sub.subject, sub.queue.as_deref(), sub) {
            Ok(()) | Err(SublistError::NotFound) => {}
            Err(err) => tracing::warn!(error = %err, sid = sub.sid, "failed to remove subscription"),
        }
        metrics::gauge!("gmsg_broker_subscriptions").set(self.sublist.count() as f64);
    }
}
