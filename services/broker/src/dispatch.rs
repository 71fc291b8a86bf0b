// Per-connection handling of client operations once the link is authenticated.
//
// Permission and subject errors are reported with `-ERR` and the link stays
// up. Parse errors, payload overruns and stale links are fatal: the error is
// queued ahead of the close so the client sees why it was dropped.
use std::sync::Arc;

use bytes::Bytes;
use gmsg_authz::Action;
use gmsg_broker::{Broker, ClientHandle};
use gmsg_wire::subject;
use gmsg_wire::{ClientOp, ServerOp};

use crate::auth::AuthContext;

pub const INVALID_SUBJECT: &str = "Invalid Subject";
pub const MAX_PAYLOAD_VIOLATION: &str = "Maximum Payload Violation";
pub const MAX_CONTROL_LINE_EXCEEDED: &str = "Maximum Control Line Exceeded";
pub const UNKNOWN_PROTOCOL_OPERATION: &str = "Unknown Protocol Operation";
pub const STALE_CONNECTION: &str = "Stale Connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    broker: Arc<Broker>,
    client: Arc<ClientHandle>,
    auth: AuthContext,
    verbose: bool,
    pings_out: usize,
    max_pings_out: usize,
}

impl Session {
    pub fn new(
        broker: Arc<Broker>,
        client: Arc<ClientHandle>,
        auth: AuthContext,
        verbose: bool,
        max_pings_out: usize,
    ) -> Self {
        Self {
            broker,
            client,
            auth,
            verbose,
            pings_out: 0,
            max_pings_out,
        }
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    pub async fn handle(&mut self, op: ClientOp) -> Flow {
        match op {
            ClientOp::Connect(info) => {
                self.verbose = info.verbose;
                self.ok().await
            }
            ClientOp::Pub {
                subject,
                reply_to,
                payload,
            } => self.publish(&subject, reply_to.as_deref(), payload).await,
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => self.subscribe(&subject, queue_group.as_deref(), sid).await,
            ClientOp::Unsub { sid, max_msgs } => {
                self.broker.unsubscribe(&self.client, sid, max_msgs);
                self.ok().await
            }
            ClientOp::Ping => self.reply(ServerOp::Pong).await,
            ClientOp::Pong => {
                self.pings_out = 0;
                Flow::Continue
            }
        }
    }

    /// `+OK` when the client asked for verbose replies.
    pub async fn acknowledge(&self) -> Flow {
        self.ok().await
    }

    /// Server keepalive. Closes the link once `max_pings_out` PINGs went
    /// unanswered.
    pub async fn ping_tick(&mut self) -> Flow {
        if self.pings_out >= self.max_pings_out {
            tracing::debug!(client = self.client.id(), "stale client link");
            return self.fail(STALE_CONNECTION, true).await;
        }
        self.pings_out += 1;
        self.reply(ServerOp::Ping).await
    }

    /// Report an undecodable frame. Always fatal.
    pub async fn protocol_error(&self, err: &gmsg_wire::Error) -> Flow {
        metrics::counter!("gmsg_broker_protocol_errors_total").increment(1);
        tracing::debug!(client = self.client.id(), error = %err, "protocol error");
        self.fail(protocol_error_text(err), true).await
    }

    async fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> Flow {
        if let Err(err) = self.auth.matcher().check(Action::Publish, subject) {
            return self.deny(err).await;
        }
        let reply_ok = reply_to.is_none_or(|reply| subject::validate_subject(reply).is_ok());
        if subject::validate_subject(subject).is_err() || !reply_ok {
            return self.fail(INVALID_SUBJECT, false).await;
        }
        let delivered = self.broker.publish(subject, reply_to, payload);
        tracing::trace!(client = self.client.id(), subject, delivered, "publish");
        self.ok().await
    }

    async fn subscribe(&self, pattern: &str, queue: Option<&str>, sid: u64) -> Flow {
        if subject::validate_pattern(pattern).is_err() {
            return self.fail(INVALID_SUBJECT, false).await;
        }
        if let Err(err) = self.auth.matcher().check(Action::Subscribe, pattern) {
            return self.deny(err).await;
        }
        if let Err(err) = self.broker.subscribe(&self.client, pattern, queue, sid) {
            tracing::debug!(client = self.client.id(), sid, error = %err, "subscribe rejected");
            return self.fail(INVALID_SUBJECT, false).await;
        }
        self.ok().await
    }

    async fn deny(&self, err: gmsg_authz::AuthzError) -> Flow {
        metrics::counter!("gmsg_broker_permission_violations_total").increment(1);
        tracing::debug!(
            client = self.client.id(),
            user = self.auth.username.as_deref().unwrap_or("-"),
            error = %err,
            "permission denied"
        );
        self.fail(&err.to_string(), false).await
    }

    async fn ok(&self) -> Flow {
        if self.verbose {
            self.reply(ServerOp::Ok).await
        } else {
            Flow::Continue
        }
    }

    async fn fail(&self, text: &str, fatal: bool) -> Flow {
        let flow = self.reply(ServerOp::Err(text.to_string())).await;
        if fatal { Flow::Close } else { flow }
    }

    async fn reply(&self, op: ServerOp) -> Flow {
        match self.client.send(op).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close,
        }
    }
}

pub fn protocol_error_text(err: &gmsg_wire::Error) -> &'static str {
    match err {
        gmsg_wire::Error::MaxPayload { .. } => MAX_PAYLOAD_VIOLATION,
        gmsg_wire::Error::MaxControlLine(_) => MAX_CONTROL_LINE_EXCEEDED,
        _ => UNKNOWN_PROTOCOL_OPERATION,
    }
}
