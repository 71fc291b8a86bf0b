use bytes::Bytes;

/// A message as published or as delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    /// Subscription the message arrived on. Zero for outbound messages.
    pub sid: u64,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            sid: 0,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub(crate) fn delivered(subject: String, reply: Option<String>, payload: Bytes, sid: u64) -> Self {
        Self {
            subject,
            reply,
            payload,
            sid,
        }
    }
}
