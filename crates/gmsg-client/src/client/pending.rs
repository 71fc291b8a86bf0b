use bytes::{Bytes, BytesMut};

use crate::{Error, Result};

/// Encoded operations accepted while reconnecting, written to the next link
/// in arrival order. Once full, new operations are rejected and earlier ones
/// are kept.
#[derive(Debug)]
pub(crate) struct PendingBuffer {
    buf: BytesMut,
    limit: usize,
}

impl PendingBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub(crate) fn restore(bytes: Bytes, limit: usize) -> Self {
        Self {
            buf: BytesMut::from(&bytes[..]),
            limit,
        }
    }

    pub(crate) fn push(&mut self, op: &[u8]) -> Result<()> {
        if self.buf.len() + op.len() > self.limit {
            return Err(Error::ReconnectBufferExceeded);
        }
        self.buf.extend_from_slice(op);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
