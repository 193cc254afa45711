//! Output coalescing.
//!
//! Bytes are accumulated into a pending batch. The first byte appended to an
//! empty batch arms a deadline `delay` in the future; when the deadline
//! passes the whole batch is taken in one piece and the deadline disarms, so
//! the next byte re-arms it. Added latency is therefore bounded by `delay`.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

/// Pending outbound bytes and their flush deadline.
#[derive(Debug)]
pub struct Coalescer {
    pending: BytesMut,
    deadline: Option<Instant>,
    delay: Duration,
}

impl Coalescer {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: BytesMut::new(),
            deadline: None,
            delay,
        }
    }

    /// Appends a chunk, arming the deadline if none is set.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }
        self.pending.extend_from_slice(chunk);
    }

    /// When the pending batch is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of bytes waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Takes the pending batch and disarms the deadline.
    pub fn take(&mut self) -> Option<Bytes> {
        self.deadline = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}
