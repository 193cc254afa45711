//! Session output: scrollback plus the attached listener.
//!
//! Every chunk the shell emits is appended to the scrollback and forwarded to
//! the attached client (if any) under a single lock. Attaching snapshots the
//! scrollback and installs the listener under that same lock, so a client's
//! scrollback and its live stream never overlap and never leave a gap.
//!
//! Only one listener is held at a time. The channel is unbounded: with a
//! single reader there is no slow-consumer fan-out to protect, and dropping
//! bytes would break the ordering guarantee.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};

#[derive(Default)]
struct OutputState {
    /// Everything the shell has emitted since spawn.
    scrollback: BytesMut,
    /// Live feed for the attached client.
    listener: Option<mpsc::UnboundedSender<Bytes>>,
    /// Set once the PTY reader has stopped.
    closed: bool,
}

impl OutputState {
    fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() || self.closed {
            return;
        }

        self.scrollback.extend_from_slice(chunk);

        if let Some(listener) = &self.listener {
            if listener.send(Bytes::copy_from_slice(chunk)).is_err() {
                tracing::trace!("Listener dropped, detaching");
                self.listener = None;
            }
        }
    }

    fn has_live_listener(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_closed())
    }

    fn close(&mut self) {
        self.closed = true;
        self.listener = None;
    }
}

/// Scrollback buffer and single-client output feed for one session.
#[derive(Default)]
pub struct SessionOutput {
    state: Mutex<OutputState>,
}

impl SessionOutput {
    /// Creates an empty output log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of output.
    pub async fn push(&self, chunk: &[u8]) {
        self.state.lock().await.append(chunk);
    }

    /// Appends a chunk of output from a blocking thread.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_push(&self, chunk: &[u8]) {
        self.state.blocking_lock().append(chunk);
    }

    /// Marks the output stream as finished and ends the listener's feed.
    pub async fn close(&self) {
        self.state.lock().await.close();
    }

    /// Blocking variant of [`close`](Self::close) for the reader thread.
    pub fn blocking_close(&self) {
        self.state.blocking_lock().close();
    }

    /// Installs a new listener.
    ///
    /// Returns the scrollback as of this instant and a receiver for every
    /// chunk appended afterwards, or `None` if a live listener is already
    /// installed. A listener whose receiver was dropped does not count. Once
    /// the output is closed the receiver ends right after the snapshot.
    pub async fn attach(&self) -> Option<(Bytes, mpsc::UnboundedReceiver<Bytes>)> {
        let mut state = self.state.lock().await;

        if state.has_live_listener() {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = Bytes::copy_from_slice(&state.scrollback);
        state.listener = if state.closed { None } else { Some(tx) };

        Some((snapshot, rx))
    }

    /// Returns a copy of the scrollback.
    pub async fn scrollback(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().await.scrollback)
    }

    /// Returns the scrollback length in bytes.
    pub async fn len(&self) -> usize {
        self.state.lock().await.scrollback.len()
    }

    /// Returns whether nothing has been emitted yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns whether a client is currently attached.
    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.has_live_listener()
    }

    /// Returns whether the output stream has finished.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
