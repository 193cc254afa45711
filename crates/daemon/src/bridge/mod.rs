//! Stream bridge between a client connection and a session.
//!
//! One bridge runs per attached connection. It sends the session's
//! scrollback as the first message, then relays in both directions until
//! either side goes away:
//!
//! - shell output is coalesced (see [`Coalescer`]) and sent as one message per
//!   flush;
//! - every client message is forwarded verbatim to the shell's input.
//!
//! The bridge is transport-agnostic: anything that is a `Sink<Bytes>` for
//! outbound messages and a `Stream<Item = Bytes>` of inbound messages will do.
//! Sessions are connection-scoped: when the bridge ends, [`serve`] destroys
//! the session.

pub mod coalesce;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::session::pty::wait_for_exit;
use crate::session::{Attachment, SessionError, SessionId, SessionRegistry};

pub use coalesce::Coalescer;

/// Default delay between the first buffered byte and its flush.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(5);

/// How long output already in flight is still collected after the shell
/// exits while something else keeps the terminal open.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client's inbound stream ended.
    ClientClosed,
    /// The shell's output stream ended.
    ProcessExited,
}

/// Relays bytes between one client connection and one session.
#[derive(Debug, Clone)]
pub struct Bridge {
    flush_delay: Duration,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_DELAY)
    }
}

impl Bridge {
    pub fn new(flush_delay: Duration) -> Self {
        Self { flush_delay }
    }

    pub fn flush_delay(&self) -> Duration {
        self.flush_delay
    }

    /// Runs the relay until the client or the shell goes away.
    ///
    /// Failed sends are logged and dropped; the end of `inbound` is what
    /// signals a closed connection. The shell counts as gone when its output
    /// ends or when it exits, whichever comes first; the pending batch is
    /// then flushed and `sink` is closed.
    pub async fn run<S, R>(&self, attachment: Attachment, mut sink: S, mut inbound: R) -> BridgeExit
    where
        S: Sink<Bytes> + Unpin,
        S::Error: fmt::Display,
        R: Stream<Item = Bytes> + Unpin,
    {
        let Attachment {
            session_id,
            scrollback,
            mut output,
            input,
            exit,
        } = attachment;

        transmit(&mut sink, session_id, scrollback).await;

        let mut coalescer = Coalescer::new(self.flush_delay);
        let exited = wait_for_exit(exit);
        tokio::pin!(exited);

        let exit = loop {
            let flush_at = coalescer.deadline();

            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => coalescer.push(&chunk),
                    None => break BridgeExit::ProcessExited,
                },
                status = &mut exited => {
                    tracing::debug!(session_id = session_id, status = ?status, "Shell exited");
                    drain(&mut output, &mut coalescer).await;
                    break BridgeExit::ProcessExited;
                },
                message = inbound.next() => match message {
                    Some(data) => {
                        if input.send(data).is_err() {
                            tracing::debug!(session_id = session_id, "Shell input closed, dropping client input");
                        }
                    }
                    None => break BridgeExit::ClientClosed,
                },
                () = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    if let Some(batch) = coalescer.take() {
                        transmit(&mut sink, session_id, batch).await;
                    }
                }
            }
        };

        if exit == BridgeExit::ProcessExited {
            if let Some(batch) = coalescer.take() {
                transmit(&mut sink, session_id, batch).await;
            }
            if let Err(e) = sink.close().await {
                tracing::debug!(session_id = session_id, error = %e, "Error closing connection");
            }
        } else if !coalescer.is_empty() {
            tracing::debug!(
                session_id = session_id,
                bytes = coalescer.pending_len(),
                "Discarding output for closed connection"
            );
        }

        tracing::debug!(session_id = session_id, exit = ?exit, "Bridge finished");
        exit
    }
}

/// Collects output that is still arriving after the shell exited.
///
/// Stops at the end of the stream or after [`EXIT_DRAIN_TIMEOUT`], since a
/// background job may keep the stream open indefinitely.
async fn drain(output: &mut mpsc::UnboundedReceiver<Bytes>, coalescer: &mut Coalescer) {
    let deadline = Instant::now() + EXIT_DRAIN_TIMEOUT;
    while let Ok(Some(chunk)) = timeout_at(deadline, output.recv()).await {
        coalescer.push(&chunk);
    }
}

/// Sends one message, swallowing failures on a closed connection.
async fn transmit<S>(sink: &mut S, session_id: SessionId, data: Bytes) -> bool
where
    S: Sink<Bytes> + Unpin,
    S::Error: fmt::Display,
{
    let len = data.len();
    match sink.send(data).await {
        Ok(()) => {
            tracing::trace!(session_id = session_id, bytes = len, "Flushed output");
            true
        }
        Err(e) => {
            tracing::debug!(session_id = session_id, error = %e, "Connection not open, dropping output");
            false
        }
    }
}

/// Attaches a connection to a session, relays until it ends, then tears the
/// session down.
///
/// If the attach fails the connection is closed and the error returned;
/// nothing is torn down in that case. Teardown targets the attached session
/// itself, never whatever the id maps to by then.
pub async fn serve<S, R>(
    registry: &SessionRegistry,
    bridge: &Bridge,
    session_id: SessionId,
    mut sink: S,
    inbound: R,
) -> Result<BridgeExit, SessionError>
where
    S: Sink<Bytes> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = Bytes> + Unpin,
{
    let (session, attachment) = match registry.attach(session_id).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::debug!(session_id = session_id, error = %e, "Rejecting attach");
            let _ = sink.close().await;
            return Err(e);
        }
    };

    let exit = bridge.run(attachment, sink, inbound).await;

    if let Err(e) = registry.destroy_session(&session).await {
        tracing::warn!(session_id = session_id, error = %e, "Teardown failed");
    }

    Ok(exit)
}
