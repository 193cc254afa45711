//! Session management module.
//!
//! This module owns the pseudo-terminal processes: spawning them, capturing
//! their output into scrollback, and the registry that maps session ids to
//! live sessions.

pub mod output;
pub mod pty;
pub mod registry;

pub use output::SessionOutput;
pub use pty::{
    Attachment, Session, SessionError, SessionId, SessionStatus, SpawnEnvironment, TerminalSize,
};
pub use registry::{SessionInfo, SessionRegistry};
