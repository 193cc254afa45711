//! # termhub Daemon Library
//!
//! This crate serves interactive shell sessions running in pseudo-terminals
//! to remote clients over HTTP and WebSocket.
//!
//! ## Overview
//!
//! - **Session Registry**: Spawn shells in PTYs, capture their output into a
//!   scrollback, resize and destroy them
//! - **Stream Bridge**: Relay one client connection to one session, replaying
//!   scrollback first and coalescing output into batched messages
//! - **HTTP Front End**: Create, resize and connect to sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Daemon Orchestrator                  │
//! ├──────────────────────────────────────────────────────┤
//! │                                                      │
//! │  ┌───────────────────┐      ┌─────────────────────┐  │
//! │  │   HTTP / WS       │ ───▶ │    Stream Bridge    │  │
//! │  └───────────────────┘      └─────────────────────┘  │
//! │            │                          │              │
//! │            ▼                          ▼              │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │               Session Registry                 │  │
//! │  └────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termhub_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the session registry
//! - [`bridge`]: Connection-to-session relay with output coalescing
//! - [`http`]: Routes and WebSocket adapter
//! - [`orchestrator`]: Main daemon coordinator

pub mod bridge;
pub mod config;
pub mod http;
pub mod orchestrator;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    Attachment, Session, SessionError, SessionId, SessionInfo, SessionRegistry, SessionStatus,
    SpawnEnvironment, TerminalSize,
};

// Re-export bridge types for convenience
pub use bridge::{Bridge, BridgeExit};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
