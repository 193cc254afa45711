//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry, binds the HTTP listener and serves it until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::http::{self, AppState};
use crate::session::{SessionRegistry, SpawnEnvironment};

/// How long to wait for the HTTP server to drain on shutdown.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The HTTP listener is bound.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistry>,
    /// Output relay settings shared by every connection.
    bridge: Bridge,
    /// Address the listener is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// HTTP server task.
    server: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Spawned shells inherit this process's working directory and
    /// environment.
    pub fn new(config: Config) -> Result<Self> {
        let environment =
            SpawnEnvironment::inherit(&config.session.default_shell, &config.session.term_name)
                .context("Failed to capture spawn environment")?;
        Ok(Self::with_environment(config, environment))
    }

    /// Creates a new daemon orchestrator with an explicit spawn environment.
    pub fn with_environment(config: Config, environment: SpawnEnvironment) -> Self {
        let registry = Arc::new(SessionRegistry::new(&config.session, environment));
        let bridge = Bridge::new(config.bridge.flush_delay());
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            bridge,
            local_addr: None,
            server: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the listener and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind_addr = self.config.http.bind_addr();
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind listener");
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("Failed to bind {}: {}", bind_addr, e),
                });
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).with_context(|| format!("Failed to bind {}", bind_addr));
            }
        };
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(addr);

        let app = http::router(AppState::new(
            Arc::clone(&self.registry),
            self.bridge.clone(),
        ));
        let shutdown = self.shutdown_token.clone().cancelled_owned();
        let event_tx = self.event_tx.clone();

        self.server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "HTTP server failed");
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: format!("HTTP server failed: {}", e),
                });
            }
        }));

        info!(
            addr = %addr,
            max_sessions = self.config.session.max_sessions,
            flush_delay = ?self.bridge.flush_delay(),
            "Listening"
        );
        self.emit_event(OrchestratorEvent::Listening { addr });

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Every session is destroyed, which ends the attached connections, then
    /// the server is given a bounded time to drain.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        for session in self.registry.list().await {
            debug!(
                session_id = session.id,
                status = ?session.status,
                attached = session.attached,
                scrollback = session.scrollback_len,
                "Destroying session"
            );
        }
        self.registry.shutdown().await;

        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, &mut server)
                .await
                .is_err()
            {
                warn!("HTTP server did not drain in time, aborting");
                server.abort();
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
