//! PTY session management.
//!
//! A session owns one pseudo-terminal and the shell process running in it.
//! Three dedicated threads service the blocking PTY handles: a reader that
//! appends every chunk of output to the session's [`SessionOutput`], a writer
//! fed from an input channel, and a waiter that observes process exit.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use super::output::SessionOutput;

/// Identifier of a session: the process id of its shell.
pub type SessionId = u32;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Failed to spawn the PTY or the shell inside it.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The registry already holds the configured maximum number of sessions.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// Another client is currently attached to the session.
    #[error("session {0} already has an attached client")]
    AlreadyAttached(SessionId),

    /// A terminal dimension was zero.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of a session's shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is running.
    Running,
    /// Session has exited with a code.
    Exited(u32),
    /// The process is gone but its exit status could not be collected.
    Terminated,
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn pack(self) -> u32 {
        (u32::from(self.cols) << 16) | u32::from(self.rows)
    }

    fn unpack(packed: u32) -> Self {
        Self {
            cols: (packed >> 16) as u16,
            rows: (packed & 0xffff) as u16,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything a spawned shell inherits from the daemon.
///
/// Built once at startup and handed to the registry, so spawned processes
/// never read ambient process state directly.
#[derive(Debug, Clone)]
pub struct SpawnEnvironment {
    /// Shell program to run.
    pub shell: String,
    /// Terminal type label exported as `TERM`.
    pub term_name: String,
    /// Working directory of the shell.
    pub cwd: PathBuf,
    /// Full environment of the shell.
    pub env: Vec<(String, String)>,
}

impl SpawnEnvironment {
    /// Captures the daemon's current directory and environment.
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn inherit(shell: impl Into<String>, term_name: impl Into<String>) -> io::Result<Self> {
        let env = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();

        Ok(Self {
            shell: shell.into(),
            term_name: term_name.into(),
            cwd: std::env::current_dir()?,
            env,
        })
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// A client's view of a session, handed out by [`Session::attach`].
///
/// `scrollback` holds every byte emitted before the attach; `output` yields
/// every byte emitted after it, with nothing duplicated or skipped between
/// the two. `output` ends when the shell's output stream closes, which can
/// be long after the shell itself exits if a background job keeps the
/// terminal open; `exit` reports the shell's own exit.
#[derive(Debug)]
pub struct Attachment {
    pub session_id: SessionId,
    pub scrollback: Bytes,
    pub output: mpsc::UnboundedReceiver<Bytes>,
    pub input: mpsc::UnboundedSender<Bytes>,
    pub exit: watch::Receiver<SessionStatus>,
}

/// Resolves once the status leaves `Running`.
///
/// A dropped sender means the waiter is gone without reporting, which is
/// treated as [`SessionStatus::Terminated`].
pub async fn wait_for_exit(mut status_rx: watch::Receiver<SessionStatus>) -> SessionStatus {
    status_rx
        .wait_for(|status| *status != SessionStatus::Running)
        .await
        .map(|status| *status)
        .unwrap_or(SessionStatus::Terminated)
}

/// A PTY session with a shell process.
pub struct Session {
    /// Session identifier (the shell's process id).
    id: SessionId,

    /// Terminal type label.
    term_name: String,

    /// Working directory the shell was started in.
    cwd: PathBuf,

    /// Current terminal size, packed as `cols << 16 | rows`.
    size: AtomicU32,

    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Handle used to signal the child process.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Input queue drained by the writer thread.
    input_tx: mpsc::UnboundedSender<Bytes>,

    /// Scrollback and attached listener.
    output: Arc<SessionOutput>,

    /// Cleared by the waiter thread once the process has exited.
    running: Arc<AtomicBool>,

    /// Exit status published by the waiter thread.
    status_rx: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Spawns a shell in a new PTY with the given geometry.
    ///
    /// Output capture starts immediately, so bytes emitted before any client
    /// attaches land in the scrollback. If any step after the process starts
    /// fails, the process is killed and no session is returned.
    pub fn spawn(environment: &SpawnEnvironment, size: TerminalSize) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&environment.shell);
        cmd.env_clear();
        for (key, value) in &environment.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", &environment.term_name);
        cmd.cwd(&environment.cwd);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let Some(id) = child.process_id() else {
            return Err(abort_spawn(&mut child, "spawned process has no pid"));
        };

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => return Err(abort_spawn(&mut child, e)),
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => return Err(abort_spawn(&mut child, e)),
        };

        let output = Arc::new(SessionOutput::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        if let Err(e) = spawn_reader(id, reader, Arc::clone(&output)) {
            return Err(abort_spawn(&mut child, e));
        }
        if let Err(e) = spawn_writer(id, writer, input_rx) {
            return Err(abort_spawn(&mut child, e));
        }

        let mut killer = child.clone_killer();
        let running = Arc::new(AtomicBool::new(true));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Running);

        if let Err(e) = spawn_waiter(id, child, Arc::clone(&running), status_tx) {
            let _ = killer.kill();
            return Err(SessionError::SpawnFailed(e.to_string()));
        }

        tracing::debug!(
            session_id = id,
            shell = %environment.shell,
            cols = size.cols,
            rows = size.rows,
            "Spawned PTY"
        );

        Ok(Session {
            id,
            term_name: environment.term_name.clone(),
            cwd: environment.cwd.clone(),
            size: AtomicU32::new(size.pack()),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            output,
            running,
            status_rx,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the terminal type label.
    pub fn term_name(&self) -> &str {
        &self.term_name
    }

    /// Returns the working directory the shell was started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        TerminalSize::unpack(self.size.load(Ordering::SeqCst))
    }

    /// Returns whether the shell process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the latest known process status.
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Returns the session's output state.
    pub fn output(&self) -> &SessionOutput {
        &self.output
    }

    /// Waits for the shell process to exit.
    pub async fn wait(&self) -> SessionStatus {
        wait_for_exit(self.status_rx.clone()).await
    }

    /// Queues data for the shell's input, byte for byte.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.input_tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| SessionError::WriteFailed("PTY writer has stopped".to_string()))
    }

    /// Resizes the PTY to the given dimensions.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let master = self.master.lock().await;
        master
            .resize(size.into())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        self.size.store(size.pack(), Ordering::SeqCst);

        tracing::debug!(
            session_id = self.id,
            cols = size.cols,
            rows = size.rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Sends a kill signal to the shell process.
    ///
    /// Does not wait for the process to exit. Killing a process that has
    /// already exited is a no-op.
    pub async fn kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        let mut killer = self.killer.lock().await;
        killer
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        tracing::debug!(session_id = self.id, "Sent kill signal");
        Ok(())
    }

    /// Attaches a client to the session.
    ///
    /// Fails with [`SessionError::AlreadyAttached`] while another client holds
    /// a live attachment.
    pub async fn attach(&self) -> Result<Attachment, SessionError> {
        let (scrollback, output) = self
            .output
            .attach()
            .await
            .ok_or(SessionError::AlreadyAttached(self.id))?;

        Ok(Attachment {
            session_id: self.id,
            scrollback,
            output,
            input: self.input_tx.clone(),
            exit: self.status_rx.clone(),
        })
    }
}

/// Kills a half-constructed child and converts the cause into a spawn error.
fn abort_spawn(child: &mut Box<dyn Child + Send + Sync>, cause: impl ToString) -> SessionError {
    let _ = child.kill();
    SessionError::SpawnFailed(cause.to_string())
}

fn spawn_reader(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output: Arc<SessionOutput>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-reader-{id}"))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = id, "PTY EOF");
                        break;
                    }
                    Ok(n) => output.blocking_push(&buffer[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side is gone.
                        tracing::debug!(session_id = id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            output.blocking_close();
        })?;
    Ok(())
}

fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-writer-{id}"))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    tracing::debug!(session_id = id, error = %e, "PTY write failed");
                    break;
                }
            }
        })?;
    Ok(())
}

fn spawn_waiter(
    id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    running: Arc<AtomicBool>,
    status_tx: watch::Sender<SessionStatus>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-waiter-{id}"))
        .spawn(move || {
            let status = match child.wait() {
                Ok(status) => SessionStatus::Exited(status.exit_code()),
                Err(e) => {
                    tracing::warn!(session_id = id, error = %e, "Failed to collect exit status");
                    SessionStatus::Terminated
                }
            };
            running.store(false, Ordering::SeqCst);
            tracing::info!(session_id = id, status = ?status, "Shell process exited");
            let _ = status_tx.send(status);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_environment() -> SpawnEnvironment {
        let mut environment = SpawnEnvironment::inherit("/bin/sh", "xterm-color").unwrap();
        environment.cwd = std::env::temp_dir();
        environment
    }

    async fn read_until(attachment: &mut Attachment, marker: &str) -> bool {
        let mut seen = String::from_utf8_lossy(&attachment.scrollback).into_owned();
        for _ in 0..50 {
            if seen.contains(marker) {
                return true;
            }
            match timeout(Duration::from_millis(100), attachment.output.recv()).await {
                Ok(Some(data)) => seen.push_str(&String::from_utf8_lossy(&data)),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        seen.contains(marker)
    }

    #[test]
    fn test_terminal_size_pack_roundtrip() {
        let size = TerminalSize::new(u16::MAX, 1);
        assert_eq!(TerminalSize::unpack(size.pack()), size);
        assert_eq!(TerminalSize::default(), TerminalSize::new(80, 24));
    }

    #[test]
    fn test_inherit_captures_cwd_and_env() {
        let environment = SpawnEnvironment::inherit("/bin/sh", "xterm").unwrap();
        assert_eq!(environment.cwd, std::env::current_dir().unwrap());
        assert_eq!(environment.term_name, "xterm");
        assert!(environment.env.iter().any(|(key, _)| key == "PATH"));
    }

    #[tokio::test]
    async fn test_session_spawn() {
        let result = Session::spawn(&test_environment(), TerminalSize::new(100, 30));
        assert!(result.is_ok(), "Failed to spawn session: {:?}", result.err());

        let session = result.unwrap();
        assert!(session.is_running());
        assert!(session.id() > 0);
        assert_eq!(session.size(), TerminalSize::new(100, 30));
        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.term_name(), "xterm-color");

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_spawn_missing_shell() {
        let mut environment = test_environment();
        environment.shell = "/nonexistent/shell".to_string();

        let result = Session::spawn(&environment, TerminalSize::default());
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_session_write_reaches_shell() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();
        let mut attachment = session.attach().await.unwrap();

        session.write(b"echo test_output_marker\n").unwrap();

        assert!(
            read_until(&mut attachment, "test_output_marker").await,
            "Did not receive expected output"
        );

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_env_and_term() {
        let mut environment = test_environment();
        environment
            .env
            .push(("TEST_VAR".to_string(), "test_value".to_string()));
        let session = Session::spawn(&environment, TerminalSize::default()).unwrap();
        let mut attachment = session.attach().await.unwrap();

        session.write(b"echo $TEST_VAR-$TERM\n").unwrap();

        assert!(read_until(&mut attachment, "test_value-xterm-color").await);

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_output_before_attach_is_in_scrollback() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();

        session.write(b"echo early_marker\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let attachment = session.attach().await.unwrap();
        let scrollback = String::from_utf8_lossy(&attachment.scrollback);
        assert!(scrollback.contains("early_marker"));

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_resize() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();
        assert_eq!(session.size(), TerminalSize::new(80, 24));

        let result = session.resize(TerminalSize::new(120, 40)).await;
        assert!(result.is_ok(), "Failed to resize: {:?}", result.err());
        assert_eq!(session.size(), TerminalSize::new(120, 40));

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_second_attach_rejected() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();

        let first = session.attach().await.unwrap();
        assert!(matches!(
            session.attach().await,
            Err(SessionError::AlreadyAttached(_))
        ));

        drop(first);
        assert!(session.attach().await.is_ok());

        let _ = session.kill().await;
    }

    #[tokio::test]
    async fn test_session_kill_then_wait() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();

        session.kill().await.unwrap();
        let status = timeout(Duration::from_secs(5), session.wait())
            .await
            .expect("process did not exit after kill");

        assert_ne!(status, SessionStatus::Running);
        assert!(!session.is_running());

        // Killing an exited process is a no-op.
        assert!(session.kill().await.is_ok());
    }

    #[tokio::test]
    async fn test_session_exit_code_and_output_close() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();
        let mut attachment = session.attach().await.unwrap();

        session.write(b"exit 42\n").unwrap();

        let status = timeout(Duration::from_secs(5), session.wait()).await.unwrap();
        assert_eq!(status, SessionStatus::Exited(42));

        // The live output channel ends once the PTY is drained.
        let drained = timeout(Duration::from_secs(5), async {
            while attachment.output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_attachment_reports_exit_while_background_job_holds_pty() {
        let session = Session::spawn(&test_environment(), TerminalSize::default()).unwrap();
        let attachment = session.attach().await.unwrap();

        session.write(b"sleep 10 &\nexit 0\n").unwrap();

        let status = timeout(Duration::from_secs(5), wait_for_exit(attachment.exit))
            .await
            .expect("exit was not reported");
        assert_eq!(status, SessionStatus::Exited(0));

        // The background job still holds the terminal open.
        assert!(!session.output().is_closed().await);
    }
}
