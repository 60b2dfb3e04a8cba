use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};

use crate::error::Error;
use crate::events::{AppEvent, EventBus};

/// Connection attributes a transport needs to open a remote shell.
#[derive(Debug, Clone)]
pub struct ConnectProfile {
    pub user: String,
    pub ip: String,
    pub port: u16,
}

/// A live interactive channel to a machine (remote shell or local terminal).
/// Output does not flow through this interface: the transport streams it
/// onto the event bus as `SessionOutput`/`SessionClosed` events.
#[async_trait]
pub trait Session: Send {
    /// Feed one line of input to the shell.
    async fn send(&mut self, line: &str) -> Result<(), Error>;

    /// Tear the channel down. Safe to call more than once.
    async fn close(&mut self);

    /// Whether the channel is still believed to accept input.
    fn is_usable(&self) -> bool;
}

/// External capability that opens sessions. The core never spawns processes
/// or touches sockets itself; it goes through this seam, which is also where
/// tests substitute a recording fake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Cheap reachability check before a connect attempt.
    async fn probe(&self, ip: &str, port: u16, timeout: Duration) -> Result<(), Error>;

    /// Open an interactive remote shell. Output is streamed onto the event
    /// bus under `label`.
    async fn open_remote(
        &self,
        profile: &ConnectProfile,
        label: &str,
    ) -> Result<Box<dyn Session>, Error>;

    /// Open a local interactive shell, used for local macros and builds with
    /// no target machine.
    async fn open_local(&self, label: &str) -> Result<Box<dyn Session>, Error>;
}

/// Production transport: spawns the system `ssh` binary (or `$SHELL` for
/// local sessions) with piped stdio and streams its output line-wise onto
/// the event bus.
pub struct ProcessTransport {
    events: EventBus,
    connect_timeout: Duration,
}

impl ProcessTransport {
    pub fn new(events: EventBus, connect_timeout: Duration) -> Self {
        Self {
            events,
            connect_timeout,
        }
    }

    fn spawn_session(&self, mut cmd: Command, label: &str) -> Result<ProcessSession, Error> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::AuthOrTransport(format!("failed to start {}: {}", label, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::AuthOrTransport("no stdin handle on child".to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));

        // One reader task per stream; only stdout EOF reports the close so
        // the bus sees a single SessionClosed per session.
        if let Some(stdout) = child.stdout.take() {
            spawn_output_task(
                stdout,
                label.to_string(),
                self.events.clone(),
                Some(Arc::clone(&alive)),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_task(stderr, label.to_string(), self.events.clone(), None);
        }

        Ok(ProcessSession {
            label: label.to_string(),
            child,
            stdin,
            alive,
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn probe(&self, ip: &str, port: u16, timeout: Duration) -> Result<(), Error> {
        let addr = format!("{}:{}", ip, port);
        tracing::debug!("Probing {}", addr);
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Unreachable(format!("{} ({})", addr, e))),
            // A probe that times out is reported as unreachable, not as a
            // connect timeout.
            Err(_) => Err(Error::Unreachable(addr)),
        }
    }

    async fn open_remote(
        &self,
        profile: &ConnectProfile,
        label: &str,
    ) -> Result<Box<dyn Session>, Error> {
        let target = format!("{}@{}", profile.user, profile.ip);
        tracing::info!("Opening SSH session to {} (port {})", target, profile.port);

        let mut cmd = Command::new("ssh");
        cmd.arg("-tt")
            .arg(&target)
            .arg("-p")
            .arg(profile.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-o")
            .arg("ServerAliveInterval=60")
            .arg("-o")
            .arg("ServerAliveCountMax=3");

        let session = self.spawn_session(cmd, label)?;
        Ok(Box::new(session))
    }

    async fn open_local(&self, label: &str) -> Result<Box<dyn Session>, Error> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        tracing::info!("Opening local session with {}", shell);

        let mut cmd = Command::new(shell);
        cmd.arg("-i");

        let session = self.spawn_session(cmd, label)?;
        Ok(Box::new(session))
    }
}

/// Session backed by a spawned child process with piped stdio.
pub struct ProcessSession {
    label: String,
    child: Child,
    stdin: ChildStdin,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Session for ProcessSession {
    async fn send(&mut self, line: &str) -> Result<(), Error> {
        if !self.is_usable() {
            return Err(Error::AuthOrTransport(format!(
                "session {} is no longer usable",
                self.label
            )));
        }
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::AuthOrTransport(format!("write to {}: {}", self.label, e)))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::AuthOrTransport(format!("write to {}: {}", self.label, e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::AuthOrTransport(format!("flush to {}: {}", self.label, e)))?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::info!("Closing session {}", self.label);
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    fn is_usable(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn spawn_output_task(
    reader: impl AsyncRead + Unpin + Send + 'static,
    label: String,
    events: EventBus,
    alive: Option<Arc<AtomicBool>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => events.emit(AppEvent::SessionOutput {
                    label: label.clone(),
                    line,
                }),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Output stream for {} errored: {}", label, e);
                    break;
                }
            }
        }
        if let Some(alive) = alive {
            if alive.swap(false, Ordering::SeqCst) {
                events.emit(AppEvent::SessionClosed { label });
            }
        }
    });
}
