use std::fmt;
use std::time::Duration;

use crate::config::{AppConfig, MachineEntry};
use crate::error::Error;
use crate::events::EventBus;
use crate::session::{ConnectProfile, Session, Transport};

/// Connection lifecycle of a machine. `Online` means a session exists but is
/// not the one currently surfaced; `Focused` is the single machine remote
/// macros run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Offline,
    Connecting,
    Online,
    Focused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Offline => "offline",
            Status::Connecting => "connecting",
            Status::Online => "online",
            Status::Focused => "focused",
        };
        f.write_str(label)
    }
}

/// Live state carried across a registry refresh so re-reading configuration
/// does not drop sessions of machines that still exist.
pub(crate) struct MachineRuntime {
    status: Status,
    session: Option<Box<dyn Session>>,
    selected: Option<String>,
}

/// One remote target: connection attributes, at most one owned session, and
/// a registry of candidate working directories with at most one selected.
pub struct Machine {
    name: String,
    user: String,
    ip: String,
    port: u16,
    password: Option<String>,
    paths: Vec<String>,
    /// When set, `paths[0]` is the path synthesized from the global
    /// default-root/default-project-path settings, not a configured entry.
    has_default_path: bool,
    selected: Option<usize>,
    status: Status,
    session: Option<Box<dyn Session>>,
    is_default_target: bool,
    settle: Duration,
    probe_timeout: Duration,
    connect_timeout: Duration,
    events: EventBus,
}

impl Machine {
    pub fn from_entry(entry: &MachineEntry, config: &AppConfig, events: EventBus) -> Self {
        let default_path = config.default_path();
        let mut paths = Vec::new();
        if let Some(path) = &default_path {
            paths.push(path.clone());
        }
        paths.extend(entry.paths.iter().cloned());

        let is_default_target = config.default_build_ip.as_deref() == Some(entry.ip.as_str());

        Self {
            name: entry.display_name(),
            user: entry.user.clone(),
            ip: entry.ip.clone(),
            port: entry.port.unwrap_or(22),
            password: entry.password.clone(),
            paths,
            has_default_path: default_path.is_some(),
            selected: None,
            status: Status::Offline,
            session: None,
            is_default_target,
            settle: Duration::from_millis(config.password_settle_ms),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_default_target(&self) -> bool {
        self.is_default_target
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// The configured entries, without the synthesized default path.
    pub fn configured_paths(&self) -> &[String] {
        &self.paths[self.configured_start()..]
    }

    pub fn selected_path(&self) -> Option<&str> {
        self.selected.map(|idx| self.paths[idx].as_str())
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn configured_start(&self) -> usize {
        usize::from(self.has_default_path)
    }

    fn set_status(&mut self, status: Status) {
        if self.status != status {
            tracing::info!("{}: {} -> {}", self.name, self.status, status);
            self.status = status;
            self.events.status(&self.name, status);
        }
    }

    /// Focused -> Online; every other state unchanged. Collection-wide
    /// exclusivity is enforced by calling this on all machines before any
    /// connect or focus.
    pub(crate) fn unfocus(&mut self) {
        if self.status == Status::Focused {
            self.set_status(Status::Online);
        }
    }

    /// Surface an already-running session without opening a new connection.
    pub(crate) fn focus_existing(&mut self) {
        self.set_status(Status::Focused);
    }

    /// Probe, open a session, and become focused. On any failure the partial
    /// session is torn down and the machine is back at `Offline` with the
    /// error returned for reporting.
    pub(crate) async fn connect(&mut self, transport: &dyn Transport) -> Result<(), Error> {
        self.set_status(Status::Connecting);

        let deadline = self.connect_timeout + self.settle;
        let result = match tokio::time::timeout(deadline, self.open_session(transport)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline.as_secs())),
        };

        if let Err(err) = result {
            tracing::warn!("{}: connect failed: {}", self.name, err);
            self.disconnect().await;
            return Err(err);
        }

        self.set_status(Status::Focused);
        Ok(())
    }

    async fn open_session(&mut self, transport: &dyn Transport) -> Result<(), Error> {
        transport
            .probe(&self.ip, self.port, self.probe_timeout)
            .await?;

        let profile = ConnectProfile {
            user: self.user.clone(),
            ip: self.ip.clone(),
            port: self.port,
        };
        self.session = Some(transport.open_remote(&profile, &self.name).await?);

        if let Some(password) = self.password.clone() {
            // Best-effort: wait a settle delay, then type the password as a
            // line of input. The typed line only reaches prompts that read
            // stdin (ssh itself asks on the tty), so key-based auth is the
            // reliable path.
            tokio::time::sleep(self.settle).await;
            if let Some(session) = self.session.as_mut() {
                session.send(&password).await?;
            }
        }

        match self.session.as_ref() {
            Some(session) if session.is_usable() => Ok(()),
            _ => Err(Error::AuthOrTransport(format!(
                "session to {} closed during connect",
                self.name
            ))),
        }
    }

    /// Close the session if present, clear the path selection, go offline.
    /// Idempotent from every state.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.selected = None;
        self.set_status(Status::Offline);
    }

    pub fn add_path(&mut self, path: &str) -> Result<(), Error> {
        if self.paths.iter().any(|p| p == path) {
            return Err(Error::UserInput(format!("path already present: {}", path)));
        }
        self.paths.push(path.to_string());
        Ok(())
    }

    pub fn remove_path(&mut self, path: &str) -> Result<(), Error> {
        let start = self.configured_start();
        let idx = self
            .paths
            .iter()
            .skip(start)
            .position(|p| p == path)
            .map(|i| i + start);

        let Some(idx) = idx else {
            if start == 1 && self.paths.first().map(String::as_str) == Some(path) {
                return Err(Error::UserInput(
                    "the default path is derived from settings; edit default_root \
                     or default_project_path instead"
                        .to_string(),
                ));
            }
            return Err(Error::UserInput(format!("no such path: {}", path)));
        };

        self.paths.remove(idx);
        match self.selected {
            Some(sel) if sel == idx => self.selected = None,
            Some(sel) if sel > idx => self.selected = Some(sel - 1),
            _ => {}
        }
        Ok(())
    }

    /// Select a working directory and `cd` into it. Only valid while this
    /// machine is focused; any prior selection is cleared first so at most
    /// one path is ever selected, even if the `cd` fails midway.
    pub async fn select_path(&mut self, path: &str) -> Result<(), Error> {
        if self.status != Status::Focused {
            return Err(Error::NoTarget(format!("{} is not focused", self.name)));
        }
        let idx = self
            .paths
            .iter()
            .position(|p| p == path)
            .ok_or_else(|| Error::UserInput(format!("no such path: {}", path)))?;

        self.selected = None;
        let session = self.session.as_mut().ok_or_else(|| {
            Error::AuthOrTransport(format!("{} has no live session", self.name))
        })?;
        session.send(&format!("cd {}", path)).await?;
        self.selected = Some(idx);
        Ok(())
    }

    pub fn unselect_path(&mut self) {
        self.selected = None;
    }

    /// Resolve the working directory to run against: the current selection,
    /// else the synthesized default (auto-selected on first use).
    pub async fn default_path(&mut self) -> Result<Option<String>, Error> {
        if self.selected.is_none() && self.has_default_path {
            let path = self.paths[0].clone();
            self.select_path(&path).await?;
        }
        Ok(self.selected_path().map(str::to_string))
    }

    /// Feed one command line to the machine's session.
    pub async fn send(&mut self, line: &str) -> Result<(), Error> {
        match self.session.as_mut() {
            Some(session) if session.is_usable() => session.send(line).await,
            _ => Err(Error::AuthOrTransport(format!(
                "{} has no live session",
                self.name
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(crate) fn take_runtime(&mut self) -> MachineRuntime {
        MachineRuntime {
            status: self.status,
            session: self.session.take(),
            selected: self.selected_path().map(str::to_string),
        }
    }

    /// Adopt live state from the machine this one replaces after a refresh.
    /// The selection survives only if the path is still present.
    pub(crate) fn restore_runtime(&mut self, runtime: MachineRuntime) {
        self.status = runtime.status;
        self.session = runtime.session;
        if let Some(selected) = runtime.selected {
            self.selected = self.paths.iter().position(|p| *p == selected);
        }
    }
}
