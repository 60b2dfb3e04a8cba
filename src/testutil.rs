//! Recording transport/session doubles shared by the state-machine and
//! dispatcher tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::MachineEntry;
use crate::error::Error;
use crate::session::{ConnectProfile, Session, Transport};

pub fn entry(user: &str, ip: &str) -> MachineEntry {
    MachineEntry {
        name: None,
        user: user.to_string(),
        ip: ip.to_string(),
        port: None,
        password: None,
        paths: Vec::new(),
    }
}

pub struct FakeSession {
    sent: Arc<Mutex<Vec<String>>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Session for FakeSession {
    async fn send(&mut self, line: &str) -> Result<(), Error> {
        if !self.is_usable() {
            return Err(Error::AuthOrTransport("fake session closed".to_string()));
        }
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_usable(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Transport double: records probes, opens, and every line sent through any
/// session it handed out.
pub struct FakeTransport {
    fail_probe: bool,
    fail_open: bool,
    probes: Mutex<Vec<String>>,
    remote_opened: AtomicUsize,
    local_opened: AtomicUsize,
    sent: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            fail_probe: false,
            fail_open: false,
            probes: Mutex::new(Vec::new()),
            remote_opened: AtomicUsize::new(0),
            local_opened: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every probe fails, as against a powered-off machine.
    pub fn unreachable() -> Self {
        Self {
            fail_probe: true,
            ..Self::new()
        }
    }

    /// Probes succeed but opening the session fails.
    pub fn broken() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().unwrap().len()
    }

    pub fn opened_count(&self) -> usize {
        self.remote_opened.load(Ordering::SeqCst)
    }

    pub fn local_opened_count(&self) -> usize {
        self.local_opened.load(Ordering::SeqCst)
    }

    fn session(&self) -> FakeSession {
        FakeSession {
            sent: Arc::clone(&self.sent),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn probe(&self, ip: &str, port: u16, _timeout: Duration) -> Result<(), Error> {
        self.probes.lock().unwrap().push(format!("{}:{}", ip, port));
        if self.fail_probe {
            return Err(Error::Unreachable(format!("{}:{}", ip, port)));
        }
        Ok(())
    }

    async fn open_remote(
        &self,
        profile: &ConnectProfile,
        _label: &str,
    ) -> Result<Box<dyn Session>, Error> {
        if self.fail_open {
            return Err(Error::AuthOrTransport(format!(
                "refused connection to {}",
                profile.ip
            )));
        }
        self.remote_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.session()))
    }

    async fn open_local(&self, _label: &str) -> Result<Box<dyn Session>, Error> {
        if self.fail_open {
            return Err(Error::AuthOrTransport("no local shell".to_string()));
        }
        self.local_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.session()))
    }
}
