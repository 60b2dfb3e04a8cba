use std::collections::HashSet;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;

use crate::config::{AppConfig, MachineEntry};
use crate::error::Error;
use crate::events::EventBus;
use crate::machine::{Machine, Status};
use crate::session::Transport;

/// The set of all configured machines, in configuration order. Owns the
/// collection-wide invariant that at most one machine is focused.
pub struct MachineCollection {
    machines: Vec<Machine>,
    events: EventBus,
}

impl MachineCollection {
    pub fn new(events: EventBus) -> Self {
        Self {
            machines: Vec::new(),
            events,
        }
    }

    pub fn from_entries(entries: &[MachineEntry], config: &AppConfig, events: EventBus) -> Self {
        let mut collection = Self::new(events);
        collection.rebuild(entries, config);
        collection
    }

    fn rebuild(&mut self, entries: &[MachineEntry], config: &AppConfig) {
        let mut seen = HashSet::new();
        for entry in entries {
            let machine = Machine::from_entry(entry, config, self.events.clone());
            if !seen.insert(machine.name().to_string()) {
                tracing::warn!("Duplicate machine name {}, skipping", machine.name());
                continue;
            }
            self.machines.push(machine);
        }
        tracing::info!("Loaded {} machines", self.machines.len());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.machines.iter().position(|m| m.name() == name)
    }

    pub(crate) fn focused_index(&self) -> Option<usize> {
        self.machines.iter().position(|m| m.status() == Status::Focused)
    }

    pub fn get(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Machine> {
        self.machines.iter_mut().find(|m| m.name() == name)
    }

    pub(crate) fn index_by_ip(&self, ip: &str) -> Option<usize> {
        self.machines.iter().position(|m| m.ip() == ip)
    }

    pub(crate) fn machine_mut(&mut self, idx: usize) -> &mut Machine {
        &mut self.machines[idx]
    }

    pub fn focused(&self) -> Option<&Machine> {
        self.machines.iter().find(|m| m.status() == Status::Focused)
    }

    pub fn focused_mut(&mut self) -> Option<&mut Machine> {
        self.machines
            .iter_mut()
            .find(|m| m.status() == Status::Focused)
    }

    /// Every focused machine drops back to online. Runs to completion before
    /// any connect attempt starts, so a failed connect leaves zero focused
    /// machines rather than a stale one.
    pub fn unfocus_all(&mut self) {
        for machine in &mut self.machines {
            machine.unfocus();
        }
    }

    /// Connect or surface the named machine. Toggling a focused machine does
    /// nothing (disconnect is explicit); toggling a connecting machine is
    /// ignored and reported as busy.
    pub async fn toggle_connect(
        &mut self,
        name: &str,
        transport: &dyn Transport,
    ) -> Result<(), Error> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;

        match self.machines[idx].status() {
            Status::Focused => Ok(()),
            Status::Connecting => Err(Error::Busy(name.to_string())),
            Status::Online => {
                self.unfocus_all();
                self.machines[idx].focus_existing();
                Ok(())
            }
            Status::Offline => {
                self.unfocus_all();
                self.machines[idx].connect(transport).await
            }
        }
    }

    /// Force-connect path used by the dispatcher: an offline machine is
    /// connected, a background one surfaced. Either way the target ends up
    /// focused so path selection is valid on it.
    pub(crate) async fn ensure_connected(
        &mut self,
        idx: usize,
        transport: &dyn Transport,
    ) -> Result<(), Error> {
        match self.machines[idx].status() {
            Status::Offline => {
                self.unfocus_all();
                self.machines[idx].connect(transport).await
            }
            Status::Online => {
                self.unfocus_all();
                self.machines[idx].focus_existing();
                Ok(())
            }
            Status::Connecting => Err(Error::Busy(self.machines[idx].name().to_string())),
            Status::Focused => Ok(()),
        }
    }

    pub async fn disconnect(&mut self, name: &str) -> Result<(), Error> {
        let machine = self
            .get_mut(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        machine.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&mut self) {
        for machine in &mut self.machines {
            machine.disconnect().await;
        }
    }

    /// React to a session-closed event from the transport: the owning
    /// machine is reset to offline with its selection cleared.
    pub async fn session_closed(&mut self, label: &str) {
        if let Some(machine) = self.get_mut(label) {
            if machine.has_session() {
                tracing::warn!("Session for {} ended, marking offline", label);
                machine.disconnect().await;
            }
        }
    }

    pub fn add(&mut self, entry: &MachineEntry, config: &AppConfig) -> Result<(), Error> {
        let name = entry.display_name();
        if self.index_of(&name).is_some() {
            return Err(Error::UserInput(format!(
                "a machine named {} already exists",
                name
            )));
        }
        self.machines
            .push(Machine::from_entry(entry, config, self.events.clone()));
        Ok(())
    }

    pub async fn remove(&mut self, name: &str) -> Result<(), Error> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        self.machines[idx].disconnect().await;
        self.machines.remove(idx);
        Ok(())
    }

    /// Rebuild from freshly loaded configuration, carrying live sessions and
    /// selections over to machines that still exist (matched by name).
    /// Machines that disappeared from the configuration are disconnected.
    pub async fn refresh_from(&mut self, entries: &[MachineEntry], config: &AppConfig) {
        let mut previous = std::mem::take(&mut self.machines);
        self.rebuild(entries, config);

        for machine in &mut self.machines {
            if let Some(pos) = previous.iter().position(|p| p.name() == machine.name()) {
                let mut old = previous.swap_remove(pos);
                machine.restore_runtime(old.take_runtime());
            }
        }
        for mut stale in previous {
            stale.disconnect().await;
        }
    }

    /// Closest machine name to a query that matched nothing, for "did you
    /// mean" hints.
    pub fn suggest(&self, query: &str) -> Option<&str> {
        let matcher = SkimMatcherV2::default();
        self.machines
            .iter()
            .filter_map(|m| {
                matcher
                    .fuzzy_match(m.name(), query)
                    .map(|score| (score, m.name()))
            })
            .max_by_key(|(score, _)| *score)
            .map(|(_, name)| name)
    }
}

/// Parse `user@ip[:port]` machine input.
pub fn parse_target(input: &str) -> Result<(String, String, u16), Error> {
    let (user, rest) = input
        .split_once('@')
        .ok_or_else(|| Error::UserInput(format!("expected user@ip[:port], got {}", input)))?;
    if user.is_empty() {
        return Err(Error::UserInput("missing user before '@'".to_string()));
    }

    let (ip, port) = match rest.rsplit_once(':') {
        Some((ip, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::UserInput(format!("invalid port: {}", port)))?;
            (ip, port)
        }
        None => (rest, 22),
    };
    if ip.is_empty() {
        return Err(Error::UserInput("missing host after '@'".to_string()));
    }

    Ok((user.to_string(), ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, FakeTransport};

    fn collection(entries: &[MachineEntry]) -> MachineCollection {
        let (events, _rx) = EventBus::new();
        MachineCollection::from_entries(entries, &AppConfig::default(), events)
    }

    #[tokio::test]
    async fn connecting_second_machine_unfocuses_first() {
        let transport = FakeTransport::new();
        let mut c = collection(&[entry("alice", "10.0.0.5"), entry("bob", "10.0.0.6")]);

        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();
        assert_eq!(c.get("alice@10.0.0.5").unwrap().status(), Status::Focused);

        c.toggle_connect("bob@10.0.0.6", &transport).await.unwrap();
        assert_eq!(c.get("alice@10.0.0.5").unwrap().status(), Status::Online);
        assert_eq!(c.get("bob@10.0.0.6").unwrap().status(), Status::Focused);
        assert_eq!(c.iter().filter(|m| m.status() == Status::Focused).count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_leaves_zero_focused_machines() {
        let ok = FakeTransport::new();
        let down = FakeTransport::unreachable();
        let mut c = collection(&[entry("alice", "10.0.0.5"), entry("bob", "10.0.0.6")]);

        c.toggle_connect("alice@10.0.0.5", &ok).await.unwrap();
        let err = c.toggle_connect("bob@10.0.0.6", &down).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));

        // The first machine was unfocused before the attempt; the failed one
        // went back offline. Nobody is focused.
        assert_eq!(c.get("alice@10.0.0.5").unwrap().status(), Status::Online);
        assert_eq!(c.get("bob@10.0.0.6").unwrap().status(), Status::Offline);
        assert!(c.focused().is_none());
    }

    #[tokio::test]
    async fn toggling_focused_machine_is_a_noop() {
        let transport = FakeTransport::new();
        let mut c = collection(&[entry("alice", "10.0.0.5")]);

        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();
        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();

        let m = c.get("alice@10.0.0.5").unwrap();
        assert_eq!(m.status(), Status::Focused);
        assert!(m.has_session());
        assert_eq!(transport.opened_count(), 1);
    }

    #[tokio::test]
    async fn toggling_online_machine_focuses_without_reconnecting() {
        let transport = FakeTransport::new();
        let mut c = collection(&[entry("alice", "10.0.0.5"), entry("bob", "10.0.0.6")]);

        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();
        c.toggle_connect("bob@10.0.0.6", &transport).await.unwrap();
        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();

        assert_eq!(c.get("alice@10.0.0.5").unwrap().status(), Status::Focused);
        assert_eq!(c.get("bob@10.0.0.6").unwrap().status(), Status::Online);
        assert_eq!(transport.opened_count(), 2);
    }

    #[tokio::test]
    async fn toggle_while_connecting_is_ignored() {
        let transport = FakeTransport::new();
        let mut c = collection(&[entry("alice", "10.0.0.5")]);
        c.get_mut("alice@10.0.0.5")
            .unwrap()
            .force_status(Status::Connecting);

        let err = c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert_eq!(c.get("alice@10.0.0.5").unwrap().status(), Status::Connecting);
        assert_eq!(transport.opened_count(), 0);
    }

    #[tokio::test]
    async fn add_and_remove_machine_round_trip() {
        let (events, _rx) = EventBus::new();
        let mut c = MachineCollection::new(events);
        let config = AppConfig::default();

        let (user, ip, port) = parse_target("alice@10.0.0.5").unwrap();
        let e = MachineEntry {
            name: None,
            user,
            ip,
            port: Some(port),
            password: None,
            paths: Vec::new(),
        };
        c.add(&e, &config).unwrap();

        assert_eq!(c.len(), 1);
        let m = c.get("alice@10.0.0.5").unwrap();
        assert_eq!(m.user(), "alice");
        assert_eq!(m.ip(), "10.0.0.5");
        assert_eq!(m.port(), 22);
        assert!(m.paths().is_empty());

        c.remove("alice@10.0.0.5").await.unwrap();
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn refresh_keeps_live_sessions_for_surviving_machines() {
        let transport = FakeTransport::new();
        let entries = [entry("alice", "10.0.0.5"), entry("bob", "10.0.0.6")];
        let mut c = collection(&entries);
        c.toggle_connect("alice@10.0.0.5", &transport).await.unwrap();

        // bob disappears from the configuration, alice survives.
        c.refresh_from(&entries[..1], &AppConfig::default()).await;

        let alice = c.get("alice@10.0.0.5").unwrap();
        assert_eq!(alice.status(), Status::Focused);
        assert!(alice.has_session());
        assert!(c.get("bob@10.0.0.6").is_none());
    }

    #[test]
    fn parse_target_accepts_optional_port() {
        assert_eq!(
            parse_target("alice@10.0.0.5").unwrap(),
            ("alice".to_string(), "10.0.0.5".to_string(), 22)
        );
        assert_eq!(
            parse_target("bob@build-box:2222").unwrap(),
            ("bob".to_string(), "build-box".to_string(), 2222)
        );
        assert!(matches!(parse_target("nouser"), Err(Error::UserInput(_))));
        assert!(matches!(parse_target("@host"), Err(Error::UserInput(_))));
        assert!(matches!(
            parse_target("alice@host:notaport"),
            Err(Error::UserInput(_))
        ));
    }
}
