use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;

use crate::collection::{parse_target, MachineCollection};
use crate::config::{AppConfig, ConfigManager, MachineEntry, MacroEntry};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::events::EventBus;
use crate::macros::{BuildKind, Macro};
use crate::session::Transport;

const HELP: &str = "\
commands:
  machines                         list machines and their status
  add-machine <user@ip[:port]>     register a machine
  remove-machine <name>            unregister a machine
  connect <name>                   connect or focus a machine
  disconnect <name>                close a machine's session
  paths <name>                     list a machine's working directories
  add-path <name> <path>           register an absolute working directory
  remove-path <name> <path>        remove a working directory
  select <name> <path>             cd the focused machine into a path
  unselect <name>                  clear the path selection
  macros                           list macros with their indices
  add-macro <group> <name> <cmd>   add a local/remote/host macro
  remove-macro <index>             remove a macro by its listed index
  run <macro> [machine]            run a macro
  build|clean|rebuild <macro>      run a build macro variant
  send <text>                      feed a line to the focused machine
  refresh                          re-read configuration from disk
  open-config                      open the settings file
  quit";

/// The application behind the REPL: the machine collection, the macro list,
/// and the configuration they were loaded from. Every REPL command maps to
/// one operation here.
pub struct App {
    config_manager: ConfigManager,
    pub config: AppConfig,
    machine_entries: Vec<MachineEntry>,
    pub machines: MachineCollection,
    pub macros: Vec<Macro>,
    pub dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    events: EventBus,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        config_manager: ConfigManager,
        config: AppConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Result<Self> {
        let machine_entries = config_manager
            .load_machines()
            .context("Failed to load machines")?;

        warn_plaintext_passwords(&machine_entries, &config, &events);

        let machines = MachineCollection::from_entries(&machine_entries, &config, events.clone());
        let macros = build_macros(&config.macros, &events);
        let dispatcher = Dispatcher::new(transport.clone(), events.clone());

        Ok(Self {
            config_manager,
            config,
            machine_entries,
            machines,
            macros,
            dispatcher,
            transport,
            events,
            should_quit: false,
        })
    }

    /// Parse and execute one command line. Failures never propagate; they
    /// are reported as warnings on the event bus.
    pub async fn handle_line(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return;
        };
        let args: Vec<&str> = parts.collect();

        let result = match command {
            "help" => {
                self.events.notice(HELP);
                Ok(())
            }
            "machines" => {
                self.list_machines();
                Ok(())
            }
            "add-machine" => self.add_machine(&args).await,
            "remove-machine" => self.remove_machine(&args).await,
            "connect" => self.connect(&args).await,
            "disconnect" => self.disconnect(&args).await,
            "paths" => self.list_paths(&args),
            "add-path" => self.add_path(&args),
            "remove-path" => self.remove_path(&args),
            "select" => self.select_path(&args).await,
            "unselect" => self.unselect_path(&args),
            "macros" => {
                self.list_macros();
                Ok(())
            }
            "add-macro" => self.add_macro(&args),
            "remove-macro" => self.remove_macro(&args),
            "run" => self.run_macro(&args, BuildKind::Build).await,
            "build" => self.run_build(&args, BuildKind::Build).await,
            "clean" => self.run_build(&args, BuildKind::Clean).await,
            "rebuild" => self.run_build(&args, BuildKind::CleanAndBuild).await,
            "send" => self.send_line(&args).await,
            "refresh" => self.refresh().await,
            "open-config" => self.open_config(),
            "quit" | "exit" => {
                self.should_quit = true;
                Ok(())
            }
            other => {
                self.events
                    .warn(format!("unknown command: {} (try `help`)", other));
                Ok(())
            }
        };

        if let Err(err) = result {
            self.events.warn(err.to_string());
        }
    }

    /// Host-command macros land back here: they invoke the application's own
    /// command surface.
    pub async fn run_host_command(&mut self, id: &str) {
        match id {
            "refresh" => {
                if let Err(err) = self.refresh().await {
                    self.events.warn(err.to_string());
                }
            }
            "open-config" => {
                if let Err(err) = self.open_config() {
                    self.events.warn(err.to_string());
                }
            }
            other => self
                .events
                .warn(format!("unknown host command: {}", other)),
        }
    }

    pub async fn shutdown(&mut self) {
        self.machines.disconnect_all().await;
        self.dispatcher.shutdown().await;
    }

    fn list_machines(&self) {
        if self.machines.is_empty() {
            self.events.notice("no machines configured");
            return;
        }
        let mut out = String::new();
        let focused = self
            .machines
            .focused()
            .map(|m| format!(", focused: {}", m.name()))
            .unwrap_or_default();
        let _ = writeln!(out, "{} machine(s){}", self.machines.len(), focused);
        for machine in self.machines.iter() {
            let default = if machine.is_default_target() {
                " (default)"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "{:<24} {}@{}:{}  {}{}",
                machine.name(),
                machine.user(),
                machine.ip(),
                machine.port(),
                machine.status(),
                default
            );
        }
        self.events.notice(out.trim_end().to_string());
    }

    async fn add_machine(&mut self, args: &[&str]) -> Result<()> {
        let [input] = args else {
            self.events.warn("usage: add-machine <user@ip[:port]>");
            return Ok(());
        };
        let (user, ip, port) = parse_target(input)?;
        let entry = MachineEntry {
            name: None,
            user,
            ip,
            port: Some(port),
            password: None,
            paths: Vec::new(),
        };

        self.machines.add(&entry, &self.config)?;
        self.machine_entries.push(entry);
        self.config_manager.save_machines(&self.machine_entries)?;
        self.events.notice(format!("added {}", input));
        Ok(())
    }

    async fn remove_machine(&mut self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: remove-machine <name>");
            return Ok(());
        };
        self.machines.remove(name).await?;
        self.machine_entries
            .retain(|entry| entry.display_name() != *name);
        self.config_manager.save_machines(&self.machine_entries)?;
        self.events.notice(format!("removed {}", name));
        Ok(())
    }

    async fn connect(&mut self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: connect <name>");
            return Ok(());
        };
        if self.machines.get(name).is_none() {
            self.warn_unknown_machine(name);
            return Ok(());
        }
        self.machines
            .toggle_connect(name, self.transport.as_ref())
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: disconnect <name>");
            return Ok(());
        };
        self.machines.disconnect(name).await?;
        Ok(())
    }

    fn list_paths(&self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: paths <name>");
            return Ok(());
        };
        let machine = self
            .machines
            .get(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;

        if machine.paths().is_empty() {
            self.events.notice(format!("{} has no paths", name));
            return Ok(());
        }
        let mut out = String::new();
        for path in machine.paths() {
            let marker = if machine.selected_path() == Some(path.as_str()) {
                "*"
            } else {
                " "
            };
            let _ = writeln!(out, "{} {}", marker, path);
        }
        self.events.notice(out.trim_end().to_string());
        Ok(())
    }

    fn add_path(&mut self, args: &[&str]) -> Result<()> {
        let [name, path] = args else {
            self.events.warn("usage: add-path <name> <path>");
            return Ok(());
        };
        if !path.starts_with('/') {
            return Err(Error::UserInput(format!("path must be absolute: {}", path)).into());
        }
        let machine = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        machine.add_path(path)?;
        self.persist_paths(name)?;
        Ok(())
    }

    fn remove_path(&mut self, args: &[&str]) -> Result<()> {
        let [name, path] = args else {
            self.events.warn("usage: remove-path <name> <path>");
            return Ok(());
        };
        let machine = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        machine.remove_path(path)?;
        self.persist_paths(name)?;
        Ok(())
    }

    /// Mirror a machine's configured paths (never the synthesized default)
    /// back into its persisted entry.
    fn persist_paths(&mut self, name: &str) -> Result<()> {
        let paths = match self.machines.get(name) {
            Some(machine) => machine.configured_paths().to_vec(),
            None => return Ok(()),
        };
        if let Some(entry) = self
            .machine_entries
            .iter_mut()
            .find(|entry| entry.display_name() == name)
        {
            entry.paths = paths;
            self.config_manager.save_machines(&self.machine_entries)?;
        }
        Ok(())
    }

    async fn select_path(&mut self, args: &[&str]) -> Result<()> {
        let [name, path] = args else {
            self.events.warn("usage: select <name> <path>");
            return Ok(());
        };
        let machine = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        machine.select_path(path).await?;
        Ok(())
    }

    fn unselect_path(&mut self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: unselect <name>");
            return Ok(());
        };
        let machine = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?;
        machine.unselect_path();
        Ok(())
    }

    fn list_macros(&self) {
        if self.macros.is_empty() {
            self.events.notice("no macros configured");
            return;
        }
        let mut out = String::new();
        for (idx, mac) in self.macros.iter().enumerate() {
            let _ = writeln!(
                out,
                "[{}] {:<20} {:<6} {}",
                idx,
                mac.name(),
                mac.group(),
                mac.doc()
            );
        }
        self.events.notice(out.trim_end().to_string());
    }

    fn add_macro(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 3 {
            self.events
                .warn("usage: add-macro <local|remote|host|build> <name> <command>");
            return Ok(());
        }
        let entry = MacroEntry {
            name: Some(args[1].to_string()),
            command: args[2..].join(" "),
            group: args[0].to_string(),
            clean_command: None,
            sub_path: None,
            build_machine_ip: None,
            makefile_name: None,
        };
        // Validate the group before persisting anything.
        let mac = Macro::from_entry(&entry)?;

        self.config.macros.push(entry);
        self.config_manager.save_config(&self.config)?;
        self.events.notice(format!("added macro {}", mac.name()));
        self.macros.push(mac);
        Ok(())
    }

    fn remove_macro(&mut self, args: &[&str]) -> Result<()> {
        // Macros have no identity beyond their fields (two may share a
        // command), so removal goes by the listed index.
        let [index] = args else {
            self.events.warn("usage: remove-macro <index>");
            return Ok(());
        };
        let index: usize = index
            .parse()
            .map_err(|_| Error::UserInput(format!("not an index: {}", index)))?;
        if index >= self.config.macros.len() {
            return Err(Error::UserInput(format!("no macro at index {}", index)).into());
        }

        let removed = self.config.macros.remove(index);
        self.config_manager.save_config(&self.config)?;
        self.macros = build_macros(&self.config.macros, &self.events);
        self.events.notice(format!(
            "removed macro {}",
            removed.name.unwrap_or(removed.command)
        ));
        Ok(())
    }

    async fn run_macro(&mut self, args: &[&str], kind: BuildKind) -> Result<()> {
        let (name, explicit) = match args {
            [name] => (*name, None),
            [name, machine] => (*name, Some(machine.to_string())),
            _ => {
                self.events.warn("usage: run <macro> [machine]");
                return Ok(());
            }
        };
        let Some(mac) = self.find_macro(name).cloned() else {
            self.warn_unknown_macro(name);
            return Ok(());
        };
        self.dispatcher
            .dispatch(
                &mac,
                kind,
                &mut self.machines,
                explicit.as_deref(),
                &self.config,
            )
            .await?;
        Ok(())
    }

    async fn run_build(&mut self, args: &[&str], kind: BuildKind) -> Result<()> {
        let [name] = args else {
            self.events.warn("usage: build|clean|rebuild <macro>");
            return Ok(());
        };
        let Some(mac) = self.find_macro(name).cloned() else {
            self.warn_unknown_macro(name);
            return Ok(());
        };
        if !matches!(mac, Macro::Build(_)) {
            return Err(Error::UserInput(format!("{} is not a build macro", name)).into());
        }
        self.dispatcher
            .dispatch(&mac, kind, &mut self.machines, None, &self.config)
            .await?;
        Ok(())
    }

    async fn send_line(&mut self, args: &[&str]) -> Result<()> {
        if args.is_empty() {
            self.events.warn("usage: send <text>");
            return Ok(());
        }
        let machine = self
            .machines
            .focused_mut()
            .ok_or_else(|| Error::NoTarget("no machine selected".to_string()))?;
        machine.send(&args.join(" ")).await?;
        Ok(())
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.config = self
            .config_manager
            .load_config()
            .context("Failed to reload config")?;
        self.machine_entries = self
            .config_manager
            .load_machines()
            .context("Failed to reload machines")?;

        warn_plaintext_passwords(&self.machine_entries, &self.config, &self.events);
        self.machines
            .refresh_from(&self.machine_entries, &self.config)
            .await;
        self.macros = build_macros(&self.config.macros, &self.events);
        self.events.notice("configuration reloaded");
        Ok(())
    }

    fn open_config(&self) -> Result<()> {
        open::that(self.config_manager.config_path())
            .context("Failed to open the settings file")?;
        Ok(())
    }

    fn find_macro(&self, name: &str) -> Option<&Macro> {
        self.macros.iter().find(|mac| mac.name() == name)
    }

    fn warn_unknown_machine(&self, name: &str) {
        match self.machines.suggest(name) {
            Some(suggestion) => self.events.warn(format!(
                "no machine named {} (did you mean {}?)",
                name, suggestion
            )),
            None => self.events.warn(format!("no machine named {}", name)),
        }
    }

    fn warn_unknown_macro(&self, name: &str) {
        let matcher = SkimMatcherV2::default();
        let suggestion = self
            .macros
            .iter()
            .filter_map(|mac| {
                matcher
                    .fuzzy_match(mac.name(), name)
                    .map(|score| (score, mac.name()))
            })
            .max_by_key(|(score, _)| *score)
            .map(|(_, name)| name);

        match suggestion {
            Some(suggestion) => self.events.warn(format!(
                "no macro named {} (did you mean {}?)",
                name, suggestion
            )),
            None => self.events.warn(format!("no macro named {}", name)),
        }
    }
}

fn build_macros(entries: &[MacroEntry], events: &EventBus) -> Vec<Macro> {
    let mut macros = Vec::new();
    for entry in entries {
        match Macro::from_entry(entry) {
            Ok(mac) => macros.push(mac),
            Err(err) => {
                tracing::warn!("Skipping macro: {}", err);
                events.warn(format!("skipping macro: {}", err));
            }
        }
    }
    macros
}

fn warn_plaintext_passwords(entries: &[MachineEntry], config: &AppConfig, events: &EventBus) {
    if config.disable_password_warnings {
        return;
    }
    for entry in entries {
        if entry.password.is_some() {
            events.warn(format!(
                "{} stores a plaintext password in machines.toml; prefer ssh keys \
                 (disable_password_warnings silences this)",
                entry.display_name()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Status;
    use crate::testutil::FakeTransport;

    async fn app(transport: Arc<FakeTransport>) -> (App, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        let config = manager.load_config().unwrap();
        let (events, _rx) = EventBus::new();
        let app = App::new(manager, config, transport, events).unwrap();
        (app, dir)
    }

    #[tokio::test]
    async fn add_machine_registers_and_persists() {
        let transport = Arc::new(FakeTransport::new());
        let (mut app, dir) = app(transport).await;

        app.handle_line("add-machine alice@10.0.0.5").await;
        assert_eq!(app.machines.len(), 1);
        let machine = app.machines.get("alice@10.0.0.5").unwrap();
        assert_eq!(machine.ip(), "10.0.0.5");
        assert_eq!(machine.port(), 22);
        assert!(machine.paths().is_empty());

        // Persisted: a fresh manager over the same directory sees it.
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        let entries = manager.load_machines().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name(), "alice@10.0.0.5");

        app.handle_line("remove-machine alice@10.0.0.5").await;
        assert!(app.machines.is_empty());
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        assert!(manager.load_machines().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_absolute_path_is_rejected() {
        let transport = Arc::new(FakeTransport::new());
        let (mut app, _dir) = app(transport).await;

        app.handle_line("add-machine alice@10.0.0.5").await;
        app.handle_line("add-path alice@10.0.0.5 relative/dir").await;

        assert!(app
            .machines
            .get("alice@10.0.0.5")
            .unwrap()
            .paths()
            .is_empty());
    }

    #[tokio::test]
    async fn connect_and_run_macro_end_to_end() {
        let transport = Arc::new(FakeTransport::new());
        let (mut app, _dir) = app(transport.clone()).await;

        app.handle_line("add-machine alice@10.0.0.5").await;
        app.handle_line("add-macro remote kernel-version uname -r").await;
        app.handle_line("connect alice@10.0.0.5").await;
        assert_eq!(
            app.machines.get("alice@10.0.0.5").unwrap().status(),
            Status::Focused
        );

        app.handle_line("run kernel-version").await;
        assert_eq!(transport.sent_lines(), vec!["uname -r".to_string()]);
    }

    #[tokio::test]
    async fn plaintext_password_warning_respects_the_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        let mut entry = crate::testutil::entry("alice", "10.0.0.5");
        entry.password = Some("hunter2".to_string());
        manager.save_machines(&[entry]).unwrap();

        let (events, mut rx) = EventBus::new();
        let config = manager.load_config().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let _app = App::new(manager, config, transport.clone(), events).unwrap();

        let warned = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(&event, crate::events::AppEvent::Warning(msg)
                if msg.contains("plaintext password"))
        });
        assert!(warned);

        // Same setup with warnings disabled stays quiet.
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        let mut config = manager.load_config().unwrap();
        config.disable_password_warnings = true;
        let (events, mut rx) = EventBus::new();
        let _app = App::new(manager, config, transport, events).unwrap();
        let warned = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(&event, crate::events::AppEvent::Warning(msg)
                if msg.contains("plaintext password"))
        });
        assert!(!warned);
    }

    #[tokio::test]
    async fn remove_macro_goes_by_index() {
        let transport = Arc::new(FakeTransport::new());
        let (mut app, _dir) = app(transport).await;

        app.handle_line("add-macro local hello echo hello").await;
        app.handle_line("add-macro local hello echo hello").await;
        assert_eq!(app.macros.len(), 2);

        // Identical macros are only distinguishable by index.
        app.handle_line("remove-macro 0").await;
        assert_eq!(app.macros.len(), 1);
        assert_eq!(app.config.macros.len(), 1);
    }
}
