use std::sync::Arc;

use crate::collection::MachineCollection;
use crate::config::AppConfig;
use crate::error::Error;
use crate::events::{AppEvent, EventBus};
use crate::macros::{BuildKind, Macro};
use crate::session::{Session, Transport};

/// Label sessions opened for local macros and machine-less builds report
/// under on the event bus.
pub const LOCAL_LABEL: &str = "local";

/// Resolves the machine a macro runs against, materializes the command line,
/// and sends it. Owns the shared local terminal session, created on first
/// use and reused while it stays usable.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    events: EventBus,
    local: Option<Box<dyn Session>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus) -> Self {
        Self {
            transport,
            events,
            local: None,
        }
    }

    /// Run a macro. `explicit` names a machine chosen by the caller (remote
    /// macros only); `kind` picks the command string of build macros and is
    /// ignored by the other variants.
    pub async fn dispatch(
        &mut self,
        mac: &Macro,
        kind: BuildKind,
        machines: &mut MachineCollection,
        explicit: Option<&str>,
        config: &AppConfig,
    ) -> Result<(), Error> {
        match mac {
            Macro::Local { name, command } => {
                tracing::info!("Running local macro {}", name);
                self.send_local(command).await
            }
            Macro::Host { name, command_id } => {
                tracing::info!("Dispatching host command macro {}", name);
                self.events.emit(AppEvent::HostCommand(command_id.clone()));
                Ok(())
            }
            Macro::Remote { name, command } => {
                tracing::info!("Running remote macro {}", name);
                self.send_remote(command, machines, explicit).await
            }
            Macro::Build(build) => {
                tracing::info!("Running build macro {} ({:?})", build.name, kind);
                self.send_build(build, kind, machines, config).await
            }
        }
    }

    /// Close the local terminal session, if one was ever opened.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.local.take() {
            session.close().await;
        }
    }

    async fn local_session(&mut self) -> Result<&mut Box<dyn Session>, Error> {
        let reopen = match &self.local {
            Some(session) => !session.is_usable(),
            None => true,
        };
        if reopen {
            self.local = Some(self.transport.open_local(LOCAL_LABEL).await?);
        }
        self.local
            .as_mut()
            .ok_or_else(|| Error::AuthOrTransport("local terminal unavailable".to_string()))
    }

    async fn send_local(&mut self, command: &str) -> Result<(), Error> {
        let session = self.local_session().await?;
        session.send(command).await
    }

    async fn send_remote(
        &mut self,
        command: &str,
        machines: &mut MachineCollection,
        explicit: Option<&str>,
    ) -> Result<(), Error> {
        let idx = match explicit {
            Some(name) => machines
                .index_of(name)
                .ok_or_else(|| Error::NoTarget(format!("no machine named {}", name)))?,
            None => machines
                .focused_index()
                .ok_or_else(|| Error::NoTarget("no machine selected".to_string()))?,
        };

        machines.ensure_connected(idx, self.transport.as_ref()).await?;
        let machine = machines.machine_mut(idx);

        // Remote commands are not necessarily path-sensitive; pick up the
        // default working directory when nothing is selected, but run either
        // way.
        if let Err(err) = machine.default_path().await {
            tracing::debug!("{}: no working directory resolved: {}", machine.name(), err);
        }
        machine.send(command).await
    }

    async fn send_build(
        &mut self,
        build: &crate::macros::BuildMacro,
        kind: BuildKind,
        machines: &mut MachineCollection,
        config: &AppConfig,
    ) -> Result<(), Error> {
        // A clean that cannot be expressed must fail before any connection
        // work happens.
        if kind.needs_clean() && build.clean_arg.is_none() {
            return Err(Error::MissingCapability(format!(
                "macro {} has no clean command configured",
                build.name
            )));
        }

        let target_ip = build
            .machine_ip
            .as_deref()
            .or(config.default_build_ip.as_deref());

        let Some(ip) = target_ip else {
            // No target machine anywhere: the build runs locally.
            let command = build.make_command(kind, None)?;
            return self.send_local(&command).await;
        };

        let idx = machines.index_by_ip(ip).ok_or_else(|| {
            Error::MissingCapability(format!("no machine with ip {} in the registry", ip))
        })?;

        machines.ensure_connected(idx, self.transport.as_ref()).await?;
        let machine = machines.machine_mut(idx);

        let base = machine
            .default_path()
            .await?
            .ok_or_else(|| Error::NoTarget("no path selected".to_string()))?;

        let command = build.make_command(kind, Some(&base))?;
        machine.send(&command).await
    }
}
