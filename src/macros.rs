use crate::config::MacroEntry;
use crate::error::Error;

/// Which of the three command strings a build macro should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Build,
    Clean,
    CleanAndBuild,
}

impl BuildKind {
    pub fn needs_clean(self) -> bool {
        matches!(self, BuildKind::Clean | BuildKind::CleanAndBuild)
    }
}

/// A stored command template. The four variants are matched exhaustively at
/// construction and at dispatch; there is no shared base with optional
/// fields.
#[derive(Debug, Clone)]
pub enum Macro {
    /// Literal shell line for the local terminal; no machine involved.
    Local { name: String, command: String },
    /// Literal shell line for a resolved machine's session.
    Remote { name: String, command: String },
    /// Build-tool invocation template, see [`BuildMacro`].
    Build(BuildMacro),
    /// Identifier dispatched to the surrounding application's own command
    /// surface.
    Host { name: String, command_id: String },
}

#[derive(Debug, Clone)]
pub struct BuildMacro {
    pub name: String,
    pub build_arg: String,
    pub clean_arg: Option<String>,
    /// Joined under the machine's selected path when one is resolved.
    pub sub_path: Option<String>,
    /// Target machine by ip; without one the build runs in the local
    /// terminal.
    pub machine_ip: Option<String>,
    pub makefile: Option<String>,
}

impl Macro {
    /// Build a macro from a persisted entry. Unknown groups are rejected so
    /// the caller can warn and skip, the way malformed hosts are skipped on
    /// load.
    pub fn from_entry(entry: &MacroEntry) -> Result<Self, Error> {
        let name = entry
            .name
            .clone()
            .unwrap_or_else(|| entry.command.clone());

        match entry.group.as_str() {
            "local" => Ok(Macro::Local {
                name,
                command: entry.command.clone(),
            }),
            "remote" => Ok(Macro::Remote {
                name,
                command: entry.command.clone(),
            }),
            "build" => Ok(Macro::Build(BuildMacro {
                name,
                build_arg: entry.command.clone(),
                clean_arg: entry.clean_command.clone(),
                sub_path: entry.sub_path.clone(),
                machine_ip: entry.build_machine_ip.clone(),
                makefile: entry.makefile_name.clone(),
            })),
            "host" => Ok(Macro::Host {
                name,
                command_id: entry.command.clone(),
            }),
            other => Err(Error::UserInput(format!(
                "macro {} has unknown group {}",
                name, other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Macro::Local { name, .. }
            | Macro::Remote { name, .. }
            | Macro::Host { name, .. } => name,
            Macro::Build(build) => &build.name,
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            Macro::Local { .. } => "local",
            Macro::Remote { .. } => "remote",
            Macro::Build(_) => "build",
            Macro::Host { .. } => "host",
        }
    }

    /// Short human-readable description for listings.
    pub fn doc(&self) -> String {
        match self {
            Macro::Local { command, .. } | Macro::Remote { command, .. } => command.clone(),
            Macro::Host { command_id, .. } => command_id.clone(),
            Macro::Build(build) => {
                let target = build
                    .machine_ip
                    .as_deref()
                    .unwrap_or("local terminal");
                format!("make {} on {}", build.build_arg, target)
            }
        }
    }
}

impl BuildMacro {
    /// Directory handed to `make -C`: the macro's sub-path joined under the
    /// resolved working directory, whichever parts exist.
    fn target_dir(&self, base: Option<&str>) -> Option<String> {
        match (base, self.sub_path.as_deref()) {
            (Some(base), Some(sub)) => Some(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                sub.trim_start_matches('/')
            )),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(sub)) => Some(sub.to_string()),
            (None, None) => None,
        }
    }

    fn invocation(&self, arg: &str, dir: Option<&str>) -> String {
        let mut command = String::from("make");
        if let Some(dir) = dir {
            command.push_str(" -C ");
            command.push_str(dir);
        }
        if let Some(makefile) = &self.makefile {
            command.push_str(" -f ");
            command.push_str(makefile);
        }
        command.push(' ');
        command.push_str(arg);
        command
    }

    /// Materialize the command string for `kind`, relative to `base` (the
    /// machine's selected path, when the build targets a machine).
    pub fn make_command(&self, kind: BuildKind, base: Option<&str>) -> Result<String, Error> {
        let dir = self.target_dir(base);
        let dir = dir.as_deref();

        let clean = || {
            self.clean_arg.as_deref().ok_or_else(|| {
                Error::MissingCapability(format!(
                    "macro {} has no clean command configured",
                    self.name
                ))
            })
        };

        match kind {
            BuildKind::Build => Ok(self.invocation(&self.build_arg, dir)),
            BuildKind::Clean => Ok(self.invocation(clean()?, dir)),
            BuildKind::CleanAndBuild => Ok(format!(
                "{}; {}",
                self.invocation(clean()?, dir),
                self.invocation(&self.build_arg, dir)
            )),
        }
    }
}
