use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One persisted machine definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    pub name: Option<String>,
    pub user: String,
    pub ip: String,
    pub port: Option<u16>,
    pub password: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl MachineEntry {
    /// Display name, derived from `user@ip` when none is configured.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.user, self.ip))
    }
}

/// One persisted macro definition. `group` selects the variant
/// ("local" | "remote" | "build" | "host"); the optional fields only apply
/// to build macros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroEntry {
    pub name: Option<String>,
    pub command: String,
    pub group: String,
    pub clean_command: Option<String>,
    pub sub_path: Option<String>,
    pub build_machine_ip: Option<String>,
    pub makefile_name: Option<String>,
}

/// Application settings plus the macro list, persisted as one TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Combined with `default_project_path` into the synthesized default
    /// working directory prepended to every machine's path list.
    pub default_root: Option<String>,
    pub default_project_path: Option<String>,
    /// Machine marked "(default)" in listings and used as the implicit
    /// build-macro target.
    pub default_build_ip: Option<String>,
    #[serde(default)]
    pub disable_password_warnings: bool,
    #[serde(default = "default_password_settle_ms")]
    pub password_settle_ms: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub macros: Vec<MacroEntry>,
}

fn default_password_settle_ms() -> u64 {
    800
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_root: None,
            default_project_path: None,
            default_build_ip: None,
            disable_password_warnings: false,
            password_settle_ms: default_password_settle_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            macros: Vec::new(),
        }
    }
}

impl AppConfig {
    /// The synthesized default path, when both parts are configured.
    pub fn default_path(&self) -> Option<String> {
        match (&self.default_root, &self.default_project_path) {
            (Some(root), Some(project)) => Some(format!(
                "{}/{}",
                root.trim_end_matches('/'),
                project.trim_start_matches('/')
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MachinesFile {
    #[serde(default)]
    machines: Vec<MachineEntry>,
}

#[derive(Debug)]
pub struct ConfigManager {
    config_file: PathBuf,
    machines_file: PathBuf,
}

impl ConfigManager {
    /// `dir` overrides the platform config directory (tests, --config-dir).
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .context("Could not find config directory")?
                .join("remac"),
        };

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        }

        Ok(Self {
            config_file: config_dir.join("remac.toml"),
            machines_file: config_dir.join("machines.toml"),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file
    }

    pub fn load_config(&self) -> Result<AppConfig> {
        // First run: write the defaults so the user has a file to edit.
        if !self.config_file.exists() {
            let default_config = AppConfig::default();
            self.save_config(&default_config)?;
        }

        let content =
            fs::read_to_string(&self.config_file).context("Failed to read config file")?;
        let config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_file, toml).context("Failed to write config file")?;
        Ok(())
    }

    pub fn load_machines(&self) -> Result<Vec<MachineEntry>> {
        if !self.machines_file.exists() {
            return Ok(Vec::new());
        }

        let content =
            fs::read_to_string(&self.machines_file).context("Failed to read machines file")?;
        let file: MachinesFile =
            toml::from_str(&content).context("Failed to parse machines file")?;

        tracing::info!("Loaded {} machine entries", file.machines.len());
        Ok(file.machines)
    }

    pub fn save_machines(&self, machines: &[MachineEntry]) -> Result<()> {
        let file = MachinesFile {
            machines: machines.to_vec(),
        };
        let toml = toml::to_string_pretty(&file).context("Failed to serialize machines")?;
        fs::write(&self.machines_file, toml).context("Failed to write machines file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConfigManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(Some(dir.path().to_path_buf())).unwrap();
        (manager, dir)
    }

    #[test]
    fn first_load_writes_defaults() {
        let (manager, _dir) = manager();
        assert!(!manager.config_path().exists());

        let config = manager.load_config().unwrap();
        assert!(manager.config_path().exists());
        assert_eq!(config.password_settle_ms, 800);
        assert!(!config.disable_password_warnings);
        assert!(config.macros.is_empty());
    }

    #[test]
    fn config_round_trips_macros_and_settings() {
        let (manager, _dir) = manager();
        let mut config = AppConfig::default();
        config.default_root = Some("/home/build".to_string());
        config.default_project_path = Some("proj".to_string());
        config.default_build_ip = Some("10.0.0.5".to_string());
        config.macros.push(MacroEntry {
            name: Some("fw".to_string()),
            command: "all".to_string(),
            group: "build".to_string(),
            clean_command: Some("clean".to_string()),
            sub_path: Some("sub".to_string()),
            build_machine_ip: None,
            makefile_name: None,
        });

        manager.save_config(&config).unwrap();
        let loaded = manager.load_config().unwrap();

        assert_eq!(loaded.default_build_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(loaded.macros.len(), 1);
        assert_eq!(loaded.macros[0].group, "build");
        assert_eq!(loaded.macros[0].clean_command.as_deref(), Some("clean"));
    }

    #[test]
    fn machines_round_trip() {
        let (manager, _dir) = manager();
        assert!(manager.load_machines().unwrap().is_empty());

        let entries = vec![MachineEntry {
            name: None,
            user: "alice".to_string(),
            ip: "10.0.0.5".to_string(),
            port: None,
            password: None,
            paths: vec!["/srv/app".to_string()],
        }];
        manager.save_machines(&entries).unwrap();

        let loaded = manager.load_machines().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].display_name(), "alice@10.0.0.5");
        assert_eq!(loaded[0].paths, vec!["/srv/app".to_string()]);
    }

    #[test]
    fn default_path_joins_root_and_project() {
        let config = AppConfig {
            default_root: Some("/home/build/".to_string()),
            default_project_path: Some("/proj".to_string()),
            ..AppConfig::default()
        };
        assert_eq!(config.default_path().as_deref(), Some("/home/build/proj"));

        assert_eq!(AppConfig::default().default_path(), None);
    }
}
