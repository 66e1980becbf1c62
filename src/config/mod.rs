//! Settings file handling.
//!
//! Everything has a default, so a missing `~/.tunshare/config.yml` is fine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;
use crate::host::command::{CommandHost, MachineConfig, ProxyCommands};

/// Relay endpoint used when a share name carries no host suffix.
pub const DEFAULT_TCP_ENDPOINT: &str = "0.tcp.ngrok.io";
pub const DEFAULT_TCP_DOMAIN: &str = "tcp.ngrok.io";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub relay: RelaySettings,
    /// Directory holding the IP and port lock files.
    pub lock_dir: PathBuf,
    pub control_api: ControlApiSettings,
    pub connect: ConnectSettings,
    pub machines: BTreeMap<String, MachineConfig>,
    pub proxy: ProxyCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            lock_dir: std::env::temp_dir().join("tunshare"),
            control_api: ControlApiSettings::default(),
            connect: ConnectSettings::default(),
            machines: BTreeMap::new(),
            proxy: ProxyCommands::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub binary: String,
    /// User-level relay configuration merged under the per-session one.
    pub base_config: PathBuf,
    pub tcp_endpoint: String,
    pub tcp_domain: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            binary: "ngrok".to_string(),
            base_config: expand_path(Path::new("~/.ngrok2/ngrok.yml")),
            tcp_endpoint: DEFAULT_TCP_ENDPOINT.to_string(),
            tcp_domain: DEFAULT_TCP_DOMAIN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlApiSettings {
    pub bind: String,
}

impl Default for ControlApiSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    pub ping_interval_secs: u64,
    pub key_file_ttl_secs: u64,
    pub ssh_binary: String,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            key_file_ttl_secs: 45,
            ssh_binary: "ssh".to_string(),
        }
    }
}

impl ConnectSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn key_file_ttl(&self) -> Duration {
        Duration::from_secs(self.key_file_ttl_secs)
    }
}

impl Settings {
    /// `~/.tunshare`, where settings and logs live.
    pub fn data_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".tunshare"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("config.yml"))
    }

    /// Loads `path`, or the default location when `None`.
    ///
    /// An explicitly given file must exist; the default one may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (expand_path(path), true),
            None => (Self::default_path()?, false),
        };

        // A missing default file just means defaults
        if !path.exists() {
            anyhow::ensure!(!required, "Config file not found: {:?}", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        // `~` is not expanded by serde
        settings.lock_dir = expand_path(&settings.lock_dir);
        settings.relay.base_config = expand_path(&settings.relay.base_config);
        Ok(settings)
    }

    /// Host adapter for the machine called `name`, or the only configured
    /// machine when no name is given.
    pub fn host(&self, name: Option<&str>) -> std::result::Result<CommandHost, ShareError> {
        let (name, machine) = match name {
            Some(name) => {
                let machine = self
                    .machines
                    .get(name)
                    .ok_or_else(|| ShareError::UnknownMachine(name.to_string()))?;
                (name.to_string(), machine.clone())
            }
            None if self.machines.len() > 1 => {
                return Err(ShareError::UnknownMachine(
                    "<unnamed>: several machines are configured, name one".to_string(),
                ));
            }
            None => self
                .machines
                .iter()
                .next()
                .map(|(name, machine)| (name.clone(), machine.clone()))
                .unwrap_or_else(|| ("default".to_string(), MachineConfig::default())),
        };
        Ok(CommandHost::new(name, machine, self.proxy.clone()))
    }

    /// Host adapter that only runs proxy hosts (used by `connect`).
    pub fn proxy_host(&self) -> CommandHost {
        CommandHost::new("connect", MachineConfig::default(), self.proxy.clone())
    }
}

/// Replaces a leading `~` with the home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
