// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Fleet configuration — the YAML server list and global defaults
//!
//! Loaded and validated once, before any remote activity. Paths come back
//! with `~` already expanded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::transport::{DEFAULT_TIMEOUT_SECS, SshTarget};

/// Key file name used when neither the server nor the global section names one
pub const DEFAULT_SSH_KEY: &str = "id_rsa";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("configuration has no servers")]
    NoServers,
    #[error("server at index {0} is missing 'ip'")]
    MissingIp(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_ssh_key")]
    pub default_ssh_key: String,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,
    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
}

fn default_ssh_key() -> String { DEFAULT_SSH_KEY.to_string() }
fn default_ssh_key_path() -> PathBuf { PathBuf::from("~/.ssh") }
fn default_timeout() -> u64 { DEFAULT_TIMEOUT_SECS }
fn default_backup_root() -> PathBuf { PathBuf::from("~/vps-backups") }

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_ssh_key: default_ssh_key(),
            ssh_key_path: default_ssh_key_path(),
            timeout: default_timeout(),
            backup_root: default_backup_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Absent is a config error; empty is skipped at run time
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
}

impl Server {
    pub fn ip(&self) -> &str {
        self.ip.as_deref().unwrap_or("").trim()
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("No description")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbrConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl IbrConfig {
    /// Full path of the key this server should use
    pub fn key_path(&self, server: &Server) -> PathBuf {
        let name = server
            .ssh_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.global.default_ssh_key);
        self.global.ssh_key_path.join(name)
    }

    pub fn target(&self, server: &Server) -> SshTarget {
        SshTarget::new(server.ip(), &self.key_path(server), self.global.timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if let Some(idx) = self.servers.iter().position(|s| s.ip.is_none()) {
            return Err(ConfigError::MissingIp(idx));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.global.ssh_key_path = expand_home(&self.global.ssh_key_path);
        self.global.backup_root = expand_home(&self.global.backup_root);
    }
}

/// Replace a leading `~` with the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

pub fn parse_config(yaml: &str, origin: &str) -> Result<IbrConfig, ConfigError> {
    let mut config: IbrConfig = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })?;
    config.validate()?;
    config.expand_paths();
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<IbrConfig, ConfigError> {
    info!("Loading configuration from {}", path.display());
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&data, &path.display().to_string())
}
