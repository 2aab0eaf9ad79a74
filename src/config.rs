//! Configuration loading and persistence.
//!
//! Reads and writes `config.json` in the platform config directory, with
//! `HASHKITTY_*` environment-variable overrides on top. Both the relay
//! and the agent read the same file; each uses the fields it needs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// Configuration for the hashkitty CLI.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Relay URL the agent dials.
    pub relay_url: String,
    /// Address the relay listener binds.
    pub bind_addr: String,
    /// Expected `Origin` header for incoming connections. `None` accepts
    /// any origin (the default); public deployments should set this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origin: Option<String>,
    /// Hashcat executable: a bare command name (PATH lookup) or a path,
    /// `~`-expanded.
    pub hashcat_path: String,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue: usize,
    /// Seconds the relay waits for connections to drain on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5001/ws".to_string(),
            bind_addr: "0.0.0.0:5001".to_string(),
            allowed_origin: None,
            hashcat_path: "hashcat".to_string(),
            outbound_queue: 256,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `HASHKITTY_CONFIG_DIR` overrides the platform default.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("HASHKITTY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("hashkitty")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file (falling back to defaults), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(relay_url) = std::env::var("HASHKITTY_RELAY_URL") {
            self.relay_url = relay_url;
        }
        if let Ok(bind_addr) = std::env::var("HASHKITTY_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Ok(origin) = std::env::var("HASHKITTY_ALLOWED_ORIGIN") {
            self.allowed_origin = Some(origin);
        }
        if let Ok(hashcat_path) = std::env::var("HASHKITTY_HASHCAT_PATH") {
            self.hashcat_path = hashcat_path;
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Resolve the hashcat executable, expanding `~`.
    ///
    /// # Errors
    ///
    /// Returns an error when an explicit path (anything with a directory
    /// component) does not exist. Bare command names are left to PATH
    /// resolution at spawn time.
    pub fn hashcat_executable(&self) -> Result<PathBuf> {
        let expanded = shellexpand::tilde(&self.hashcat_path);
        let path = PathBuf::from(expanded.as_ref());
        if path.components().count() > 1 && !path.exists() {
            anyhow::bail!("hashcat executable not found at {}", path.display());
        }
        Ok(path)
    }
}
