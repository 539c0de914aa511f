//! Configuration loading.
//!
//! Sources, lowest priority first: built-in defaults, the TOML config file
//! (`$XDG_CONFIG_HOME/berth/config.toml` unless overridden), then
//! `BERTH__SECTION__KEY` environment variables. Paths go through
//! `shellexpand` after loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use berth_protocol::{ExecutionMode, IdleTimeout, ServiceOptions};
use config::{Config, Environment, File, FileFormat, Map};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::runtime::{DEFAULT_NUM_LOCKS, DEFAULT_OCI_RUNTIME, RuntimeConfig};
use crate::service::DEFAULT_SOCKET_PATH;

pub const APP_NAME: &str = "berth";

const ENV_PREFIX: &str = "BERTH";

/// Default service idle timeout, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub storage: StorageSection,
    pub service: ServiceSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub mode: ExecutionMode,
    /// Socket the tunnel backend connects to. Defaults to `service.socket_path`.
    pub remote_socket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root: String,
    pub num_locks: u32,
    pub default_oci_runtime: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: default_storage_root().display().to_string(),
            num_locks: DEFAULT_NUM_LOCKS,
            default_oci_runtime: DEFAULT_OCI_RUNTIME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub socket_path: String,
    /// `0` keeps the service running until it is signalled.
    pub idle_timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl AppConfig {
    /// Load from `path` (or the default location) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let file = config_file_path(path)?;
        let config = Self::load_from(&file, None)?;
        Ok((config, file))
    }

    /// Load from `file`, reading environment overrides from `env_vars` when
    /// given instead of the process environment.
    pub fn load_from(file: &Path, env_vars: Option<Map<String, String>>) -> Result<Self> {
        let built = Config::builder()
            .add_source(File::from(file).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", file.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .context("invalid configuration")?;
        config.storage.root = expand_str_path(&config.storage.root)?.display().to_string();
        config.service.socket_path = expand_str_path(&config.service.socket_path)?
            .display()
            .to_string();
        if let Some(socket) = config.engine.remote_socket.take() {
            config.engine.remote_socket = Some(expand_str_path(&socket)?.display().to_string());
        }
        debug!("loaded configuration from {:?}", file);
        Ok(config)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            root: PathBuf::from(&self.storage.root),
            num_locks: self.storage.num_locks,
            default_oci_runtime: self.storage.default_oci_runtime.clone(),
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            socket_path: PathBuf::from(&self.service.socket_path),
            idle_timeout: IdleTimeout::from_secs(self.service.idle_timeout_secs),
        }
    }

    /// Socket used in tunnel mode.
    pub fn remote_socket(&self) -> PathBuf {
        PathBuf::from(
            self.engine
                .remote_socket
                .as_deref()
                .unwrap_or(&self.service.socket_path),
        )
    }
}

/// Write the default configuration to `path`, refusing to overwrite unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
        path.display()
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve the config file: an explicit path (a directory means
/// `<dir>/config.toml`) or the default location.
pub fn config_file_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path.to_path_buf()),
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_storage_root() -> PathBuf {
    env::var_os("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(APP_NAME)
        .join("storage")
}
