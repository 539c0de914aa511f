//! System-level options and reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::containers::ContainerSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub host: HostInfo,
    pub store: StoreInfo,
    pub runtime: RuntimeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub cpus: usize,
    pub rootless: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub root: PathBuf,
    pub image_count: usize,
    pub container_count: usize,
    pub running: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub default_oci_runtime: String,
    pub num_locks: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemDfOptions {
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfImageEntry {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: u64,
    pub containers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDfReport {
    pub images: Vec<DfImageEntry>,
    pub containers: Vec<ContainerSummary>,
    /// Sum of all image sizes.
    pub images_size: u64,
    /// Bytes held by images no container uses.
    pub reclaimable_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemResetOptions {
    /// Reset even while containers are running.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMigrateOptions {
    /// Rebind every container to this OCI runtime.
    pub new_runtime: Option<String>,
}

/// `system renumber` takes no options beyond the configured lock count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRenumberOptions {}

/// How long the service waits without requests before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum IdleTimeout {
    After(Duration),
    /// Serve until signalled.
    Unlimited,
}

impl IdleTimeout {
    /// Matches the reference daemon's default service duration.
    pub const DEFAULT: IdleTimeout = IdleTimeout::After(Duration::from_secs(5));

    /// `0` is the "run indefinitely" sentinel.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            IdleTimeout::Unlimited
        } else {
            IdleTimeout::After(Duration::from_secs(secs))
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            IdleTimeout::After(d) => Some(*d),
            IdleTimeout::Unlimited => None,
        }
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u64> for IdleTimeout {
    fn from(secs: u64) -> Self {
        IdleTimeout::from_secs(secs)
    }
}

impl From<IdleTimeout> for u64 {
    fn from(timeout: IdleTimeout) -> Self {
        match timeout {
            IdleTimeout::After(d) => d.as_secs().max(1),
            IdleTimeout::Unlimited => 0,
        }
    }
}

impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleTimeout::After(d) => write!(f, "{}s", d.as_secs_f64()),
            IdleTimeout::Unlimited => write!(f, "unlimited"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    pub socket_path: PathBuf,
    pub idle_timeout: IdleTimeout,
}
