//! Container records as seen through the engine interfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    #[default]
    Created,
    Running,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Image id the container was created from.
    pub image: String,
    pub state: ContainerState,
    /// OCI runtime binding, e.g. `runc` or `crun`.
    pub oci_runtime: String,
    /// Slot in the fixed-size lock table.
    pub lock_slot: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerCreateOptions {
    /// Generated when absent.
    pub name: Option<String>,
    /// Image name or id.
    pub image: String,
    /// Defaults to the runtime's configured OCI runtime.
    pub oci_runtime: Option<String>,
}
