//! Execution mode selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where engine operations execute.
///
/// Decided once per process and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process, directly against the local runtime.
    #[default]
    Local,
    /// Forwarded to a remote `berth-service` over its unix socket.
    Tunnel,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 2] = [ExecutionMode::Local, ExecutionMode::Tunnel];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "abi" => Ok(ExecutionMode::Local),
            "tunnel" | "remote" => Ok(ExecutionMode::Tunnel),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}
