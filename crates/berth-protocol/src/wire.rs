//! HTTP wire format spoken between the tunnel backend and `berth-service`.
//!
//! One endpoint per capability operation, JSON bodies, and a structured
//! [`ErrorResponse`] on failure. Image export is the only non-JSON response:
//! it streams the archive bytes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::images::Filters;

/// Version prefix for every endpoint.
pub const API_PREFIX: &str = "/v1";

pub const PING: &str = "/v1/_ping";
pub const INFO: &str = "/v1/info";
pub const SYSTEM_DF: &str = "/v1/system/df";
pub const SYSTEM_RESET: &str = "/v1/system/reset";
pub const IMAGES_LIST: &str = "/v1/images/json";
pub const IMAGES_PRUNE: &str = "/v1/images/prune";
pub const CONTAINERS_LIST: &str = "/v1/containers/json";
pub const CONTAINERS_CREATE: &str = "/v1/containers/create";

/// Key used in delete entries for a removed image id.
pub const DELETED_KEY: &str = "Deleted";
/// Key used in delete entries for a removed tag.
pub const UNTAGGED_KEY: &str = "Untagged";

/// Body of `DELETE /v1/images/{name}`: one single-key map per removal step.
pub type DeleteEntries = Vec<HashMap<String, String>>;

/// Error codes carried in [`ErrorResponse::code`].
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const CONFLICT: &str = "CONFLICT";
    pub const UNSUPPORTED_MODE: &str = "UNSUPPORTED_MODE";
    pub const CANCELLED: &str = "CANCELLED";
    pub const INTERNAL: &str = "INTERNAL_ERROR";
}

/// Structured error body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub version: String,
}

/// Query for list and prune endpoints. `filters` is a JSON-encoded [`Filters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterQuery {
    pub all: bool,
    pub filters: Option<String>,
}

impl FilterQuery {
    pub fn new(all: bool, filters: &Filters) -> serde_json::Result<Self> {
        let filters = if filters.is_empty() {
            None
        } else {
            Some(serde_json::to_string(filters)?)
        };
        Ok(Self { all, filters })
    }

    pub fn decode_filters(&self) -> serde_json::Result<Filters> {
        match self.filters.as_deref() {
            None | Some("") => Ok(Filters::new()),
            Some(raw) => serde_json::from_str(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceQuery {
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportQuery {
    pub format: String,
    #[serde(default)]
    pub compress: bool,
    /// Extra names for the archive metadata, comma separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

impl ExportQuery {
    pub fn new(format: &str, compress: bool, tags: &[String]) -> Self {
        Self {
            format: format.to_string(),
            compress,
            tags: (!tags.is_empty()).then(|| tags.join(",")),
        }
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub fn image_path(name: &str) -> String {
    format!("{API_PREFIX}/images/{name}")
}

pub fn image_exists_path(name: &str) -> String {
    format!("{API_PREFIX}/images/{name}/exists")
}

pub fn image_history_path(name: &str) -> String {
    format!("{API_PREFIX}/images/{name}/history")
}

pub fn image_export_path(name: &str) -> String {
    format!("{API_PREFIX}/images/{name}/export")
}

pub fn container_path(id: &str) -> String {
    format!("{API_PREFIX}/containers/{id}")
}

pub fn container_start_path(id: &str) -> String {
    format!("{API_PREFIX}/containers/{id}/start")
}

pub fn container_stop_path(id: &str) -> String {
    format!("{API_PREFIX}/containers/{id}/stop")
}
