//! Image options and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Archive layout produced by `image save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SaveFormat {
    /// Directory with an OCI manifest.
    #[serde(rename = "oci-dir")]
    OciDir,
    /// Single tar file in OCI image layout.
    #[serde(rename = "oci-archive")]
    OciArchive,
    /// Directory with a v2s2 (docker) manifest.
    #[serde(rename = "docker-dir")]
    DockerDir,
    /// Single tar file in `docker save` layout.
    #[default]
    #[serde(rename = "docker-archive")]
    DockerArchive,
}

impl SaveFormat {
    pub const ALL: [SaveFormat; 4] = [
        SaveFormat::OciDir,
        SaveFormat::OciArchive,
        SaveFormat::DockerDir,
        SaveFormat::DockerArchive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaveFormat::OciDir => "oci-dir",
            SaveFormat::OciArchive => "oci-archive",
            SaveFormat::DockerDir => "docker-dir",
            SaveFormat::DockerArchive => "docker-archive",
        }
    }

    /// Every format name, space separated.
    pub fn names() -> String {
        Self::ALL.map(|f| f.as_str()).join(" ")
    }

    /// Directory formats are expanded from an exported tar stream.
    pub fn is_directory(&self) -> bool {
        matches!(self, SaveFormat::OciDir | SaveFormat::DockerDir)
    }

    /// Whether the layout uses OCI media types.
    pub fn is_oci(&self) -> bool {
        matches!(self, SaveFormat::OciDir | SaveFormat::OciArchive)
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a format name is outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown format {0:?}: format value must be one of {valid}", valid = SaveFormat::names())]
pub struct UnknownSaveFormat(pub String);

impl FromStr for SaveFormat {
    type Err = UnknownSaveFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaveFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownSaveFormat(s.to_string()))
    }
}

/// Options for `image save`.
///
/// `format` is kept as the raw user string so that validation can reject it
/// before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSaveOptions {
    /// Compress layers; only valid for the directory formats.
    pub compress: bool,
    pub format: String,
    /// Destination path. `None` means standard output.
    pub output: Option<String>,
    pub quiet: bool,
}

impl Default for ImageSaveOptions {
    fn default() -> Self {
        Self {
            compress: false,
            format: SaveFormat::default().as_str().to_string(),
            output: None,
            quiet: false,
        }
    }
}

/// Filters are `key -> values`; an image must match every key.
pub type Filters = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageListOptions {
    /// Include intermediate (untagged) images.
    pub all: bool,
    pub filters: Filters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub size: u64,
    /// Number of containers using this image.
    #[serde(default)]
    pub containers: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDeleteOptions {
    /// Remove the image even if containers use it, removing those containers.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDeleteReport {
    /// Image ids removed, in processing order.
    #[serde(default)]
    pub deleted: Vec<String>,
    /// Tags removed, in processing order.
    #[serde(default)]
    pub untagged: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHistoryLayer {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    pub size: u64,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageHistoryReport {
    /// Layers in the order reported by the image store (newest first).
    pub layers: Vec<ImageHistoryLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePruneOptions {
    /// Prune every image not used by a container, not only dangling ones.
    pub all: bool,
    pub filters: Filters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePruneReport {
    pub ids: Vec<String>,
    /// Total bytes reclaimed.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolReport {
    pub value: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_format_closed_set() {
        for format in SaveFormat::ALL {
            assert_eq!(format.as_str().parse::<SaveFormat>().unwrap(), format);
        }
        let err = "tar".parse::<SaveFormat>().unwrap_err();
        assert!(err.to_string().contains("oci-dir oci-archive docker-dir docker-archive"));
        assert!("OCI-DIR".parse::<SaveFormat>().is_err());
        assert_eq!(
            UnknownSaveFormat("tar".to_string()).to_string(),
            "unknown format \"tar\": format value must be one of oci-dir oci-archive docker-dir docker-archive"
        );
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_directory_formats() {
        assert!(SaveFormat::OciDir.is_directory());
        assert!(SaveFormat::DockerDir.is_directory());
        assert!(!SaveFormat::OciArchive.is_directory());
        assert!(!SaveFormat::DockerArchive.is_directory());
    }

    #[test]
    fn test_save_options_default_format() {
        let opts = ImageSaveOptions::default();
        assert_eq!(opts.format, "docker-archive");
        assert!(opts.output.is_none());
    }
}
