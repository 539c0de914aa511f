//! Serialize a stored image into one tar stream.
//!
//! Every format is produced as a tar stream; the directory formats are the
//! same tree the save pipeline later expands on disk.
//!
//! | format          | layout                                                        |
//! |-----------------|---------------------------------------------------------------|
//! | docker-archive  | `manifest.json`, `repositories`, `<config>.json`, `<layer>/layer.tar` |
//! | docker-dir      | `version`, `manifest.json`, blobs named by hex digest          |
//! | oci-archive/dir | `oci-layout`, `index.json`, `blobs/sha256/<digest>`            |

use std::collections::BTreeMap;
use std::io::Write;

use berth_protocol::SaveFormat;
use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::LocalRuntime;
use super::images::{normalize_name, sha256_hex};
use super::state::ImageRecord;
use crate::error::{EngineError, EngineResult};

const DIR_TRANSPORT_VERSION: &str = "Directory Transport Version: 1.1\n";
const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const OCI_REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

mod media {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
}

struct Blob {
    digest: String,
    bytes: Vec<u8>,
}

impl Blob {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            digest: sha256_hex(&bytes),
            bytes,
        }
    }

    fn descriptor(&self, media_type: &str) -> Value {
        json!({
            "mediaType": media_type,
            "digest": format!("sha256:{}", self.digest),
            "size": self.bytes.len(),
        })
    }
}

struct ArchiveWriter<'a, W: Write> {
    builder: tar::Builder<W>,
    cancel: &'a CancellationToken,
}

impl<W: Write> ArchiveWriter<'_, W> {
    fn append(&mut self, path: &str, bytes: &[u8]) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.builder.append_data(&mut header, path, bytes)?;
        Ok(())
    }

    fn append_json(&mut self, path: &str, value: &Value) -> EngineResult<()> {
        self.append(path, &serde_json::to_vec(value)?)
    }
}

/// Write `reference` in `format` to `writer` and return the writer.
///
/// `tags` are added to the image's own names in the archive metadata
/// (docker `RepoTags`, OCI ref annotations). `compress` gzips layer blobs.
/// The token is checked before every entry.
pub fn export_image<W: Write>(
    runtime: &LocalRuntime,
    reference: &str,
    format: SaveFormat,
    compress: bool,
    tags: &[String],
    writer: W,
    cancel: &CancellationToken,
) -> EngineResult<W> {
    let image = runtime.inspect_image(reference)?;
    let config = Blob::new(std::fs::read(runtime.config_path(&image.id))?);

    let mut layers = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let tar = std::fs::read(runtime.layer_path(&layer.digest))?;
        layers.push(if compress { Blob::new(gzip(&tar)?) } else { Blob::new(tar) });
    }

    let mut names = image.names.clone();
    for tag in tags {
        let tag = normalize_name(tag);
        if !names.contains(&tag) {
            names.push(tag);
        }
    }

    let mut out = ArchiveWriter {
        builder: tar::Builder::new(writer),
        cancel,
    };
    match format {
        SaveFormat::DockerArchive => write_docker_archive(&mut out, &image, &config, &layers, &names)?,
        SaveFormat::DockerDir => write_dir_layout(&mut out, &config, &layers, compress)?,
        SaveFormat::OciArchive | SaveFormat::OciDir => {
            write_oci_layout(&mut out, &config, &layers, &names, compress)?
        }
    }
    debug!(
        "exported image {} as {} ({} layers)",
        image.id,
        format,
        layers.len()
    );
    Ok(out.builder.into_inner()?)
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn write_docker_archive<W: Write>(
    out: &mut ArchiveWriter<'_, W>,
    image: &ImageRecord,
    config: &Blob,
    layers: &[Blob],
    names: &[String],
) -> EngineResult<()> {
    let config_name = format!("{}.json", config.digest);
    let layer_paths: Vec<String> = layers
        .iter()
        .map(|l| format!("{}/layer.tar", l.digest))
        .collect();

    for (blob, path) in layers.iter().zip(&layer_paths) {
        out.append(path, &blob.bytes)?;
    }
    out.append(&config_name, &config.bytes)?;

    let manifest = json!([{
        "Config": config_name,
        "RepoTags": names,
        "Layers": layer_paths,
    }]);
    out.append_json("manifest.json", &manifest)?;

    // repo -> tag -> top layer id
    let top = layers.last().map(|l| l.digest.clone()).unwrap_or_default();
    let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for name in names {
        if let Some((repo, tag)) = split_tag(name) {
            repositories
                .entry(repo.to_string())
                .or_default()
                .insert(tag.to_string(), top.clone());
        }
    }
    if !repositories.is_empty() {
        out.append_json("repositories", &serde_json::to_value(&repositories)?)?;
    }
    debug!("docker-archive for {} carries {} name(s)", image.id, names.len());
    Ok(())
}

fn write_dir_layout<W: Write>(
    out: &mut ArchiveWriter<'_, W>,
    config: &Blob,
    layers: &[Blob],
    compress: bool,
) -> EngineResult<()> {
    let layer_type = if compress {
        media::DOCKER_LAYER_GZIP
    } else {
        media::DOCKER_LAYER
    };
    out.append("version", DIR_TRANSPORT_VERSION.as_bytes())?;
    for layer in layers {
        out.append(&layer.digest, &layer.bytes)?;
    }
    out.append(&config.digest, &config.bytes)?;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": media::DOCKER_MANIFEST,
        "config": config.descriptor(media::DOCKER_CONFIG),
        "layers": layers.iter().map(|l| l.descriptor(layer_type)).collect::<Vec<_>>(),
    });
    out.append_json("manifest.json", &manifest)
}

fn write_oci_layout<W: Write>(
    out: &mut ArchiveWriter<'_, W>,
    config: &Blob,
    layers: &[Blob],
    names: &[String],
    compress: bool,
) -> EngineResult<()> {
    let layer_type = if compress {
        media::OCI_LAYER_GZIP
    } else {
        media::OCI_LAYER
    };
    out.append("oci-layout", OCI_LAYOUT.as_bytes())?;
    for layer in layers {
        out.append(&format!("blobs/sha256/{}", layer.digest), &layer.bytes)?;
    }
    out.append(&format!("blobs/sha256/{}", config.digest), &config.bytes)?;

    let manifest = Blob::new(serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": media::OCI_MANIFEST,
        "config": config.descriptor(media::OCI_CONFIG),
        "layers": layers.iter().map(|l| l.descriptor(layer_type)).collect::<Vec<_>>(),
    }))?);
    out.append(&format!("blobs/sha256/{}", manifest.digest), &manifest.bytes)?;

    let entries: Vec<Value> = if names.is_empty() {
        vec![manifest.descriptor(media::OCI_MANIFEST)]
    } else {
        names
            .iter()
            .map(|name| {
                let mut entry = manifest.descriptor(media::OCI_MANIFEST);
                entry["annotations"][OCI_REF_ANNOTATION] = json!(name);
                entry
            })
            .collect()
    };
    let index = json!({
        "schemaVersion": 2,
        "mediaType": media::OCI_INDEX,
        "manifests": entries,
    });
    out.append_json("index.json", &index)
}

fn split_tag(name: &str) -> Option<(&str, &str)> {
    let slash = name.rfind('/').map_or(0, |i| i + 1);
    let colon = name[slash..].rfind(':')? + slash;
    Some((&name[..colon], &name[colon + 1..]))
}
