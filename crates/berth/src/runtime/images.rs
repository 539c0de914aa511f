//! Image store operations on [`LocalRuntime`].

use std::collections::HashSet;
use std::io::Write;

use berth_protocol::{
    Filters, ImageDeleteReport, ImageHistoryLayer, ImageHistoryReport, ImageListOptions,
    ImagePruneOptions, ImagePruneReport, ImageSummary,
};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::LocalRuntime;
use super::state::{ImageRecord, LayerRecord, RuntimeState};
use crate::error::{EngineError, EngineResult};

/// One layer handed to [`LocalRuntime::import_image`].
#[derive(Debug, Clone)]
pub struct LayerInput {
    /// Uncompressed layer tar.
    pub tar: Vec<u8>,
    pub created_by: String,
    pub comment: String,
}

impl LayerInput {
    pub fn new(tar: Vec<u8>, created_by: impl Into<String>) -> Self {
        Self {
            tar,
            created_by: created_by.into(),
            comment: String::new(),
        }
    }

    /// Build a layer tar from `(path, contents)` pairs.
    pub fn from_files<B: AsRef<[u8]>>(files: &[(&str, B)], created_by: &str) -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let contents = contents.as_ref();
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            // Writing into a Vec cannot fail.
            let _ = builder.append_data(&mut header, path, contents);
        }
        let tar = builder.into_inner().unwrap_or_default();
        Self::new(tar, created_by)
    }
}

/// Qualify a bare repository name with the `latest` tag.
pub fn normalize_name(name: &str) -> String {
    let name = name.trim();
    if name.contains('@') {
        return name.to_string();
    }
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Index of the image matching an id, unique id prefix, or name.
pub(crate) fn resolve_image(state: &RuntimeState, reference: &str) -> EngineResult<usize> {
    let reference = reference.strip_prefix("sha256:").unwrap_or(reference);
    if reference.is_empty() {
        return Err(EngineError::validation("image reference cannot be empty"));
    }
    if let Some(idx) = state.images.iter().position(|i| i.id == reference) {
        return Ok(idx);
    }
    let name = normalize_name(reference);
    if let Some(idx) = state.images.iter().position(|i| i.names.contains(&name)) {
        return Ok(idx);
    }
    if reference.len() >= 3 && reference.chars().all(|c| c.is_ascii_hexdigit()) {
        let matches: Vec<usize> = state
            .images
            .iter()
            .enumerate()
            .filter(|(_, i)| i.id.starts_with(reference))
            .map(|(idx, _)| idx)
            .collect();
        match matches.as_slice() {
            [idx] => return Ok(*idx),
            [] => {}
            _ => {
                return Err(EngineError::conflict(format!(
                    "image id prefix {reference:?} is ambiguous"
                )));
            }
        }
    }
    Err(EngineError::not_found(reference))
}

const FILTER_KEYS: [&str; 3] = ["reference", "dangling", "id"];

/// Reject filter keys this store cannot evaluate, whatever images exist.
pub fn validate_filters(filters: &Filters) -> EngineResult<()> {
    match filters.keys().find(|key| !FILTER_KEYS.contains(&key.as_str())) {
        Some(key) => Err(EngineError::validation(format!(
            "unsupported image filter {key:?}"
        ))),
        None => Ok(()),
    }
}

/// Filters must have passed [`validate_filters`].
fn matches_filters(image: &ImageRecord, filters: &Filters) -> bool {
    for (key, values) in filters {
        let matched = match key.as_str() {
            "reference" => values.iter().any(|pattern| {
                image.names.iter().any(|name| {
                    let repo = name.rsplit_once(':').map_or(name.as_str(), |(r, _)| r);
                    name == pattern || repo == pattern || name.starts_with(pattern.as_str())
                })
            }),
            "dangling" => values.iter().any(|v| match v.as_str() {
                "true" | "1" => image.is_dangling(),
                "false" | "0" => !image.is_dangling(),
                _ => false,
            }),
            "id" => values.iter().any(|v| image.id.starts_with(v.as_str())),
            _ => false,
        };
        if !matched {
            return false;
        }
    }
    true
}

fn write_blob(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("blob path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl LocalRuntime {
    /// Add an image built from `layers` (bottom first) and tag it with `names`.
    ///
    /// Names already held by another image move to the new one.
    pub async fn import_image(
        &self,
        names: &[&str],
        layers: Vec<LayerInput>,
    ) -> EngineResult<ImageRecord> {
        if layers.is_empty() {
            return Err(EngineError::validation("an image needs at least one layer"));
        }
        let names: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();
        let created = Utc::now();

        let mut records = Vec::with_capacity(layers.len());
        for layer in &layers {
            let digest = sha256_hex(&layer.tar);
            write_blob(&self.layer_path(&digest), &layer.tar)?;
            records.push(LayerRecord {
                digest,
                size: layer.tar.len() as u64,
                created,
                created_by: layer.created_by.clone(),
                comment: layer.comment.clone(),
            });
        }

        let config = json!({
            "created": created.to_rfc3339(),
            "architecture": std::env::consts::ARCH,
            "os": std::env::consts::OS,
            "config": {},
            "rootfs": {
                "type": "layers",
                "diff_ids": records.iter().map(|l| format!("sha256:{}", l.digest)).collect::<Vec<_>>(),
            },
            "history": records.iter().map(|l| json!({
                "created": l.created.to_rfc3339(),
                "created_by": l.created_by,
                "comment": l.comment,
            })).collect::<Vec<_>>(),
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let id = sha256_hex(&config_bytes);
        write_blob(&self.config_path(&id), &config_bytes)?;

        let _guard = self.lock().shared().await?;
        let record = self
            .store()
            .update(|state| {
                for image in state.images.iter_mut() {
                    image.names.retain(|n| !names.contains(n));
                }
                if let Some(existing) = state.images.iter_mut().find(|i| i.id == id) {
                    existing.names.extend(names.iter().cloned());
                    return Ok(existing.clone());
                }
                let record = ImageRecord {
                    id: id.clone(),
                    names: names.clone(),
                    created,
                    layers: records,
                };
                state.images.push(record.clone());
                Ok(record)
            })
            .await?;

        info!("imported image {} {:?}", &record.id[..12], record.names);
        Ok(record)
    }

    pub fn image_exists(&self, reference: &str) -> EngineResult<bool> {
        let state = self.state()?;
        match resolve_image(&state, reference) {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve a reference to an image record.
    pub fn inspect_image(&self, reference: &str) -> EngineResult<ImageRecord> {
        let state = self.state()?;
        let idx = resolve_image(&state, reference)?;
        Ok(state.images[idx].clone())
    }

    pub fn list_images(&self, opts: &ImageListOptions) -> EngineResult<Vec<ImageSummary>> {
        validate_filters(&opts.filters)?;
        let state = self.state()?;
        let mut summaries = Vec::new();
        for image in &state.images {
            if !opts.all && image.is_dangling() {
                continue;
            }
            if !matches_filters(image, &opts.filters) {
                continue;
            }
            summaries.push(ImageSummary {
                id: image.id.clone(),
                repo_tags: image.names.clone(),
                created: image.created,
                size: image.size(),
                containers: state.containers_using(&image.id) as u32,
            });
        }
        Ok(summaries)
    }

    /// Remove one image (or one of its tags).
    ///
    /// Referencing an image by one of several names only untags that name.
    /// Otherwise the image is deleted; containers using it block removal
    /// unless `force`, in which case they are removed first.
    pub async fn remove_image(
        &self,
        reference: &str,
        force: bool,
    ) -> EngineResult<ImageDeleteReport> {
        let _guard = self.lock().shared().await?;
        let (report, orphans) = self
            .store()
            .update(|state| {
                let idx = resolve_image(state, reference)?;
                let name = normalize_name(reference);
                let mut report = ImageDeleteReport::default();

                let image = &mut state.images[idx];
                if image.names.len() > 1 && image.names.contains(&name) {
                    image.names.retain(|n| n != &name);
                    report.untagged.push(name);
                    return Ok((report, Vec::new()));
                }

                let image_id = image.id.clone();
                let users = state.containers_using(&image_id);
                if users > 0 {
                    if !force {
                        return Err(EngineError::conflict(format!(
                            "image {reference} is in use by {users} container(s)"
                        )));
                    }
                    warn!("removing {users} container(s) using image {image_id}");
                    state.containers.retain(|c| c.image_id != image_id);
                }

                let removed = state.images.remove(idx);
                report.untagged.extend(removed.names.iter().cloned());
                report.deleted.push(removed.id.clone());
                let orphans = orphaned_layers(state, &[removed]);
                Ok((report, orphans))
            })
            .await?;

        self.remove_blobs(&report.deleted, &orphans);
        Ok(report)
    }

    pub fn image_history(&self, reference: &str) -> EngineResult<ImageHistoryReport> {
        let image = self.inspect_image(reference)?;
        let layers = image
            .layers
            .iter()
            .rev()
            .enumerate()
            .map(|(i, layer)| ImageHistoryLayer {
                id: if i == 0 {
                    image.id.clone()
                } else {
                    "<missing>".to_string()
                },
                created: layer.created,
                created_by: layer.created_by.clone(),
                size: layer.size,
                comment: layer.comment.clone(),
            })
            .collect();
        Ok(ImageHistoryReport { layers })
    }

    /// Remove dangling images (or every unused image with `all`).
    pub async fn prune_images(&self, opts: &ImagePruneOptions) -> EngineResult<ImagePruneReport> {
        validate_filters(&opts.filters)?;
        let _guard = self.lock().shared().await?;
        let (report, removed_ids, orphans) = self
            .store()
            .update(|state| {
                let mut keep = Vec::with_capacity(state.images.len());
                let mut removed = Vec::new();
                for image in std::mem::take(&mut state.images) {
                    let unused = state.containers_using(&image.id) == 0;
                    let eligible = unused
                        && (opts.all || image.is_dangling())
                        && matches_filters(&image, &opts.filters);
                    if eligible {
                        removed.push(image);
                    } else {
                        keep.push(image);
                    }
                }
                state.images = keep;

                let report = ImagePruneReport {
                    ids: removed.iter().map(|i| i.id.clone()).collect(),
                    size: removed.iter().map(ImageRecord::size).sum(),
                };
                let orphans = orphaned_layers(state, &removed);
                Ok((report.clone(), report.ids, orphans))
            })
            .await?;

        self.remove_blobs(&removed_ids, &orphans);
        debug!("pruned {} image(s)", report.ids.len());
        Ok(report)
    }

    /// Best-effort cleanup of files no committed record refers to.
    pub(crate) fn remove_blobs(&self, image_ids: &[String], layer_digests: &[String]) {
        for id in image_ids {
            if let Some(dir) = self.config_path(id).parent() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!("failed to remove image config {id}: {e}");
                }
            }
        }
        for digest in layer_digests {
            if let Err(e) = std::fs::remove_file(self.layer_path(digest)) {
                warn!("failed to remove layer {digest}: {e}");
            }
        }
    }
}

/// Layers of `removed` that no image left in `state` uses.
fn orphaned_layers(state: &RuntimeState, removed: &[ImageRecord]) -> Vec<String> {
    let in_use: HashSet<&str> = state
        .images
        .iter()
        .flat_map(|i| i.layers.iter().map(|l| l.digest.as_str()))
        .collect();
    let mut orphans: Vec<String> = removed
        .iter()
        .flat_map(|i| i.layers.iter().map(|l| l.digest.clone()))
        .filter(|d| !in_use.contains(d.as_str()))
        .collect();
    orphans.sort();
    orphans.dedup();
    orphans
}
