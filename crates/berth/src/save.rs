//! Two-stage image save.
//!
//! 1. [`SaveRequest::validate`] checks the options before any I/O.
//! 2. The backend exports the image as one tar stream into a
//!    [`ScopedArchive`] (a temp file removed on drop).
//! 3. [`SaveRequest::finish`] moves that archive to its destination: a
//!    rename or a copy to stdout for the single-file formats, or
//!    [`expand_archive`] for the directory formats.
//!
//! Directory expansion unpacks into a hidden staging directory next to the
//! destination and renames it into place only once the whole stream has been
//! unpacked, so a failed or cancelled save never leaves a complete-looking
//! directory behind.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use berth_protocol::{ImageSaveOptions, SaveFormat};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::EngineContext;
use crate::error::{EngineError, EngineResult};

const SCRATCH_PREFIX: &str = ".berth-save-";
const STAGING_PREFIX: &str = ".berth-expand-";
const MANIFEST_FILES: [&str; 2] = ["manifest.json", "index.json"];

/// Where a validated save writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    Path(PathBuf),
}

/// Save options after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub format: SaveFormat,
    pub compress: bool,
    pub destination: Destination,
    pub tags: Vec<String>,
}

impl SaveRequest {
    /// Check the options without touching the filesystem beyond `stat`.
    ///
    /// Rules, in order: known format; `compress` only with a directory
    /// format; no binary output to a terminal; a usable destination path.
    pub fn validate(
        opts: &ImageSaveOptions,
        tags: &[String],
        stdout_is_terminal: bool,
    ) -> EngineResult<Self> {
        let format = check_format(&opts.format, opts.compress)?;

        for tag in tags {
            if tag.is_empty() || tag.contains(|c: char| c.is_whitespace() || c == ',') {
                return Err(EngineError::validation(format!("invalid tag {tag:?}")));
            }
        }

        let destination = match opts.output.as_deref() {
            None => {
                if format.is_directory() {
                    return Err(EngineError::validation(format!(
                        "{format} writes a directory; use -o to name it"
                    )));
                }
                if stdout_is_terminal {
                    return Err(EngineError::validation(
                        "refusing to save to terminal. Use -o flag or redirect",
                    ));
                }
                Destination::Stdout
            }
            Some(path) => Destination::Path(validate_destination(path, format)?),
        };

        Ok(Self {
            format,
            compress: opts.compress,
            destination,
            tags: tags.to_vec(),
        })
    }

    /// Create the scratch file the export is written into.
    pub fn scratch_archive(&self) -> io::Result<ScopedArchive> {
        match &self.destination {
            Destination::Path(path) if !writes_through(path) => {
                ScopedArchive::new_in(parent_dir(path))
            }
            _ => ScopedArchive::new_in(std::env::temp_dir()),
        }
    }

    /// Deliver a fully written archive to the destination.
    pub async fn finish(&self, ctx: &EngineContext, archive: ScopedArchive) -> EngineResult<()> {
        self.finish_with(ctx, archive, &mut tokio::io::stdout()).await
    }

    /// [`finish`](Self::finish) with an explicit stdout.
    pub async fn finish_with<W>(
        &self,
        ctx: &EngineContext,
        archive: ScopedArchive,
        stdout: &mut W,
    ) -> EngineResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        ctx.check()?;
        match &self.destination {
            Destination::Stdout => {
                let mut file = tokio::fs::File::from_std(archive.reopen()?);
                ctx.run(async {
                    tokio::io::copy(&mut file, stdout).await?;
                    stdout.flush().await?;
                    Ok(())
                })
                .await?;
                debug!("archive written to stdout");
            }
            Destination::Path(dest) if self.format.is_directory() => {
                let reader = archive.reopen()?;
                let target = dest.clone();
                let cancel = ctx.token().clone();
                tokio::task::spawn_blocking(move || {
                    // The archive must outlive the expansion.
                    let _archive = archive;
                    expand_archive_cancellable(reader, &target, &cancel)
                })
                .await
                .map_err(|e| EngineError::runtime(format!("expansion task failed: {e}")))??;
                info!(format = %self.format, "image expanded into {:?}", dest);
            }
            Destination::Path(dest) if writes_through(dest) => {
                let mut file = tokio::fs::File::from_std(archive.reopen()?);
                ctx.run(async {
                    let mut out = tokio::fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(dest)
                        .await?;
                    tokio::io::copy(&mut file, &mut out).await?;
                    out.flush().await?;
                    Ok(())
                })
                .await?;
                info!(format = %self.format, "image written through {:?}", dest);
            }
            Destination::Path(dest) => {
                archive.persist(dest)?;
                info!(format = %self.format, "image saved to {:?}", dest);
            }
        }
        Ok(())
    }
}

/// Parse a format name and check `compress` is allowed with it.
pub fn check_format(format: &str, compress: bool) -> EngineResult<SaveFormat> {
    let format: SaveFormat = format
        .parse()
        .map_err(|e: berth_protocol::UnknownSaveFormat| EngineError::validation(e.to_string()))?;
    if compress && !format.is_directory() {
        return Err(EngineError::validation(
            "--compress can only be set when --format is either 'oci-dir' or 'docker-dir'",
        ));
    }
    Ok(format)
}

fn validate_destination(path: &str, format: SaveFormat) -> EngineResult<PathBuf> {
    if path.is_empty() {
        return Err(EngineError::validation("output path cannot be empty"));
    }
    if path.contains('\0') {
        return Err(EngineError::validation("output path contains a NUL byte"));
    }
    let path = PathBuf::from(path);
    if path.file_name().is_none() {
        return Err(EngineError::validation(format!(
            "output path {path:?} does not name a file"
        )));
    }

    let parent = parent_dir(&path);
    if !parent.is_dir() {
        return Err(EngineError::validation(format!(
            "directory {parent:?} does not exist"
        )));
    }

    if format.is_directory() {
        if path.exists() {
            let empty = path.is_dir() && std::fs::read_dir(&path)?.next().is_none();
            if !empty {
                return Err(EngineError::validation(format!(
                    "{path:?} already exists and is not an empty directory"
                )));
            }
        }
    } else if path.is_dir() {
        return Err(EngineError::validation(format!("{path:?} is a directory")));
    }
    Ok(path)
}

/// An existing symlink or special file is written through, never replaced.
fn writes_through(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .is_ok_and(|meta| meta.file_type().is_symlink() || !meta.file_type().is_file())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Temporary archive file, deleted on drop unless persisted.
#[derive(Debug)]
pub struct ScopedArchive {
    file: NamedTempFile,
}

impl ScopedArchive {
    pub fn new_in(dir: impl AsRef<Path>) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .suffix(".tar")
            .tempfile_in(dir)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Handle for writing the export into.
    pub fn writer(&self) -> io::Result<File> {
        self.file.reopen()
    }

    /// Fresh handle positioned at the start.
    pub fn reopen(&self) -> io::Result<File> {
        self.file.reopen()
    }

    pub fn persist(self, dest: &Path) -> io::Result<()> {
        self.file.as_file().sync_all()?;
        self.file.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Unpack an exported tar stream into `dest`.
///
/// `dest` must not exist or be an empty directory. The stream is unpacked
/// into a staging directory beside `dest` and renamed into place only after
/// every entry unpacked and a manifest is present.
pub fn expand_archive<R: Read>(reader: R, dest: &Path) -> EngineResult<()> {
    expand_archive_cancellable(reader, dest, &CancellationToken::new())
}

pub(crate) fn expand_archive_cancellable<R: Read>(
    reader: R,
    dest: &Path,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent_dir(dest))?;

    let mut archive = tar::Archive::new(reader);
    let mut count = 0usize;
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut entry = entry?;
        if !entry.unpack_in(staging.path())? {
            return Err(EngineError::runtime(format!(
                "archive entry {:?} escapes the destination",
                entry.path()?
            )));
        }
        count += 1;
    }

    if !MANIFEST_FILES
        .iter()
        .any(|name| staging.path().join(name).is_file())
    {
        return Err(EngineError::runtime("exported archive has no manifest"));
    }

    // rename(2) replaces an empty directory. The staging TempDir then fails
    // to find its path on drop, which it ignores.
    std::fs::rename(staging.path(), dest)?;
    debug!("expanded {count} entries into {:?}", dest);
    Ok(())
}
