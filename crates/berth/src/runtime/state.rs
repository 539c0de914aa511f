//! Persistent runtime state.
//!
//! All image and container records live in a single `state.json`. Updates
//! are read-modify-write cycles that replace the file atomically (temp file
//! in the same directory, fsync, rename), so after a crash either the old or
//! the new state is on disk, never a mix.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use berth_protocol::{ContainerState, ContainerSummary};
use chrono::{DateTime, Utc};
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use super::lock::lock_file;
use crate::error::{EngineError, EngineResult};

const STATE_FILE: &str = "state.json";
const STATE_LOCK_FILE: &str = "state.lock";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    /// Images in import order.
    pub images: Vec<ImageRecord>,
    /// Containers in creation order.
    pub containers: Vec<ContainerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Hex sha256 of the image config.
    pub id: String,
    /// Fully qualified `repo:tag` names.
    #[serde(default)]
    pub names: Vec<String>,
    pub created: DateTime<Utc>,
    /// Bottom layer first.
    pub layers: Vec<LayerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Hex sha256 of the uncompressed layer tar.
    pub digest: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub state: ContainerState,
    pub oci_runtime: String,
    pub lock_slot: u32,
    pub created: DateTime<Utc>,
}

impl ImageRecord {
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    pub fn is_dangling(&self) -> bool {
        self.names.is_empty()
    }
}

impl ContainerRecord {
    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image_id.clone(),
            state: self.state,
            oci_runtime: self.oci_runtime.clone(),
            lock_slot: self.lock_slot,
            created: self.created,
        }
    }
}

impl RuntimeState {
    pub fn containers_using(&self, image_id: &str) -> usize {
        self.containers
            .iter()
            .filter(|c| c.image_id == image_id)
            .count()
    }

    /// Lowest lock slot below `num_locks` not held by any container.
    pub fn free_lock_slot(&self, num_locks: u32) -> Option<u32> {
        let mut used: Vec<u32> = self.containers.iter().map(|c| c.lock_slot).collect();
        used.sort_unstable();
        used.dedup();
        let mut candidate = 0;
        for slot in used {
            if slot != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < num_locks).then_some(candidate)
    }
}

/// File-backed store for [`RuntimeState`].
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    writer: Mutex<()>,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// Read the current state; a missing file is an empty runtime.
    pub fn load(&self) -> EngineResult<RuntimeState> {
        read_state(&self.path())
    }

    /// Apply `f` to the current state and commit the result.
    ///
    /// Nothing is written when `f` fails.
    pub async fn update<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut RuntimeState) -> EngineResult<T>,
    {
        let _writer = self.writer.lock().await;
        let _file_lock =
            lock_file(self.root.join(STATE_LOCK_FILE), FlockOperation::LockExclusive).await?;

        let mut state = self.load()?;
        let value = f(&mut state)?;
        write_state_atomic(&self.root, &self.path(), &state)?;
        Ok(value)
    }
}

fn read_state(path: &Path) -> EngineResult<RuntimeState> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::runtime(format!("corrupt state file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RuntimeState::default()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn write_state_atomic(dir: &Path, path: &Path, state: &RuntimeState) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), state)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
