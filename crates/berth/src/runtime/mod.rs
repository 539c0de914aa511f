//! Local container runtime.
//!
//! A small on-disk runtime the local engine calls into: an image store
//! (layer blobs + configs), container records with OCI runtime bindings and
//! lock slots, and the runtime-wide lock that maintenance operations take.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/state.json              image + container records
//! <root>/state.lock              held while state.json is rewritten
//! <root>/runtime.lock            shared by container mutations, exclusive for maintenance
//! <root>/layers/<digest>.tar     uncompressed layer blobs
//! <root>/images/<id>/config.json image configs (the id is their sha256)
//! ```

mod export;
mod images;
pub mod lock;
mod maintenance;
pub mod state;

pub use export::export_image;
pub use images::{LayerInput, normalize_name};
pub use lock::{ExclusiveGuard, RuntimeLock, SharedGuard};
pub use maintenance::MigrateSummary;
pub use state::{ContainerRecord, ImageRecord, LayerRecord, RuntimeState, StateStore};

use std::path::{Path, PathBuf};

use berth_protocol::{ContainerCreateOptions, ContainerState, ContainerSummary};
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Default size of the lock table.
pub const DEFAULT_NUM_LOCKS: u32 = 2048;

/// Default OCI runtime for new containers.
pub const DEFAULT_OCI_RUNTIME: &str = "runc";

const RUNTIME_LOCK_FILE: &str = "runtime.lock";

/// Configuration for the local runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Storage root.
    pub root: PathBuf,
    /// Number of lock slots available to containers.
    pub num_locks: u32,
    /// OCI runtime bound to containers created without an explicit one.
    pub default_oci_runtime: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("berth/storage"),
            num_locks: DEFAULT_NUM_LOCKS,
            default_oci_runtime: DEFAULT_OCI_RUNTIME.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// Handle to the on-disk runtime. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct LocalRuntime {
    config: RuntimeConfig,
    store: StateStore,
    lock: RuntimeLock,
}

impl LocalRuntime {
    /// Open (creating if needed) the runtime rooted at `config.root`.
    pub fn open(config: RuntimeConfig) -> EngineResult<Self> {
        if config.num_locks == 0 {
            return Err(EngineError::validation("num_locks must be greater than zero"));
        }
        validate_runtime_name(&config.default_oci_runtime)?;
        std::fs::create_dir_all(config.root.join("layers"))?;
        std::fs::create_dir_all(config.root.join("images"))?;

        let store = StateStore::new(&config.root);
        let lock = RuntimeLock::new(config.root.join(RUNTIME_LOCK_FILE));
        debug!("opened runtime at {:?}", config.root);
        Ok(Self {
            config,
            store,
            lock,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn lock(&self) -> &RuntimeLock {
        &self.lock
    }

    pub fn state(&self) -> EngineResult<RuntimeState> {
        self.store.load()
    }

    pub(crate) fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn layer_path(&self, digest: &str) -> PathBuf {
        self.config.root.join("layers").join(format!("{digest}.tar"))
    }

    pub(crate) fn config_path(&self, image_id: &str) -> PathBuf {
        self.config.root.join("images").join(image_id).join("config.json")
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    pub async fn create_container(
        &self,
        opts: ContainerCreateOptions,
    ) -> EngineResult<ContainerSummary> {
        let oci_runtime = opts
            .oci_runtime
            .unwrap_or_else(|| self.config.default_oci_runtime.clone());
        validate_runtime_name(&oci_runtime)?;
        if let Some(name) = &opts.name {
            validate_container_name(name)?;
        }

        let _guard = self.lock.shared().await?;
        let num_locks = self.config.num_locks;
        let record = self
            .store
            .update(|state| {
                let image_idx = images::resolve_image(state, &opts.image)?;
                let image_id = state.images[image_idx].id.clone();
                let id = Uuid::new_v4().simple().to_string();
                let name = opts
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("berth_{}", &id[..12]));
                if state.containers.iter().any(|c| c.name == name) {
                    return Err(EngineError::conflict(format!(
                        "container name {name:?} is already in use"
                    )));
                }
                let lock_slot = state.free_lock_slot(num_locks).ok_or_else(|| {
                    EngineError::conflict(format!(
                        "all {num_locks} lock slots are in use; raise num_locks and run system renumber"
                    ))
                })?;
                let record = ContainerRecord {
                    id,
                    name,
                    image_id,
                    state: ContainerState::Created,
                    oci_runtime: oci_runtime.clone(),
                    lock_slot,
                    created: Utc::now(),
                };
                state.containers.push(record.clone());
                Ok(record)
            })
            .await?;

        info!("created container {} ({})", record.name, record.id);
        Ok(record.summary())
    }

    pub fn list_containers(&self) -> EngineResult<Vec<ContainerSummary>> {
        Ok(self
            .state()?
            .containers
            .iter()
            .map(ContainerRecord::summary)
            .collect())
    }

    /// Start a container. Blocks while a maintenance operation holds the
    /// runtime lock exclusively.
    pub async fn start_container(&self, name_or_id: &str) -> EngineResult<()> {
        let _guard = self.lock.shared().await?;
        self.set_container_state(name_or_id, ContainerState::Running)
            .await
    }

    pub async fn stop_container(&self, name_or_id: &str) -> EngineResult<()> {
        let _guard = self.lock.shared().await?;
        self.set_container_state(name_or_id, ContainerState::Stopped)
            .await
    }

    pub async fn remove_container(&self, name_or_id: &str, force: bool) -> EngineResult<()> {
        let _guard = self.lock.shared().await?;
        let removed = self
            .store
            .update(|state| {
                let idx = resolve_container(state, name_or_id)?;
                if state.containers[idx].state == ContainerState::Running && !force {
                    return Err(EngineError::conflict(format!(
                        "container {name_or_id} is running; stop it first or use force"
                    )));
                }
                Ok(state.containers.remove(idx))
            })
            .await?;
        info!("removed container {} ({})", removed.name, removed.id);
        Ok(())
    }

    async fn set_container_state(
        &self,
        name_or_id: &str,
        target: ContainerState,
    ) -> EngineResult<()> {
        self.store
            .update(|state| {
                let idx = resolve_container(state, name_or_id)?;
                let container = &mut state.containers[idx];
                debug!(
                    "container {} {} -> {} via {}",
                    container.id, container.state, target, container.oci_runtime
                );
                container.state = target;
                Ok(())
            })
            .await
    }
}

/// Index of the container with this exact id, unique id prefix, or name.
fn resolve_container(state: &RuntimeState, name_or_id: &str) -> EngineResult<usize> {
    if let Some(idx) = state
        .containers
        .iter()
        .position(|c| c.id == name_or_id || c.name == name_or_id)
    {
        return Ok(idx);
    }
    let matches: Vec<usize> = state
        .containers
        .iter()
        .enumerate()
        .filter(|(_, c)| c.id.starts_with(name_or_id))
        .map(|(i, _)| i)
        .collect();
    match matches.as_slice() {
        [idx] if name_or_id.len() >= 3 => Ok(*idx),
        [] | [_] => Err(EngineError::not_found(name_or_id)),
        _ => Err(EngineError::conflict(format!(
            "container id prefix {name_or_id:?} is ambiguous"
        ))),
    }
}

/// OCI runtime names are bare binary names.
pub fn validate_runtime_name(name: &str) -> EngineResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "invalid OCI runtime name {name:?}"
        )))
    }
}

fn validate_container_name(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if first_ok && rest_ok && name.len() <= 128 {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "invalid container name {name:?}"
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A runtime in a fresh temp dir with one image named `alpine:latest`.
    pub async fn runtime_with_image() -> (tempfile::TempDir, LocalRuntime, String) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::open(RuntimeConfig::with_root(dir.path())).unwrap();
        let image = runtime
            .import_image(
                &["alpine"],
                vec![LayerInput::from_files(&[("etc/os-release", b"ID=alpine\n")], "ADD rootfs")],
            )
            .await
            .unwrap();
        (dir, runtime, image.id)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::runtime_with_image;
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_allocates_lowest_free_slot() {
        let (_dir, runtime, _) = runtime_with_image().await;

        let a = runtime
            .create_container(ContainerCreateOptions {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = runtime
            .create_container(ContainerCreateOptions {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(a.lock_slot, 0);
        assert_eq!(b.lock_slot, 1);
        assert_eq!(a.oci_runtime, DEFAULT_OCI_RUNTIME);

        runtime.remove_container(&a.id, false).await.unwrap();
        let c = runtime
            .create_container(ContainerCreateOptions {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(c.lock_slot, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let (_dir, runtime, _) = runtime_with_image().await;
        let opts = ContainerCreateOptions {
            name: Some("web".to_string()),
            image: "alpine".to_string(),
            oci_runtime: None,
        };
        runtime.create_container(opts.clone()).await.unwrap();
        let err = runtime.create_container(opts).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_unknown_image() {
        let (_dir, runtime, _) = runtime_with_image().await;
        let err = runtime
            .create_container(ContainerCreateOptions {
                image: "busybox".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let (_dir, runtime, _) = runtime_with_image().await;
        let c = runtime
            .create_container(ContainerCreateOptions {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.start_container(&c.name).await.unwrap();

        let err = runtime.remove_container(&c.id, false).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        runtime.remove_container(&c.id, true).await.unwrap();
        assert!(runtime.list_containers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_exclusive_holder() {
        let (_dir, runtime, _) = runtime_with_image().await;
        let runtime = Arc::new(runtime);
        let c = runtime
            .create_container(ContainerCreateOptions {
                image: "alpine".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let exclusive = runtime.lock().exclusive().await.unwrap();
        let starter = {
            let runtime = Arc::clone(&runtime);
            let id = c.id.clone();
            tokio::spawn(async move { runtime.start_container(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!starter.is_finished());
        assert_eq!(
            runtime.list_containers().unwrap()[0].state,
            ContainerState::Created
        );

        drop(exclusive);
        starter.await.unwrap().unwrap();
        assert_eq!(
            runtime.list_containers().unwrap()[0].state,
            ContainerState::Running
        );
    }

    #[test]
    fn test_validate_runtime_name() {
        assert!(validate_runtime_name("crun").is_ok());
        assert!(validate_runtime_name("runc-1.1").is_ok());
        assert!(validate_runtime_name("").is_err());
        assert!(validate_runtime_name("/usr/bin/runc").is_err());
    }
}
