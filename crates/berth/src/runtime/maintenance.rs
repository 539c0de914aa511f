//! Whole-runtime operations: migrate, renumber, reset, info and df.
//!
//! Migrate, renumber and reset take the runtime lock exclusively before they
//! read state and keep it until the new state is committed (or the attempt is
//! abandoned). Each commits with a single atomic state write, so an
//! interrupted run leaves the previous state in place and re-running it
//! converges to the same result.

use std::os::unix::fs::PermissionsExt;

use berth_protocol::{
    ContainerState, DfImageEntry, HostInfo, RuntimeInfo, StoreInfo, SystemDfReport, SystemInfo,
};
use log::{info, warn};

use super::{LocalRuntime, validate_runtime_name};
use crate::error::{EngineError, EngineResult};

/// What `migrate` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateSummary {
    pub stopped: usize,
    pub rebound: usize,
}

impl LocalRuntime {
    /// Stop every running container and, when `new_runtime` is given, bind
    /// every container to it.
    pub async fn migrate(&self, new_runtime: Option<&str>) -> EngineResult<MigrateSummary> {
        if let Some(name) = new_runtime {
            validate_runtime_name(name)?;
        }

        let _guard = self.lock().exclusive().await?;
        let summary = self
            .store()
            .update(|state| {
                let mut summary = MigrateSummary::default();
                for container in state.containers.iter_mut() {
                    if container.state == ContainerState::Running {
                        container.state = ContainerState::Stopped;
                        summary.stopped += 1;
                    }
                    if let Some(name) = new_runtime {
                        if container.oci_runtime != name {
                            container.oci_runtime = name.to_string();
                            summary.rebound += 1;
                        }
                    }
                }
                Ok(summary)
            })
            .await?;

        info!(
            "migrate: stopped {} container(s), rebound {} to {}",
            summary.stopped,
            summary.rebound,
            new_runtime.unwrap_or("their current runtime")
        );
        Ok(summary)
    }

    /// Reassign lock slots `0..n` in creation order.
    ///
    /// Fails without touching state when there are more containers than
    /// `num_locks`.
    pub async fn renumber(&self) -> EngineResult<usize> {
        let num_locks = self.config().num_locks;
        let _guard = self.lock().exclusive().await?;
        let count = self
            .store()
            .update(|state| {
                let count = state.containers.len();
                if count > num_locks as usize {
                    return Err(EngineError::conflict(format!(
                        "{count} containers do not fit in {num_locks} lock slots"
                    )));
                }
                for (slot, container) in (0u32..).zip(state.containers.iter_mut()) {
                    container.lock_slot = slot;
                }
                Ok(count)
            })
            .await?;

        info!("renumber: assigned {count} lock slot(s) of {num_locks}");
        Ok(count)
    }

    /// Remove every container and image.
    ///
    /// Running containers block the reset unless `force`.
    pub async fn reset(&self, force: bool) -> EngineResult<()> {
        let _guard = self.lock().exclusive().await?;
        let (image_ids, layer_digests) = self
            .store()
            .update(|state| {
                let running = state
                    .containers
                    .iter()
                    .filter(|c| c.state == ContainerState::Running)
                    .count();
                if running > 0 && !force {
                    return Err(EngineError::conflict(format!(
                        "{running} container(s) are running; use force to reset anyway"
                    )));
                }
                let images = std::mem::take(&mut state.images);
                state.containers.clear();
                let ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();
                let mut digests: Vec<String> = images
                    .iter()
                    .flat_map(|i| i.layers.iter().map(|l| l.digest.clone()))
                    .collect();
                digests.sort();
                digests.dedup();
                Ok((ids, digests))
            })
            .await?;

        self.remove_blobs(&image_ids, &layer_digests);
        warn!(
            "reset: removed {} image(s) and all containers",
            image_ids.len()
        );
        Ok(())
    }

    pub fn info(&self) -> EngineResult<SystemInfo> {
        let state = self.state()?;
        let uname = rustix::system::uname();
        Ok(SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: HostInfo {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                hostname: uname.nodename().to_string_lossy().into_owned(),
                cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
                rootless: !rustix::process::geteuid().is_root(),
            },
            store: StoreInfo {
                root: self.root().to_path_buf(),
                image_count: state.images.len(),
                container_count: state.containers.len(),
                running: state
                    .containers
                    .iter()
                    .filter(|c| c.state == ContainerState::Running)
                    .count(),
            },
            runtime: RuntimeInfo {
                default_oci_runtime: self.config().default_oci_runtime.clone(),
                num_locks: self.config().num_locks,
            },
        })
    }

    /// Disk usage: per image size and how much pruning unused images frees.
    pub fn disk_usage(&self) -> EngineResult<SystemDfReport> {
        let state = self.state()?;
        let mut report = SystemDfReport::default();
        for image in &state.images {
            let containers = state.containers_using(&image.id) as u32;
            let size = image.size();
            report.images_size += size;
            if containers == 0 {
                report.reclaimable_size += size;
            }
            report.images.push(DfImageEntry {
                id: image.id.clone(),
                repo_tags: image.names.clone(),
                size,
                containers,
            });
        }
        report.containers = state.containers.iter().map(|c| c.summary()).collect();
        Ok(report)
    }

    /// Make the storage root private to the invoking user.
    pub fn setup_rootless(&self) -> EngineResult<()> {
        if rustix::process::geteuid().is_root() {
            info!("running as root; nothing to set up");
            return Ok(());
        }
        std::fs::create_dir_all(self.root())?;
        std::fs::set_permissions(self.root(), std::fs::Permissions::from_mode(0o700))?;
        info!("storage root {:?} restricted to the current user", self.root());
        Ok(())
    }
}
