//! Local backend: runs every operation in-process against the [`LocalRuntime`].

use std::io::{IsTerminal, Write};
use std::sync::Arc;

use async_trait::async_trait;
use berth_protocol::{
    BoolReport, ContainerCreateOptions, ContainerSummary, ImageDeleteOptions, ImageDeleteReport,
    ImageHistoryReport, ImageListOptions, ImagePruneOptions, ImagePruneReport, ImageSaveOptions,
    ImageSummary, SaveFormat, ServiceOptions, SystemDfOptions, SystemDfReport, SystemInfo,
    SystemMigrateOptions, SystemRenumberOptions, SystemResetOptions,
};
use log::{debug, info};

use super::{ContainerEngine, EngineContext, ImageEngine, ImageExport};
use crate::error::{EngineError, EngineResult};
use crate::runtime::{LocalRuntime, export_image};
use crate::save::{SaveRequest, ScopedArchive};
use crate::service::{self, ServiceState};

/// [`ImageEngine`] over the local runtime.
#[derive(Debug, Clone)]
pub struct LocalImageEngine {
    runtime: Arc<LocalRuntime>,
}

impl LocalImageEngine {
    pub fn new(runtime: Arc<LocalRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ImageEngine for LocalImageEngine {
    async fn exists(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<BoolReport> {
        ctx.check()?;
        Ok(BoolReport {
            value: self.runtime.image_exists(name_or_id)?,
        })
    }

    async fn delete(
        &self,
        ctx: &EngineContext,
        names_or_ids: &[String],
        opts: ImageDeleteOptions,
    ) -> EngineResult<ImageDeleteReport> {
        let mut report = ImageDeleteReport::default();
        for name in names_or_ids {
            let step = ctx.run(self.runtime.remove_image(name, opts.force)).await?;
            report.untagged.extend(step.untagged);
            report.deleted.extend(step.deleted);
        }
        Ok(report)
    }

    async fn list(
        &self,
        ctx: &EngineContext,
        opts: ImageListOptions,
    ) -> EngineResult<Vec<ImageSummary>> {
        ctx.check()?;
        self.runtime.list_images(&opts)
    }

    async fn history(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
    ) -> EngineResult<ImageHistoryReport> {
        ctx.check()?;
        self.runtime.image_history(name_or_id)
    }

    async fn prune(
        &self,
        ctx: &EngineContext,
        opts: ImagePruneOptions,
    ) -> EngineResult<ImagePruneReport> {
        ctx.run(self.runtime.prune_images(&opts)).await
    }

    async fn save(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        tags: &[String],
        opts: ImageSaveOptions,
    ) -> EngineResult<()> {
        let req = SaveRequest::validate(&opts, tags, std::io::stdout().is_terminal())?;
        let archive = req.scratch_archive()?;
        self.export_archive(ctx, name_or_id, req.format, req.compress, &req.tags, &archive)
            .await?;
        req.finish(ctx, archive).await
    }
}

#[async_trait]
impl ImageExport for LocalImageEngine {
    async fn export_archive(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        format: SaveFormat,
        compress: bool,
        tags: &[String],
        archive: &ScopedArchive,
    ) -> EngineResult<()> {
        ctx.check()?;
        let file = archive.writer()?;
        let runtime = Arc::clone(&self.runtime);
        let name = name_or_id.to_string();
        let tags = tags.to_vec();
        let cancel = ctx.token().clone();
        let export = tokio::task::spawn_blocking(move || {
            let mut file = export_image(&runtime, &name, format, compress, &tags, file, &cancel)?;
            file.flush()?;
            file.sync_all()?;
            Ok::<_, EngineError>(())
        });
        ctx.run(async {
            export
                .await
                .map_err(|e| EngineError::runtime(format!("export task failed: {e}")))?
        })
        .await?;
        debug!("exported {name_or_id} as {format} to {:?}", archive.path());
        Ok(())
    }
}

/// [`ContainerEngine`] over the local runtime.
#[derive(Debug, Clone)]
pub struct LocalContainerEngine {
    runtime: Arc<LocalRuntime>,
}

impl LocalContainerEngine {
    pub fn new(runtime: Arc<LocalRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ContainerEngine for LocalContainerEngine {
    async fn info(&self, ctx: &EngineContext) -> EngineResult<SystemInfo> {
        ctx.check()?;
        self.runtime.info()
    }

    async fn system_df(
        &self,
        ctx: &EngineContext,
        _opts: SystemDfOptions,
    ) -> EngineResult<SystemDfReport> {
        ctx.check()?;
        self.runtime.disk_usage()
    }

    async fn system_reset(
        &self,
        ctx: &EngineContext,
        opts: SystemResetOptions,
    ) -> EngineResult<()> {
        ctx.run(self.runtime.reset(opts.force)).await
    }

    async fn system_migrate(
        &self,
        ctx: &EngineContext,
        opts: SystemMigrateOptions,
    ) -> EngineResult<()> {
        ctx.run(self.runtime.migrate(opts.new_runtime.as_deref()))
            .await
            .map(|_| ())
    }

    async fn system_renumber(
        &self,
        ctx: &EngineContext,
        _opts: SystemRenumberOptions,
    ) -> EngineResult<()> {
        ctx.run(self.runtime.renumber()).await.map(|_| ())
    }

    async fn service(&self, ctx: &EngineContext, opts: ServiceOptions) -> EngineResult<()> {
        let images = Arc::new(LocalImageEngine::new(Arc::clone(&self.runtime)));
        let state = ServiceState::new(images.clone(), images, Arc::new(self.clone()));
        info!(
            "serving local runtime {:?} on {:?}",
            self.runtime.root(),
            opts.socket_path
        );
        service::serve(state, &opts, ctx.token().clone()).await
    }

    async fn setup_rootless(&self, ctx: &EngineContext) -> EngineResult<()> {
        ctx.check()?;
        self.runtime.setup_rootless()
    }

    async fn container_create(
        &self,
        ctx: &EngineContext,
        opts: ContainerCreateOptions,
    ) -> EngineResult<ContainerSummary> {
        ctx.run(self.runtime.create_container(opts)).await
    }

    async fn container_list(&self, ctx: &EngineContext) -> EngineResult<Vec<ContainerSummary>> {
        ctx.check()?;
        self.runtime.list_containers()
    }

    async fn container_start(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()> {
        ctx.run(self.runtime.start_container(name_or_id)).await
    }

    async fn container_stop(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()> {
        ctx.run(self.runtime.stop_container(name_or_id)).await
    }

    async fn container_remove(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        force: bool,
    ) -> EngineResult<()> {
        ctx.run(self.runtime.remove_container(name_or_id, force))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LayerInput;
    use crate::runtime::testing::runtime_with_image;

    async fn engines() -> (tempfile::TempDir, LocalImageEngine, LocalContainerEngine, String) {
        let (dir, runtime, id) = runtime_with_image().await;
        let runtime = Arc::new(runtime);
        (
            dir,
            LocalImageEngine::new(Arc::clone(&runtime)),
            LocalContainerEngine::new(runtime),
            id,
        )
    }

    #[tokio::test]
    async fn test_delete_aborts_on_first_failure() {
        let (_dir, images, _, _) = engines().await;
        let ctx = EngineContext::new();
        let ids = vec![
            "alpine".to_string(),
            "missing".to_string(),
            "alpine".to_string(),
        ];

        let err = images
            .delete(&ctx, &ids, ImageDeleteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        // The first removal happened even though no report came back.
        assert!(!images.exists(&ctx, "alpine").await.unwrap().value);
    }

    #[tokio::test]
    async fn test_delete_accumulates_in_order() {
        let (dir, images, _, _) = engines().await;
        let runtime = LocalRuntime::open(crate::runtime::RuntimeConfig::with_root(dir.path())).unwrap();
        let busybox = runtime
            .import_image(
                &["busybox"],
                vec![LayerInput::from_files(&[("bin/sh", "sh")], "ADD sh")],
            )
            .await
            .unwrap();

        let report = images
            .delete(
                &EngineContext::new(),
                &["busybox".to_string(), "alpine".to_string()],
                ImageDeleteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.untagged, vec!["busybox:latest", "alpine:latest"]);
        assert_eq!(report.deleted[0], busybox.id);
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_save_docker_archive_to_file() {
        let (dir, images, _, id) = engines().await;
        let dest = dir.path().join("alpine.tar");
        images
            .save(
                &EngineContext::new(),
                "alpine",
                &["extra:1".to_string()],
                ImageSaveOptions {
                    output: Some(dest.to_string_lossy().to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let file = std::fs::File::open(&dest).unwrap();
        let mut archive = tar::Archive::new(file);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&format!("{id}.json")));
    }

    #[tokio::test]
    async fn test_save_oci_dir_expands() {
        let (dir, images, _, _) = engines().await;
        let dest = dir.path().join("alpine-oci");
        images
            .save(
                &EngineContext::new(),
                "alpine",
                &[],
                ImageSaveOptions {
                    format: "oci-dir".to_string(),
                    compress: true,
                    output: Some(dest.to_string_lossy().to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(dest.join("index.json").is_file());
        assert!(dest.join("oci-layout").is_file());
        assert!(dest.join("blobs/sha256").is_dir());
    }

    #[tokio::test]
    async fn test_save_validation_precedes_io() {
        let (dir, images, _, _) = engines().await;
        let dest = dir.path().join("never.tar");
        let err = images
            .save(
                &EngineContext::new(),
                "alpine",
                &[],
                ImageSaveOptions {
                    compress: true,
                    output: Some(dest.to_string_lossy().to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_concurrent_lists_are_consistent() {
        let (_dir, images, _, id) = engines().await;
        let ctx = EngineContext::new();
        let (a, b) = tokio::join!(
            images.list(&ctx, ImageListOptions::default()),
            images.list(&ctx, ImageListOptions::default())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(a[0].id, id);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let (_dir, _, containers, _) = engines().await;
        let ctx = EngineContext::new();
        ctx.cancel();
        let err = containers.container_list(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_migrate_through_engine() {
        let (_dir, _, containers, _) = engines().await;
        let ctx = EngineContext::new();
        let c = containers
            .container_create(
                &ctx,
                ContainerCreateOptions {
                    image: "alpine".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        containers.container_start(&ctx, &c.id).await.unwrap();

        containers
            .system_migrate(
                &ctx,
                SystemMigrateOptions {
                    new_runtime: Some("crun".to_string()),
                },
            )
            .await
            .unwrap();
        let listed = containers.container_list(&ctx).await.unwrap();
        assert_eq!(listed[0].oci_runtime, "crun");
    }
}
