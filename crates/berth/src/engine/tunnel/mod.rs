//! Tunnel backend: forwards each operation to a `berth-service` daemon.
//!
//! Every engine owns its own [`ServiceClient`]. Operations the daemon does
//! not expose (service, migrate, renumber, rootless setup) fail with
//! [`EngineError::UnsupportedMode`] without touching the network.

mod client;

pub use client::ServiceClient;

use std::io::IsTerminal;
use std::path::PathBuf;

use async_trait::async_trait;
use berth_protocol::wire::{
    self, DELETED_KEY, DeleteEntries, ExportQuery, FilterQuery, PingResponse, UNTAGGED_KEY,
};
use berth_protocol::{
    BoolReport, ContainerCreateOptions, ContainerSummary, ExecutionMode, Filters,
    ImageDeleteOptions, ImageDeleteReport, ImageHistoryReport, ImageListOptions,
    ImagePruneOptions, ImagePruneReport, ImageSaveOptions, ImageSummary, SaveFormat,
    ServiceOptions, SystemDfOptions, SystemDfReport, SystemInfo, SystemMigrateOptions,
    SystemRenumberOptions, SystemResetOptions,
};
use tracing::{debug, warn};

use self::client::{query_string, segment};
use super::{ContainerEngine, EngineContext, ImageEngine, ImageExport};
use crate::error::{EngineError, EngineResult};
use crate::save::{SaveRequest, ScopedArchive};

fn filter_query(all: bool, filters: &Filters) -> EngineResult<String> {
    let query = FilterQuery::new(all, filters)?;
    let mut pairs = vec![("all", query.all.to_string())];
    if let Some(filters) = query.filters {
        pairs.push(("filters", filters));
    }
    Ok(query_string(&pairs))
}

fn force_query(force: bool) -> String {
    if force {
        query_string(&[("force", "true".to_string())])
    } else {
        String::new()
    }
}

/// [`ImageEngine`] that talks to a remote service.
#[derive(Debug, Clone)]
pub struct TunnelImageEngine {
    client: ServiceClient,
}

impl TunnelImageEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: ServiceClient::new(socket_path),
        }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// Check the service answers.
    pub async fn ping(&self, ctx: &EngineContext) -> EngineResult<PingResponse> {
        self.client.get(ctx, wire::PING).await
    }
}

#[async_trait]
impl ImageEngine for TunnelImageEngine {
    async fn exists(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<BoolReport> {
        let path = wire::image_exists_path(&segment(name_or_id));
        self.client.get(ctx, &path).await
    }

    async fn delete(
        &self,
        ctx: &EngineContext,
        names_or_ids: &[String],
        opts: ImageDeleteOptions,
    ) -> EngineResult<ImageDeleteReport> {
        let mut report = ImageDeleteReport::default();
        for name in names_or_ids {
            let path = format!(
                "{}{}",
                wire::image_path(&segment(name)),
                force_query(opts.force)
            );
            let entries: DeleteEntries = self.client.delete(ctx, &path).await?;
            for entry in entries {
                for (key, value) in entry {
                    match key.as_str() {
                        DELETED_KEY => report.deleted.push(value),
                        UNTAGGED_KEY => report.untagged.push(value),
                        other => warn!(key = other, "ignoring unknown delete entry"),
                    }
                }
            }
        }
        Ok(report)
    }

    async fn list(
        &self,
        ctx: &EngineContext,
        opts: ImageListOptions,
    ) -> EngineResult<Vec<ImageSummary>> {
        let path = format!("{}{}", wire::IMAGES_LIST, filter_query(opts.all, &opts.filters)?);
        self.client.get(ctx, &path).await
    }

    async fn history(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
    ) -> EngineResult<ImageHistoryReport> {
        let path = wire::image_history_path(&segment(name_or_id));
        self.client.get(ctx, &path).await
    }

    async fn prune(
        &self,
        ctx: &EngineContext,
        opts: ImagePruneOptions,
    ) -> EngineResult<ImagePruneReport> {
        let path = format!("{}{}", wire::IMAGES_PRUNE, filter_query(opts.all, &opts.filters)?);
        self.client.post::<_, ()>(ctx, &path, None).await
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
impl ImageExport for TunnelImageEngine {
    async fn export_archive(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        format: SaveFormat,
        compress: bool,
        tags: &[String],
        archive: &ScopedArchive,
    ) -> EngineResult<()> {
        let query = ExportQuery::new(format.as_str(), compress, tags);
        let mut pairs = vec![
            ("format", query.format.clone()),
            ("compress", query.compress.to_string()),
        ];
        if let Some(tags) = query.tags {
            pairs.push(("tags", tags));
        }
        let path = format!(
            "{}{}",
            wire::image_export_path(&segment(name_or_id)),
            query_string(&pairs)
        );

        let mut file = tokio::fs::File::from_std(archive.writer()?);
        let written = self.client.download(ctx, &path, &mut file).await?;
        file.sync_all().await?;
        debug!(image = name_or_id, %format, written, "downloaded export");
        Ok(())
    }
}

/// [`ContainerEngine`] that talks to a remote service.
#[derive(Debug, Clone)]
pub struct TunnelContainerEngine {
    client: ServiceClient,
}

impl TunnelContainerEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: ServiceClient::new(socket_path),
        }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }
}

#[async_trait]
impl ContainerEngine for TunnelContainerEngine {
    async fn info(&self, ctx: &EngineContext) -> EngineResult<SystemInfo> {
        self.client.get(ctx, wire::INFO).await
    }

    async fn system_df(
        &self,
        ctx: &EngineContext,
        opts: SystemDfOptions,
    ) -> EngineResult<SystemDfReport> {
        let path = format!(
            "{}{}",
            wire::SYSTEM_DF,
            query_string(&[("verbose", opts.verbose.to_string())])
        );
        self.client.get(ctx, &path).await
    }

    async fn system_reset(
        &self,
        ctx: &EngineContext,
        opts: SystemResetOptions,
    ) -> EngineResult<()> {
        let path = format!("{}{}", wire::SYSTEM_RESET, force_query(opts.force));
        self.client.post_empty(ctx, &path).await
    }

    async fn system_migrate(
        &self,
        _ctx: &EngineContext,
        _opts: SystemMigrateOptions,
    ) -> EngineResult<()> {
        Err(EngineError::unsupported("system migrate", ExecutionMode::Tunnel))
    }

    async fn system_renumber(
        &self,
        _ctx: &EngineContext,
        _opts: SystemRenumberOptions,
    ) -> EngineResult<()> {
        Err(EngineError::unsupported("system renumber", ExecutionMode::Tunnel))
    }

    async fn service(&self, _ctx: &EngineContext, _opts: ServiceOptions) -> EngineResult<()> {
        Err(EngineError::unsupported("system service", ExecutionMode::Tunnel))
    }

    async fn setup_rootless(&self, _ctx: &EngineContext) -> EngineResult<()> {
        Err(EngineError::unsupported("rootless setup", ExecutionMode::Tunnel))
    }

    async fn container_create(
        &self,
        ctx: &EngineContext,
        opts: ContainerCreateOptions,
    ) -> EngineResult<ContainerSummary> {
        self.client
            .post(ctx, wire::CONTAINERS_CREATE, Some(&opts))
            .await
    }

    async fn container_list(&self, ctx: &EngineContext) -> EngineResult<Vec<ContainerSummary>> {
        self.client.get(ctx, wire::CONTAINERS_LIST).await
    }

    async fn container_start(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()> {
        let path = wire::container_start_path(&segment(name_or_id));
        self.client.post_empty(ctx, &path).await
    }

    async fn container_stop(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()> {
        let path = wire::container_stop_path(&segment(name_or_id));
        self.client.post_empty(ctx, &path).await
    }

    async fn container_remove(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        force: bool,
    ) -> EngineResult<()> {
        let path = format!(
            "{}{}",
            wire::container_path(&segment(name_or_id)),
            force_query(force)
        );
        self.client.delete_empty(ctx, &path).await
    }
}
