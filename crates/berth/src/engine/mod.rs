//! Capability interfaces shared by every execution mode.
//!
//! [`ImageEngine`] and [`ContainerEngine`] expose the same operation set no
//! matter which backend sits behind them:
//!
//! - [`local`]: calls straight into the [`LocalRuntime`](crate::runtime::LocalRuntime)
//! - [`tunnel`]: forwards each call to a `berth-service` daemon
//!
//! Operations a backend cannot perform are still implemented and return
//! [`EngineError::UnsupportedMode`](crate::error::EngineError::UnsupportedMode),
//! so any holder of a `dyn ImageEngine`/`dyn ContainerEngine` can call any
//! method and get a well-defined answer.

pub mod local;
pub mod tunnel;

use std::future::Future;

use async_trait::async_trait;
use berth_protocol::{
    BoolReport, ContainerCreateOptions, ContainerSummary, ImageDeleteOptions, ImageDeleteReport,
    ImageHistoryReport, ImageListOptions, ImagePruneOptions, ImagePruneReport, ImageSaveOptions,
    ImageSummary, SaveFormat, ServiceOptions, SystemDfOptions, SystemDfReport, SystemInfo,
    SystemMigrateOptions, SystemRenumberOptions, SystemResetOptions,
};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::save::ScopedArchive;

/// Cancellable execution context passed to every engine call.
///
/// Clones share the same cancellation; [`EngineContext::child`] derives a
/// context that is cancelled with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    cancel: CancellationToken,
}

impl EngineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the context is already cancelled.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or the context is cancelled.
    ///
    /// On cancellation the future is dropped, which releases whatever it held
    /// (connections, temp files).
    pub async fn run<T, F>(&self, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = fut => result,
        }
    }
}

/// Image operations.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    async fn exists(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<BoolReport>;

    /// Remove each image in order; the first failure aborts the call and no
    /// partial report is returned.
    async fn delete(
        &self,
        ctx: &EngineContext,
        names_or_ids: &[String],
        opts: ImageDeleteOptions,
    ) -> EngineResult<ImageDeleteReport>;

    /// Images in backend order.
    async fn list(
        &self,
        ctx: &EngineContext,
        opts: ImageListOptions,
    ) -> EngineResult<Vec<ImageSummary>>;

    async fn history(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
    ) -> EngineResult<ImageHistoryReport>;

    async fn prune(
        &self,
        ctx: &EngineContext,
        opts: ImagePruneOptions,
    ) -> EngineResult<ImagePruneReport>;

    /// Write one image (plus optional extra tags) to an archive.
    ///
    /// `opts` are checked with [`SaveRequest::validate`](crate::save::SaveRequest::validate)
    /// before any I/O happens.
    async fn save(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        tags: &[String],
        opts: ImageSaveOptions,
    ) -> EngineResult<()>;
}

/// First stage of a save: the image as one tar stream in a scratch file.
///
/// Both backends build [`ImageEngine::save`] on this; the service uses it to
/// stream exports to tunnel clients.
#[async_trait]
pub trait ImageExport: Send + Sync {
    async fn export_archive(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        format: SaveFormat,
        compress: bool,
        tags: &[String],
        archive: &ScopedArchive,
    ) -> EngineResult<()>;
}

/// Container and system operations.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn info(&self, ctx: &EngineContext) -> EngineResult<SystemInfo>;

    async fn system_df(
        &self,
        ctx: &EngineContext,
        opts: SystemDfOptions,
    ) -> EngineResult<SystemDfReport>;

    /// Remove all containers and images.
    async fn system_reset(&self, ctx: &EngineContext, opts: SystemResetOptions)
    -> EngineResult<()>;

    /// Stop every container and rebind it to a new OCI runtime, all or nothing.
    async fn system_migrate(
        &self,
        ctx: &EngineContext,
        opts: SystemMigrateOptions,
    ) -> EngineResult<()>;

    /// Reassign lock slots for every container, all or nothing.
    async fn system_renumber(
        &self,
        ctx: &EngineContext,
        opts: SystemRenumberOptions,
    ) -> EngineResult<()>;

    /// Serve the remote API until idle or signalled.
    async fn service(&self, ctx: &EngineContext, opts: ServiceOptions) -> EngineResult<()>;

    /// Prepare storage for running without root.
    async fn setup_rootless(&self, ctx: &EngineContext) -> EngineResult<()>;

    async fn container_create(
        &self,
        ctx: &EngineContext,
        opts: ContainerCreateOptions,
    ) -> EngineResult<ContainerSummary>;

    async fn container_list(&self, ctx: &EngineContext) -> EngineResult<Vec<ContainerSummary>>;

    async fn container_start(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()>;

    async fn container_stop(&self, ctx: &EngineContext, name_or_id: &str) -> EngineResult<()>;

    async fn container_remove(
        &self,
        ctx: &EngineContext,
        name_or_id: &str,
        force: bool,
    ) -> EngineResult<()>;
}
