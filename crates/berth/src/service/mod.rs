//! `berth-service`: the remote API on a Unix domain socket.
//!
//! One process owns the socket. [`serve`] binds it (refusing a live socket,
//! replacing a stale one), serves the router until the shutdown token fires,
//! the idle timeout expires, or SIGINT/SIGTERM arrives, then drains in-flight
//! requests and removes the socket file.

mod error;
mod handlers;
mod idle;
mod routes;

pub use error::{ApiError, ApiResult};
pub use idle::{ActivityGuard, IdleTracker};
pub use routes::create_router;

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_protocol::ServiceOptions;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ImageEngine, ImageExport};
use crate::error::{EngineError, EngineResult};

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/run/berth/berth.sock";

/// Engines the handlers call. The daemon side always runs them locally.
#[derive(Clone)]
pub struct ServiceState {
    pub images: Arc<dyn ImageEngine>,
    pub exporter: Arc<dyn ImageExport>,
    pub containers: Arc<dyn ContainerEngine>,
}

impl ServiceState {
    pub fn new(
        images: Arc<dyn ImageEngine>,
        exporter: Arc<dyn ImageExport>,
        containers: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            images,
            exporter,
            containers,
        }
    }
}

/// Removes the socket file when the listener goes away.
#[derive(Debug)]
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed socket {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove socket {:?}: {}", self.path, e),
        }
    }
}

/// Bind `path`, failing with `Conflict` when another service answers on it.
///
/// A socket file nobody listens on is left over from a crashed service and
/// is replaced.
pub async fn bind_socket(path: &Path) -> EngineResult<UnixListener> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.file_type().is_socket() => {
            return Err(EngineError::conflict(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Ok(_) => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(EngineError::conflict(format!(
                    "a service is already listening on {}",
                    path.display()
                )));
            }
            info!("removing stale socket {:?}", path);
            std::fs::remove_file(path)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(path)?)
}

/// Serve the API on `opts.socket_path` until shut down.
pub async fn serve(
    state: ServiceState,
    opts: &ServiceOptions,
    shutdown: CancellationToken,
) -> EngineResult<()> {
    let listener = bind_socket(&opts.socket_path).await?;
    let _socket = SocketGuard {
        path: opts.socket_path.clone(),
    };
    let stop = shutdown.child_token();
    let tracker = IdleTracker::new();

    let idle_watcher = opts.idle_timeout.duration().map(|timeout| {
        tokio::spawn(idle::watch(tracker.clone(), timeout, stop.clone()))
    });
    let signal_watcher = tokio::spawn(watch_signals(stop.clone()));

    info!(
        "listening on {:?} (idle timeout: {})",
        opts.socket_path, opts.idle_timeout
    );
    let app = create_router(state, tracker);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await;

    stop.cancel();
    signal_watcher.abort();
    if let Some(watcher) = idle_watcher {
        watcher.abort();
    }
    result?;
    info!("service on {:?} stopped", opts.socket_path);
    Ok(())
}

async fn watch_signals(stop: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to install signal handlers: {}", e);
                return;
            }
        };

    tokio::select! {
        _ = interrupt.recv() => info!("SIGINT received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        _ = stop.cancelled() => return,
    }
    stop.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.sock");

        let listener = bind_socket(&path).await.unwrap();
        drop(listener);
        assert!(path.exists());

        let _listener = bind_socket(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.sock");

        let _live = bind_socket(&path).await.unwrap();
        let err = bind_socket(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = bind_socket(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }
}
