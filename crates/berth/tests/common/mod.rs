//! Test utilities and common setup.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use berth::engine::local::{LocalContainerEngine, LocalImageEngine};
use berth::error::EngineResult;
use berth::runtime::{LayerInput, LocalRuntime, RuntimeConfig};
use berth::service::{self, IdleTracker, ServiceState, create_router};
use berth_protocol::{IdleTimeout, ServiceOptions};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A runtime in a temp dir holding `alpine:latest` and `busybox:latest`.
pub struct TestRuntime {
    pub dir: TempDir,
    pub runtime: Arc<LocalRuntime>,
    pub alpine: String,
    pub busybox: String,
}

impl TestRuntime {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn images(&self) -> LocalImageEngine {
        LocalImageEngine::new(Arc::clone(&self.runtime))
    }

    pub fn containers(&self) -> LocalContainerEngine {
        LocalContainerEngine::new(Arc::clone(&self.runtime))
    }

    pub fn state(&self) -> ServiceState {
        let images = Arc::new(self.images());
        ServiceState::new(images.clone(), images, Arc::new(self.containers()))
    }
}

pub async fn test_runtime() -> TestRuntime {
    test_runtime_with(|config| config).await
}

/// Like [`test_runtime`] with a tweaked runtime config.
pub async fn test_runtime_with(tweak: impl FnOnce(RuntimeConfig) -> RuntimeConfig) -> TestRuntime {
    let dir = tempfile::tempdir().unwrap();
    let config = tweak(RuntimeConfig::with_root(dir.path().join("storage")));
    let runtime = LocalRuntime::open(config).unwrap();

    let alpine = runtime
        .import_image(
            &["alpine"],
            vec![
                LayerInput::from_files(&[("etc/os-release", "ID=alpine\n")], "ADD rootfs"),
                LayerInput::from_files(&[("etc/motd", "welcome\n")], "RUN echo welcome"),
            ],
        )
        .await
        .unwrap();
    let busybox = runtime
        .import_image(
            &["busybox"],
            vec![LayerInput::from_files(&[("bin/busybox", "busybox")], "ADD busybox")],
        )
        .await
        .unwrap();

    TestRuntime {
        dir,
        runtime: Arc::new(runtime),
        alpine: alpine.id,
        busybox: busybox.id,
    }
}

/// Router over the test runtime, for `oneshot` tests.
pub fn test_app(rt: &TestRuntime) -> Router {
    create_router(rt.state(), IdleTracker::new())
}

/// A service running on a socket inside the test runtime's temp dir.
pub struct RunningService {
    pub socket: PathBuf,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<EngineResult<()>>,
}

impl RunningService {
    /// Cancel the service and wait for it to drain.
    pub async fn stop(self) -> EngineResult<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("service did not stop")
            .expect("service task panicked")
    }
}

pub async fn start_service(rt: &TestRuntime, idle_timeout: IdleTimeout) -> RunningService {
    let socket = rt.path().join("run/berth.sock");
    start_service_on(rt, &socket, idle_timeout).await
}

pub async fn start_service_on(
    rt: &TestRuntime,
    socket: &Path,
    idle_timeout: IdleTimeout,
) -> RunningService {
    let shutdown = CancellationToken::new();
    let opts = ServiceOptions {
        socket_path: socket.to_path_buf(),
        idle_timeout,
    };
    let state = rt.state();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { service::serve(state, &opts, token).await });

    wait_for_socket(socket).await;
    RunningService {
        socket: socket.to_path_buf(),
        shutdown,
        handle,
    }
}

pub async fn wait_for_socket(path: &Path) {
    for _ in 0..250 {
        if UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("service never listened on {}", path.display());
}

/// Entry names of a tar file.
pub fn tar_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(file);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect()
}
