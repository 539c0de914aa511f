//! Command registry and mode dispatch.
//!
//! Every CLI command registers the execution modes it is valid under. The
//! table is built once at startup and never mutated; the [`Dispatcher`]
//! holds it together with the engine factory for the process's mode and
//! refuses a command whose registration does not list that mode before any
//! engine is created or called.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use berth_protocol::ExecutionMode;
use tracing::debug;

use crate::engine::local::{LocalContainerEngine, LocalImageEngine};
use crate::engine::tunnel::{TunnelContainerEngine, TunnelImageEngine};
use crate::engine::{ContainerEngine, ImageEngine};
use crate::error::{EngineError, EngineResult};
use crate::runtime::LocalRuntime;

const BOTH: &[ExecutionMode] = &[ExecutionMode::Local, ExecutionMode::Tunnel];
const LOCAL_ONLY: &[ExecutionMode] = &[ExecutionMode::Local];

/// One command and the modes it may run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRegistration {
    /// Full command path, e.g. `image save`.
    pub path: String,
    /// Grouping command, e.g. `image`.
    pub parent: Option<String>,
    pub modes: Vec<ExecutionMode>,
}

impl CommandRegistration {
    pub fn new(parent: &str, name: &str, modes: &[ExecutionMode]) -> Self {
        Self {
            path: format!("{parent} {name}"),
            parent: Some(parent.to_string()),
            modes: modes.to_vec(),
        }
    }

    /// A top-level command with no parent.
    pub fn root(name: &str, modes: &[ExecutionMode]) -> Self {
        Self {
            path: name.to_string(),
            parent: None,
            modes: modes.to_vec(),
        }
    }

    pub fn supports(&self, mode: ExecutionMode) -> bool {
        self.modes.contains(&mode)
    }
}

/// Collects registrations; [`build`](Self::build) freezes them.
#[derive(Debug, Default)]
pub struct CommandRegistryBuilder {
    entries: Vec<CommandRegistration>,
}

impl CommandRegistryBuilder {
    pub fn register(mut self, registration: CommandRegistration) -> Self {
        self.entries.push(registration);
        self
    }

    pub fn build(self) -> EngineResult<CommandRegistry> {
        let mut commands = HashMap::with_capacity(self.entries.len());
        for entry in self.entries {
            if entry.modes.is_empty() {
                return Err(EngineError::validation(format!(
                    "command {:?} registers no execution mode",
                    entry.path
                )));
            }
            if commands.contains_key(&entry.path) {
                return Err(EngineError::conflict(format!(
                    "command {:?} registered twice",
                    entry.path
                )));
            }
            commands.insert(entry.path.clone(), entry);
        }
        Ok(CommandRegistry { commands })
    }
}

/// Immutable command table.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandRegistration>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    pub fn get(&self, path: &str) -> Option<&CommandRegistration> {
        self.commands.get(path)
    }

    pub fn is_available(&self, path: &str, mode: ExecutionMode) -> bool {
        self.get(path).is_some_and(|c| c.supports(mode))
    }

    /// Command paths valid under `mode`, sorted.
    pub fn commands_for(&self, mode: ExecutionMode) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .commands
            .values()
            .filter(|c| c.supports(mode))
            .map(|c| c.path.as_str())
            .collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// The registrations for every `berth` command.
pub fn default_registry() -> EngineResult<CommandRegistry> {
    let mut builder = CommandRegistry::builder();
    for name in ["save", "list", "rm", "history", "prune", "exists"] {
        builder = builder.register(CommandRegistration::new("image", name, BOTH));
    }
    for name in ["info", "df", "reset"] {
        builder = builder.register(CommandRegistration::new("system", name, BOTH));
    }
    for name in ["migrate", "renumber", "service"] {
        builder = builder.register(CommandRegistration::new("system", name, LOCAL_ONLY));
    }
    for name in ["create", "list", "start", "stop", "rm"] {
        builder = builder.register(CommandRegistration::new("container", name, BOTH));
    }
    builder.build()
}

/// Creates the engines for one execution mode.
pub trait EngineFactory: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    fn image_engine(&self) -> Arc<dyn ImageEngine>;

    fn container_engine(&self) -> Arc<dyn ContainerEngine>;
}

/// Engines over an opened [`LocalRuntime`].
#[derive(Debug, Clone)]
pub struct LocalEngineFactory {
    runtime: Arc<LocalRuntime>,
}

impl LocalEngineFactory {
    pub fn new(runtime: Arc<LocalRuntime>) -> Self {
        Self { runtime }
    }
}

impl EngineFactory for LocalEngineFactory {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }

    fn image_engine(&self) -> Arc<dyn ImageEngine> {
        Arc::new(LocalImageEngine::new(Arc::clone(&self.runtime)))
    }

    fn container_engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(LocalContainerEngine::new(Arc::clone(&self.runtime)))
    }
}

/// Engines that forward to the service on `socket_path`.
#[derive(Debug, Clone)]
pub struct TunnelEngineFactory {
    socket_path: PathBuf,
}

impl TunnelEngineFactory {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

impl EngineFactory for TunnelEngineFactory {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Tunnel
    }

    fn image_engine(&self) -> Arc<dyn ImageEngine> {
        Arc::new(TunnelImageEngine::new(&self.socket_path))
    }

    fn container_engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(TunnelContainerEngine::new(&self.socket_path))
    }
}

/// Resolves a command to the engine of the process's mode.
///
/// Engines are created on first use and reused afterwards.
pub struct Dispatcher {
    registry: CommandRegistry,
    factory: Arc<dyn EngineFactory>,
    images: OnceLock<Arc<dyn ImageEngine>>,
    containers: OnceLock<Arc<dyn ContainerEngine>>,
}

impl Dispatcher {
    /// The active mode is the factory's and cannot change afterwards.
    pub fn new(registry: CommandRegistry, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            registry,
            factory,
            images: OnceLock::new(),
            containers: OnceLock::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.factory.mode()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Fail with [`EngineError::ModeNotAvailable`] unless `command` runs in this mode.
    pub fn check(&self, command: &str) -> EngineResult<()> {
        let mode = self.mode();
        if self.registry.is_available(command, mode) {
            Ok(())
        } else {
            debug!(command, %mode, "command not available");
            Err(EngineError::ModeNotAvailable {
                command: command.to_string(),
                mode,
            })
        }
    }

    pub fn image_engine(&self, command: &str) -> EngineResult<Arc<dyn ImageEngine>> {
        self.check(command)?;
        Ok(Arc::clone(
            self.images.get_or_init(|| self.factory.image_engine()),
        ))
    }

    pub fn container_engine(&self, command: &str) -> EngineResult<Arc<dyn ContainerEngine>> {
        self.check(command)?;
        Ok(Arc::clone(
            self.containers
                .get_or_init(|| self.factory.container_engine()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use berth_protocol::{
        ContainerCreateOptions, ContainerSummary, ServiceOptions, SystemDfOptions, SystemDfReport,
        SystemInfo, SystemMigrateOptions, SystemRenumberOptions, SystemResetOptions,
    };

    use crate::engine::EngineContext;

    /// Counts every engine call; all of them succeed with nothing.
    #[derive(Default)]
    struct SpyContainers {
        calls: AtomicUsize,
    }

    impl SpyContainers {
        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerEngine for SpyContainers {
        async fn info(&self, _ctx: &EngineContext) -> EngineResult<SystemInfo> {
            self.hit();
            Err(EngineError::runtime("spy"))
        }

        async fn system_df(
            &self,
            _ctx: &EngineContext,
            _opts: SystemDfOptions,
        ) -> EngineResult<SystemDfReport> {
            self.hit();
            Ok(SystemDfReport::default())
        }

        async fn system_reset(
            &self,
            _ctx: &EngineContext,
            _opts: SystemResetOptions,
        ) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn system_migrate(
            &self,
            _ctx: &EngineContext,
            _opts: SystemMigrateOptions,
        ) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn system_renumber(
            &self,
            _ctx: &EngineContext,
            _opts: SystemRenumberOptions,
        ) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn service(&self, _ctx: &EngineContext, _opts: ServiceOptions) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn setup_rootless(&self, _ctx: &EngineContext) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn container_create(
            &self,
            _ctx: &EngineContext,
            _opts: ContainerCreateOptions,
        ) -> EngineResult<ContainerSummary> {
            self.hit();
            Err(EngineError::runtime("spy"))
        }

        async fn container_list(
            &self,
            _ctx: &EngineContext,
        ) -> EngineResult<Vec<ContainerSummary>> {
            self.hit();
            Ok(Vec::new())
        }

        async fn container_start(&self, _ctx: &EngineContext, _id: &str) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn container_stop(&self, _ctx: &EngineContext, _id: &str) -> EngineResult<()> {
            self.hit();
            Ok(())
        }

        async fn container_remove(
            &self,
            _ctx: &EngineContext,
            _id: &str,
            _force: bool,
        ) -> EngineResult<()> {
            self.hit();
            Ok(())
        }
    }

    struct SpyFactory {
        mode: ExecutionMode,
        created: AtomicUsize,
        containers: Arc<SpyContainers>,
    }

    impl SpyFactory {
        fn new(mode: ExecutionMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                created: AtomicUsize::new(0),
                containers: Arc::new(SpyContainers::default()),
            })
        }
    }

    impl EngineFactory for SpyFactory {
        fn mode(&self) -> ExecutionMode {
            self.mode
        }

        fn image_engine(&self) -> Arc<dyn ImageEngine> {
            unreachable!("image engine not used in these tests")
        }

        fn container_engine(&self) -> Arc<dyn ContainerEngine> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.containers.clone()
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = CommandRegistry::builder()
            .register(CommandRegistration::new("system", "df", BOTH))
            .register(CommandRegistration::new("system", "df", LOCAL_ONLY))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_registration_without_modes_rejected() {
        let err = CommandRegistry::builder()
            .register(CommandRegistration::root("version", &[]))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_default_registry_modes() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 17);
        assert!(registry.is_available("image save", ExecutionMode::Tunnel));
        assert!(registry.is_available("system df", ExecutionMode::Tunnel));
        for local_only in ["system migrate", "system renumber", "system service"] {
            assert!(registry.is_available(local_only, ExecutionMode::Local));
            assert!(!registry.is_available(local_only, ExecutionMode::Tunnel));
        }
        assert_eq!(
            registry.get("image save").unwrap().parent.as_deref(),
            Some("image")
        );
        assert!(
            !registry
                .commands_for(ExecutionMode::Tunnel)
                .contains(&"system renumber")
        );
    }

    #[tokio::test]
    async fn test_local_only_command_refused_in_tunnel_mode() {
        let factory = SpyFactory::new(ExecutionMode::Tunnel);
        let dispatcher = Dispatcher::new(default_registry().unwrap(), factory.clone());

        let err = match dispatcher.container_engine("system renumber") {
            Ok(_) => panic!("dispatch should fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            EngineError::ModeNotAvailable {
                mode: ExecutionMode::Tunnel,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 125);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(factory.containers.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registered_command_dispatches_once() {
        let factory = SpyFactory::new(ExecutionMode::Local);
        let dispatcher = Dispatcher::new(default_registry().unwrap(), factory.clone());
        let ctx = EngineContext::new();

        dispatcher
            .container_engine("system renumber")
            .unwrap()
            .system_renumber(&ctx, SystemRenumberOptions::default())
            .await
            .unwrap();
        dispatcher
            .container_engine("system df")
            .unwrap()
            .system_df(&ctx, SystemDfOptions::default())
            .await
            .unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.containers.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_command_not_available() {
        let dispatcher = Dispatcher::new(
            default_registry().unwrap(),
            SpyFactory::new(ExecutionMode::Local),
        );
        let err = dispatcher.check("image push").unwrap_err();
        assert_eq!(
            err.to_string(),
            "command \"image push\" is not available in local mode"
        );
    }
}
