//! berth: container image and system management.
//!
//! The same operation set runs either in-process against the local runtime
//! or through a `berth-service` daemon listening on a unix socket. The CLI
//! picks the mode once at startup; the [`registry::Dispatcher`] then hands
//! out the engines for that mode.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod save;
pub mod service;

pub use engine::{ContainerEngine, EngineContext, ImageEngine, ImageExport};
pub use error::{EXIT_FAILURE, EngineError, EngineResult};
