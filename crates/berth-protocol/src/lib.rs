//! Shared types for berth engine operations.
//!
//! Every capability operation takes one of the option types defined here and
//! returns one of the report types, whether it runs in-process against the
//! local runtime or is forwarded to a `berth-service` daemon:
//!
//! ```text
//! CLI --[options]--> engine (local | tunnel) --[report]--> CLI
//!                        |
//!                        +--[HTTP/JSON over unix socket]--> berth-service --> local engine
//! ```
//!
//! Options are built once from user input and never mutated afterwards.
//! Reports are owned by whoever receives them.

pub mod containers;
pub mod images;
pub mod mode;
pub mod system;
pub mod wire;

pub use containers::{ContainerCreateOptions, ContainerState, ContainerSummary};
pub use images::{
    BoolReport, ImageDeleteOptions, ImageDeleteReport, ImageHistoryLayer, ImageHistoryReport,
    ImageListOptions, ImagePruneOptions, ImagePruneReport, ImageSaveOptions, ImageSummary,
    Filters, SaveFormat, UnknownSaveFormat,
};
pub use mode::ExecutionMode;
pub use system::{
    DfImageEntry, HostInfo, IdleTimeout, RuntimeInfo, ServiceOptions, StoreInfo, SystemDfOptions,
    SystemDfReport, SystemInfo, SystemMigrateOptions, SystemRenumberOptions, SystemResetOptions,
};
