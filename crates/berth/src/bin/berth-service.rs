//! berth-service - serves the berth API on a unix socket.
//!
//! Runs the local runtime behind the socket until the idle timeout expires
//! or SIGINT/SIGTERM arrives.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use berth::config::AppConfig;
use berth::engine::local::LocalContainerEngine;
use berth::error::EXIT_FAILURE;
use berth::logging::{LogOptions, init_logging};
use berth::runtime::LocalRuntime;
use berth::{ContainerEngine, EngineContext};
use berth_protocol::IdleTimeout;
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(
    name = "berth-service",
    author,
    version,
    about = "Serve the berth API on a unix socket."
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Socket path to listen on
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Seconds without requests before exiting (0 = never)
    #[arg(short = 't', long = "time", value_name = "SECONDS")]
    time: Option<u64>,
    /// Storage root of the local runtime
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,
}

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:#}");
        return ExitCode::from(EXIT_FAILURE);
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogOptions {
        // The daemon reports its lifecycle at info by default.
        verbose: cli.verbose + 1,
        json: cli.json_logs,
        ..Default::default()
    });

    let (mut config, config_file) = AppConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.storage.root = root.display().to_string();
    }
    let mut opts = config.service_options();
    if let Some(socket) = cli.socket {
        opts.socket_path = socket;
    }
    if let Some(secs) = cli.time {
        opts.idle_timeout = IdleTimeout::from_secs(secs);
    }
    info!("using configuration {:?}", config_file);

    let runtime = LocalRuntime::open(config.runtime_config()).context("opening local runtime")?;
    let engine = LocalContainerEngine::new(Arc::new(runtime));
    engine.service(&EngineContext::new(), opts).await?;
    Ok(())
}
