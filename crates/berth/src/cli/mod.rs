//! `berth` command line.
//!
//! Every engine-backed command goes through the [`Dispatcher`], so a command
//! not registered for the active mode fails before any engine runs.

mod container;
mod image;
mod output;
mod system;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use berth_protocol::ExecutionMode;
use clap::{Args, Parser, Subcommand};
use log::debug;

use crate::config::{AppConfig, write_default_config};
use crate::engine::EngineContext;
use crate::logging::LogOptions;
use crate::registry::{
    Dispatcher, EngineFactory, LocalEngineFactory, TunnelEngineFactory, default_registry,
};
use crate::runtime::LocalRuntime;

pub use container::ContainerCommand;
pub use image::ImageCommand;
pub use system::SystemCommand;

/// Exit status for a successful command.
pub const EXIT_OK: u8 = 0;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    author,
    version,
    about = "Manage container images and the local runtime, in-process or through berth-service.",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonOpts,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Forward commands to a berth-service daemon
    #[arg(short = 'r', long, global = true)]
    pub remote: bool,
    /// Socket of the berth-service daemon (implies --remote)
    #[arg(long, value_name = "PATH", global = true, env = "BERTH_SOCKET")]
    pub url: Option<PathBuf>,
    /// Storage root of the local runtime
    #[arg(long, value_name = "PATH", global = true)]
    pub root: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    pub trace: bool,
    /// Emit logs as JSON
    #[arg(long = "json-logs", global = true)]
    pub json_logs: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    pub json: bool,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,
}

impl CommonOpts {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            quiet: self.quiet,
            verbose: self.verbose,
            debug: self.debug,
            trace: self.trace,
            json: self.json_logs,
            no_color: self.no_color,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
    /// Inspect and maintain the runtime
    System {
        #[command(subcommand)]
        command: SystemCommand,
    },
    /// Manage containers
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Everything a command handler needs.
pub struct CliContext {
    pub config: AppConfig,
    pub dispatcher: Dispatcher,
    pub engine: EngineContext,
    pub json: bool,
    pub quiet: bool,
    pub assume_yes: bool,
}

impl CliContext {
    /// Resolve the mode once and build the dispatcher for it.
    pub fn new(common: &CommonOpts, mut config: AppConfig) -> Result<Self> {
        if let Some(root) = &common.root {
            config.storage.root = root.display().to_string();
        }
        if let Some(url) = &common.url {
            config.engine.remote_socket = Some(url.display().to_string());
        }
        let mode = if common.remote || common.url.is_some() {
            ExecutionMode::Tunnel
        } else {
            config.engine.mode
        };

        let factory: Arc<dyn EngineFactory> = match mode {
            ExecutionMode::Local => {
                let runtime = LocalRuntime::open(config.runtime_config())
                    .context("opening local runtime")?;
                Arc::new(LocalEngineFactory::new(Arc::new(runtime)))
            }
            ExecutionMode::Tunnel => Arc::new(TunnelEngineFactory::new(config.remote_socket())),
        };
        debug!("execution mode: {}", mode);

        Ok(Self {
            config,
            dispatcher: Dispatcher::new(default_registry()?, factory),
            engine: EngineContext::new(),
            json: common.json,
            quiet: common.quiet,
            assume_yes: common.assume_yes,
        })
    }
}

/// Run a parsed command line. Returns the process exit status.
pub async fn run(cli: Cli) -> Result<u8> {
    let (config, config_file) = AppConfig::load(cli.common.config.as_deref())?;

    let command = match cli.command {
        Command::Config { command } => {
            return handle_config(&config, &config_file, command, cli.common.json);
        }
        other => other,
    };

    let ctx = CliContext::new(&cli.common, config)?;
    let cancel = ctx.engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = match command {
        Command::Image { command } => image::handle(&ctx, command).await,
        Command::System { command } => system::handle(&ctx, command).await,
        Command::Container { command } => container::handle(&ctx, command).await,
        Command::Config { .. } => Ok(EXIT_OK),
    };
    interrupt.abort();
    result
}

fn handle_config(
    config: &AppConfig,
    config_file: &std::path::Path,
    command: ConfigCommand,
    json: bool,
) -> Result<u8> {
    match command {
        ConfigCommand::Show => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", toml::to_string_pretty(config)?);
            }
        }
        ConfigCommand::Path => println!("{}", config_file.display()),
        ConfigCommand::Init { force } => {
            write_default_config(config_file, force)?;
            println!("wrote {}", config_file.display());
        }
    }
    Ok(EXIT_OK)
}
