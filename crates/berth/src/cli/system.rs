//! `berth system ...`

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};
use berth_protocol::{
    IdleTimeout, SystemDfOptions, SystemDfReport, SystemMigrateOptions, SystemRenumberOptions,
    SystemResetOptions,
};
use clap::Subcommand;

use super::output::{format_size, print_json, short_id};
use super::{CliContext, EXIT_OK};

#[derive(Debug, Subcommand)]
pub enum SystemCommand {
    /// Show host, store and runtime information
    Info,
    /// Show disk usage
    Df {
        /// Itemize images and containers
        #[arg(short, long)]
        verbose: bool,
    },
    /// Remove all images and containers
    Reset {
        /// Reset even while containers are running
        #[arg(short, long)]
        force: bool,
    },
    /// Stop every container and rebind it to another OCI runtime
    Migrate {
        /// OCI runtime to bind containers to
        #[arg(long, value_name = "NAME")]
        new_runtime: Option<String>,
    },
    /// Reassign container lock slots after a lock count change
    Renumber,
    /// Serve the remote API on a unix socket
    Service {
        /// Seconds without requests before exiting (0 = never)
        #[arg(short = 't', long = "time", value_name = "SECONDS")]
        time: Option<u64>,
        /// Socket path to listen on
        #[arg(value_name = "SOCKET")]
        socket: Option<PathBuf>,
    },
}

pub async fn handle(ctx: &CliContext, command: SystemCommand) -> Result<u8> {
    match command {
        SystemCommand::Info => {
            let engine = ctx.dispatcher.container_engine("system info")?;
            let info = engine.info(&ctx.engine).await?;
            if ctx.json {
                print_json(&info)?;
                return Ok(EXIT_OK);
            }
            println!("version: {}", info.version);
            println!("host:");
            println!("  os: {}", info.host.os);
            println!("  arch: {}", info.host.arch);
            println!("  hostname: {}", info.host.hostname);
            println!("  cpus: {}", info.host.cpus);
            println!("  rootless: {}", info.host.rootless);
            println!("store:");
            println!("  root: {}", info.store.root.display());
            println!("  images: {}", info.store.image_count);
            println!(
                "  containers: {} ({} running)",
                info.store.container_count, info.store.running
            );
            println!("runtime:");
            println!("  default oci runtime: {}", info.runtime.default_oci_runtime);
            println!("  lock slots: {}", info.runtime.num_locks);
        }
        SystemCommand::Df { verbose } => {
            let engine = ctx.dispatcher.container_engine("system df")?;
            let report = engine
                .system_df(&ctx.engine, SystemDfOptions { verbose })
                .await?;
            if ctx.json {
                print_json(&report)?;
            } else if verbose {
                print_df_verbose(&report);
            } else {
                print_df_summary(&report);
            }
        }
        SystemCommand::Reset { force } => {
            let engine = ctx.dispatcher.container_engine("system reset")?;
            if !ctx.assume_yes && !confirm("This removes all images and containers. Continue?")? {
                bail!("reset aborted");
            }
            engine
                .system_reset(&ctx.engine, SystemResetOptions { force })
                .await?;
        }
        SystemCommand::Migrate { new_runtime } => {
            let engine = ctx.dispatcher.container_engine("system migrate")?;
            engine
                .system_migrate(&ctx.engine, SystemMigrateOptions { new_runtime })
                .await?;
        }
        SystemCommand::Renumber => {
            let engine = ctx.dispatcher.container_engine("system renumber")?;
            engine
                .system_renumber(&ctx.engine, SystemRenumberOptions::default())
                .await?;
        }
        SystemCommand::Service { time, socket } => {
            let engine = ctx.dispatcher.container_engine("system service")?;
            let mut opts = ctx.config.service_options();
            if let Some(secs) = time {
                opts.idle_timeout = IdleTimeout::from_secs(secs);
            }
            if let Some(socket) = socket {
                opts.socket_path = socket;
            }
            engine.service(&ctx.engine, opts).await?;
        }
    }
    Ok(EXIT_OK)
}

/// Ask on stderr; a non-interactive stdin counts as "no".
fn confirm(question: &str) -> Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }
    eprint!("{question} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

fn print_df_summary(report: &SystemDfReport) {
    let active_images = report.images.iter().filter(|i| i.containers > 0).count();
    let running = report
        .containers
        .iter()
        .filter(|c| c.state == berth_protocol::ContainerState::Running)
        .count();
    println!(
        "{:<12} {:>6} {:>8} {:>10} {:>12}",
        "TYPE", "TOTAL", "ACTIVE", "SIZE", "RECLAIMABLE"
    );
    println!(
        "{:<12} {:>6} {:>8} {:>10} {:>12}",
        "Images",
        report.images.len(),
        active_images,
        format_size(report.images_size),
        format_size(report.reclaimable_size)
    );
    println!(
        "{:<12} {:>6} {:>8} {:>10} {:>12}",
        "Containers",
        report.containers.len(),
        running,
        "-",
        "-"
    );
}

fn print_df_verbose(report: &SystemDfReport) {
    println!("Images space usage:\n");
    println!(
        "{:<40} {:<14} {:>10} {:>11}",
        "REPOSITORY", "IMAGE ID", "SIZE", "CONTAINERS"
    );
    for image in &report.images {
        let name = image
            .repo_tags
            .first()
            .map(String::as_str)
            .unwrap_or("<none>");
        println!(
            "{:<40} {:<14} {:>10} {:>11}",
            name,
            short_id(&image.id),
            format_size(image.size),
            image.containers
        );
    }
    println!("\nContainers space usage:\n");
    println!(
        "{:<14} {:<14} {:<10} {:<24}",
        "CONTAINER ID", "IMAGE", "STATUS", "NAMES"
    );
    for container in &report.containers {
        println!(
            "{:<14} {:<14} {:<10} {:<24}",
            short_id(&container.id),
            short_id(&container.image),
            container.state.to_string(),
            container.name
        );
    }
}
