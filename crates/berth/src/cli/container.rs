//! `berth container ...`

use anyhow::Result;
use berth_protocol::ContainerCreateOptions;
use chrono::Utc;
use clap::Subcommand;

use super::output::{format_age, print_json, short_id};
use super::{CliContext, EXIT_OK};

#[derive(Debug, Subcommand)]
pub enum ContainerCommand {
    /// Create a container from an image
    Create {
        /// Container name (generated when omitted)
        #[arg(long)]
        name: Option<String>,
        /// OCI runtime to bind the container to
        #[arg(long, value_name = "NAME")]
        runtime: Option<String>,
        #[arg(value_name = "IMAGE")]
        image: String,
    },
    /// List containers
    #[command(visible_alias = "list")]
    Ls,
    /// Start containers
    Start {
        #[arg(required = true, value_name = "CONTAINER")]
        containers: Vec<String>,
    },
    /// Stop containers
    Stop {
        #[arg(required = true, value_name = "CONTAINER")]
        containers: Vec<String>,
    },
    /// Remove containers
    Rm {
        /// Remove running containers too
        #[arg(short, long)]
        force: bool,
        #[arg(required = true, value_name = "CONTAINER")]
        containers: Vec<String>,
    },
}

pub async fn handle(ctx: &CliContext, command: ContainerCommand) -> Result<u8> {
    match command {
        ContainerCommand::Create {
            name,
            runtime,
            image,
        } => {
            let engine = ctx.dispatcher.container_engine("container create")?;
            let created = engine
                .container_create(
                    &ctx.engine,
                    ContainerCreateOptions {
                        name,
                        image,
                        oci_runtime: runtime,
                    },
                )
                .await?;
            if ctx.json {
                print_json(&created)?;
            } else {
                println!("{}", created.id);
            }
        }
        ContainerCommand::Ls => {
            let engine = ctx.dispatcher.container_engine("container list")?;
            let containers = engine.container_list(&ctx.engine).await?;
            if ctx.json {
                print_json(&containers)?;
                return Ok(EXIT_OK);
            }
            let now = Utc::now();
            println!(
                "{:<14} {:<14} {:<10} {:<8} {:>5} {:<24} {}",
                "CONTAINER ID", "IMAGE", "STATUS", "RUNTIME", "LOCK", "CREATED", "NAMES"
            );
            for c in &containers {
                println!(
                    "{:<14} {:<14} {:<10} {:<8} {:>5} {:<24} {}",
                    short_id(&c.id),
                    short_id(&c.image),
                    c.state.to_string(),
                    c.oci_runtime,
                    c.lock_slot,
                    format_age(c.created, now),
                    c.name
                );
            }
        }
        ContainerCommand::Start { containers } => {
            let engine = ctx.dispatcher.container_engine("container start")?;
            for id in containers {
                engine.container_start(&ctx.engine, &id).await?;
                println!("{id}");
            }
        }
        ContainerCommand::Stop { containers } => {
            let engine = ctx.dispatcher.container_engine("container stop")?;
            for id in containers {
                engine.container_stop(&ctx.engine, &id).await?;
                println!("{id}");
            }
        }
        ContainerCommand::Rm { force, containers } => {
            let engine = ctx.dispatcher.container_engine("container rm")?;
            for id in containers {
                engine.container_remove(&ctx.engine, &id, force).await?;
                println!("{id}");
            }
        }
    }
    Ok(EXIT_OK)
}
