//! `berth image ...`

use anyhow::{Result, anyhow};
use berth_protocol::{
    Filters, ImageDeleteOptions, ImageListOptions, ImagePruneOptions, ImageSaveOptions,
    SaveFormat,
};
use chrono::Utc;
use clap::{Args, Subcommand};

use super::output::{format_age, format_size, print_json, repo_and_tag, short_id};
use super::{CliContext, EXIT_OK};

/// Exit status of `image exists` for a missing image.
const EXIT_ABSENT: u8 = 1;

#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// Save an image to an archive
    Save(SaveArgs),
    /// List images
    #[command(visible_alias = "list")]
    Ls {
        /// Show intermediate (untagged) images
        #[arg(short, long)]
        all: bool,
        /// Filter output (key=value); repeatable
        #[arg(short, long = "filter", value_name = "FILTER")]
        filters: Vec<String>,
    },
    /// Remove images
    #[command(visible_alias = "remove")]
    Rm {
        /// Remove images used by containers, and those containers
        #[arg(short, long)]
        force: bool,
        #[arg(required = true, value_name = "IMAGE")]
        images: Vec<String>,
    },
    /// Show the layer history of an image
    History {
        #[arg(value_name = "IMAGE")]
        image: String,
    },
    /// Remove unused images
    Prune {
        /// Remove all unused images, not only dangling ones
        #[arg(short, long)]
        all: bool,
        /// Filter images to prune (key=value); repeatable
        #[arg(long = "filter", value_name = "FILTER")]
        filters: Vec<String>,
    },
    /// Exit 0 if the image exists, 1 otherwise
    Exists {
        #[arg(value_name = "IMAGE")]
        image: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct SaveArgs {
    /// Compress layers (directory formats only)
    #[arg(long)]
    pub compress: bool,
    /// Archive format: oci-dir, oci-archive, docker-dir, docker-archive
    #[arg(long, default_value_t = SaveFormat::default().as_str().to_string())]
    pub format: String,
    /// Write to a file or directory instead of stdout
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<String>,
    /// Image to save
    #[arg(value_name = "IMAGE")]
    pub image: String,
    /// Extra names recorded in the archive
    #[arg(value_name = "TAGS")]
    pub tags: Vec<String>,
}

/// Parse repeated `key=value` flags into a filter map.
pub(crate) fn parse_filters(raw: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid filter {entry:?}: expected key=value"))?;
        filters
            .entry(key.trim().to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    Ok(filters)
}

pub async fn handle(ctx: &CliContext, command: ImageCommand) -> Result<u8> {
    match command {
        ImageCommand::Save(args) => {
            let engine = ctx.dispatcher.image_engine("image save")?;
            let opts = ImageSaveOptions {
                compress: args.compress,
                format: args.format,
                output: args.output,
                quiet: ctx.quiet,
            };
            engine.save(&ctx.engine, &args.image, &args.tags, opts).await?;
        }
        ImageCommand::Ls { all, filters } => {
            let engine = ctx.dispatcher.image_engine("image list")?;
            let opts = ImageListOptions {
                all,
                filters: parse_filters(&filters)?,
            };
            let images = engine.list(&ctx.engine, opts).await?;
            if ctx.json {
                print_json(&images)?;
                return Ok(EXIT_OK);
            }
            let now = Utc::now();
            println!(
                "{:<40} {:<12} {:<14} {:<24} {:>10}",
                "REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"
            );
            for image in &images {
                let names: Vec<Option<&str>> = if image.repo_tags.is_empty() {
                    vec![None]
                } else {
                    image.repo_tags.iter().map(|t| Some(t.as_str())).collect()
                };
                for name in names {
                    let (repo, tag) = repo_and_tag(name);
                    println!(
                        "{:<40} {:<12} {:<14} {:<24} {:>10}",
                        repo,
                        tag,
                        short_id(&image.id),
                        format_age(image.created, now),
                        format_size(image.size)
                    );
                }
            }
        }
        ImageCommand::Rm { force, images } => {
            let engine = ctx.dispatcher.image_engine("image rm")?;
            let report = engine
                .delete(&ctx.engine, &images, ImageDeleteOptions { force })
                .await?;
            if ctx.json {
                print_json(&report)?;
            } else {
                for tag in &report.untagged {
                    println!("Untagged: {tag}");
                }
                for id in &report.deleted {
                    println!("Deleted: {id}");
                }
            }
        }
        ImageCommand::History { image } => {
            let engine = ctx.dispatcher.image_engine("image history")?;
            let report = engine.history(&ctx.engine, &image).await?;
            if ctx.json {
                print_json(&report)?;
                return Ok(EXIT_OK);
            }
            let now = Utc::now();
            println!(
                "{:<14} {:<24} {:<40} {:>10}  {}",
                "ID", "CREATED", "CREATED BY", "SIZE", "COMMENT"
            );
            for layer in &report.layers {
                let created_by: String = layer.created_by.chars().take(40).collect();
                println!(
                    "{:<14} {:<24} {:<40} {:>10}  {}",
                    short_id(&layer.id),
                    format_age(layer.created, now),
                    created_by,
                    format_size(layer.size),
                    layer.comment
                );
            }
        }
        ImageCommand::Prune { all, filters } => {
            let engine = ctx.dispatcher.image_engine("image prune")?;
            let opts = ImagePruneOptions {
                all,
                filters: parse_filters(&filters)?,
            };
            let report = engine.prune(&ctx.engine, opts).await?;
            if ctx.json {
                print_json(&report)?;
            } else {
                for id in &report.ids {
                    println!("{id}");
                }
                println!("Total reclaimed space: {}", format_size(report.size));
            }
        }
        ImageCommand::Exists { image } => {
            let engine = ctx.dispatcher.image_engine("image exists")?;
            let report = engine.exists(&ctx.engine, &image).await?;
            if ctx.json {
                print_json(&report)?;
            }
            if !report.value {
                return Ok(EXIT_ABSENT);
            }
        }
    }
    Ok(EXIT_OK)
}
