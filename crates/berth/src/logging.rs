//! Logging setup shared by both binaries.
//!
//! `tracing` carries the service and tunnel spans. The subscriber also
//! installs the `log` bridge, so records the runtime emits through `log`
//! reach the same output. Output goes to stderr so it never mixes with
//! archive bytes or command output on stdout.

use std::env;
use std::io::{self, IsTerminal};

use log::LevelFilter;

/// Verbosity flags as given on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub debug: bool,
    pub trace: bool,
    pub json: bool,
    pub no_color: bool,
}

impl LogOptions {
    pub fn level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Install the global subscriber and its `log` bridge. Safe to call more than
/// once; later calls are ignored.
pub fn init_logging(opts: &LogOptions) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = opts.level();
    let name = level_name(level);
    let env_filter = EnvFilter::try_from_env("BERTH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("berth={name},tower_http={name}")));

    if opts.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        let disable_color = opts.no_color
            || env::var_os("NO_COLOR").is_some()
            || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_ansi(!disable_color)
                    .with_target(level >= LevelFilter::Debug),
            )
            .try_init()
            .ok();
    }
}
