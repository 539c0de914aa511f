use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Result;
use berth::EngineError;
use berth::cli::{self, Cli};
use berth::error::EXIT_FAILURE;
use berth::logging::init_logging;
use clap::Parser;

fn main() -> ExitCode {
    match try_main() {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            let status = err
                .downcast_ref::<EngineError>()
                .map(EngineError::exit_code)
                .unwrap_or(EXIT_FAILURE);
            let _ = writeln!(io::stderr(), "Error: {err:#}");
            ExitCode::from(status)
        }
    }
}

#[tokio::main]
async fn try_main() -> Result<u8> {
    let cli = Cli::parse();
    init_logging(&cli.common.log_options());
    cli::run(cli).await
}
