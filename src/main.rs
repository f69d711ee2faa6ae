use anyhow::Result;
use clap::Parser;

use lathe::cli::Cli;
use lathe::{commands, logging};

fn main() -> Result<()> {
    // Initialize structured logging
    logging::init();

    let cli = Cli::parse();

    if cli.details {
        commands::details::run(&cli)
    } else {
        commands::build::run(&cli)
    }
}
