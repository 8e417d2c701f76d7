//! `simperium` command line tool

mod commands;
mod config;
mod logging;

use clap::Parser;

use crate::config::{Cli, Settings};
use crate::logging::LoggingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging_guard = logging::init_logging(&LoggingConfig::from_env())?;

    let settings = Settings::load(&cli)?;
    commands::run(cli.command, settings).await
}
