mod cache;
mod cli;
mod commands;
mod common;
mod config;
mod error;
mod http;
mod package;
mod rest_api;
#[cfg(test)]
mod test_support;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::Cli;
use crate::common::paths;
use crate::config::Config;
use crate::ui::prelude::*;

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .overrides
        .config_path
        .clone()
        .unwrap_or_else(paths::default_config_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    let loaded = config.clone();

    let verbose = cli.overrides.verbose.max(config.verbose);
    ui::set_verbosity(verbose);
    if config.enable_file_logging {
        match paths::log_file_path() {
            Ok(path) => ui::set_log_file(Some(path)),
            Err(e) => emit(
                Level::Warn,
                "log.unavailable",
                &format!("{} File logging disabled: {e:#}", char::from(NerdFont::Warning)),
                None,
            ),
        }
    }

    let code = commands::handle_command(cli.command, &mut config, &cli.overrides).await?;

    if config != loaded {
        config
            .save()
            .with_context(|| format!("saving configuration to {}", config_path.display()))?;
    }
    Ok(code)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    ui::init(cli.output, !cli.no_color);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            emit(
                Level::Error,
                "gdpm.error",
                &format!("{} {e:#}", char::from(NerdFont::Cross)),
                None,
            );
            commands::EXIT_FAILURE
        }
    };
    std::process::exit(code);
}
