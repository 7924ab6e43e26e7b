use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::error;

mod cli;
mod config;
mod core;
mod helpers;
mod sink;
mod supervise;

use crate::{
    cli::{HookwireCli, SubCommandRunner},
    helpers::logger::Logger,
    supervise::exit_code,
};

fn run(mut cli: HookwireCli) -> Result<()> {
    Logger::init(cli.main_config.level_filter()?)?;
    cli.subcommand.runner().run()
}

fn main() -> ExitCode {
    let cli = HookwireCli::parse();

    let res = run(cli);
    if let Err(e) = &res {
        error!("{e:#}");
    }
    ExitCode::from(exit_code(&res))
}
