use anyhow::{bail, Result};
use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use log::LevelFilter;

use crate::supervise::{Check, Start, Stop};

/// SubCommandRunner defines the common interface to run SubCommands.
pub(crate) trait SubCommandRunner {
    fn run(&mut self) -> Result<()>;
}

/// Attach probes to kernel and network hooks and pipe their events to sinks
///
/// hookwire attaches instrumentation programs to live hooks, collects the
/// events they report through a bounded channel and decodes them for the
/// configured sinks.
#[derive(Parser, Debug)]
#[command(name = "hookwire", version)]
pub(crate) struct HookwireCli {
    #[command(flatten)]
    pub(crate) main_config: MainConfig,
    #[command(subcommand)]
    pub(crate) subcommand: SubCommands,
}

#[derive(Args, Debug, Default)]
pub(crate) struct MainConfig {
    #[arg(
        long,
        global = true,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
}

impl MainConfig {
    pub(crate) fn level_filter(&self) -> Result<LevelFilter> {
        Ok(match self.log_level.as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            x => bail!("Invalid log_level: {}", x),
        })
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum SubCommands {
    Start(Start),
    Stop(Stop),
    Check(Check),
}

impl SubCommands {
    pub(crate) fn runner(&mut self) -> &mut dyn SubCommandRunner {
        match self {
            SubCommands::Start(cmd) => cmd,
            SubCommands::Stop(cmd) => cmd,
            SubCommands::Check(cmd) => cmd,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify() {
        HookwireCli::command().debug_assert();
    }

    #[test]
    fn parse() {
        let cli = HookwireCli::try_parse_from(["hookwire", "stop"]).unwrap();
        assert!(matches!(cli.subcommand, SubCommands::Stop(_)));
        assert_eq!(cli.main_config.level_filter().unwrap(), LevelFilter::Info);

        let cli = HookwireCli::try_parse_from([
            "hookwire",
            "--log-level",
            "debug",
            "start",
            "-p",
            "a=entry:dummy",
        ])
        .unwrap();
        assert!(matches!(cli.subcommand, SubCommands::Start(_)));
        assert_eq!(cli.main_config.level_filter().unwrap(), LevelFilter::Debug);

        let cli = HookwireCli::try_parse_from(["hookwire", "check", "--log-level", "warn"]).unwrap();
        assert_eq!(cli.main_config.level_filter().unwrap(), LevelFilter::Warn);

        assert!(HookwireCli::try_parse_from(["hookwire"]).is_err());
        assert!(HookwireCli::try_parse_from(["hookwire", "--log-level", "loud", "stop"]).is_err());
    }
}
