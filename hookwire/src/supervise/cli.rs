//! # Pipeline commands
//!
//! `start`, `stop` and `check` sub-commands.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use events::Decoders;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};

use super::{StartupFailure, Supervisor};
use crate::{
    cli::SubCommandRunner,
    config::Config,
    core::{
        events::{EventChannel, OverflowPolicy},
        probe::{AttachmentManager, ProbeDescriptor},
    },
    helpers::{
        pidfile::{read_pid, PidFile},
        signals::Running,
    },
    sink::LogFormat,
};

const DEFAULT_PID_FILE: &str = "/tmp/hookwire.pid";

/// Options shared by the commands building a pipeline. They take precedence
/// over the configuration file.
#[derive(Args, Debug, Default)]
pub(crate) struct PipelineArgs {
    #[arg(short, long, help = "YAML configuration file")]
    pub(crate) config: Option<PathBuf>,
    #[arg(
        id = "probe",
        short,
        long,
        help = "Add a probe, in addition to the ones of the configuration file. Can be used
multiple times. Probes follow the ID=KIND:HOOK[/vSCHEMA] pattern, with KIND one of entry
(fentry), exit (fexit) or standalone (xdp). SCHEMA defaults to 1.

Examples:
  --probe fentry_xdp=entry:xdp_prog --probe xdp_drop=xdp:eth0/v2"
    )]
    pub(crate) probes: Vec<ProbeDescriptor>,
    #[arg(long, help = "Event channel capacity, must be a power of two")]
    pub(crate) capacity: Option<usize>,
    #[arg(long, value_enum, help = "Behavior when the event channel is full")]
    pub(crate) policy: Option<OverflowPolicy>,
    #[arg(long, help = "Consumer poll interval, in milliseconds")]
    pub(crate) poll_interval: Option<u64>,
    #[arg(long, value_enum, help = "Format of the events log")]
    pub(crate) format: Option<LogFormat>,
    #[arg(short, long, help = "Write the events log to a file instead of stdout")]
    pub(crate) out: Option<PathBuf>,
}

impl PipelineArgs {
    /// Load the configuration file, if any, and apply the command line
    /// overrides.
    pub(crate) fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        config.probes.extend(self.probes.iter().cloned());
        if let Some(capacity) = self.capacity {
            config.channel.capacity = capacity;
        }
        if let Some(policy) = self.policy {
            config.channel.policy = policy;
        }
        if let Some(ms) = self.poll_interval {
            config.consumer.poll_interval_ms = ms;
        }
        if let Some(format) = self.format {
            config.sinks.log.format = format;
        }
        if let Some(out) = &self.out {
            config.sinks.log.path = Some(out.clone());
        }

        Ok(config)
    }
}

/// Attach the probes and pipe their events to the sinks, until a
/// termination signal is received.
#[derive(Parser, Debug, Default)]
#[command(name = "start")]
pub(crate) struct Start {
    #[command(flatten)]
    pub(crate) pipeline: PipelineArgs,
    #[arg(long, default_value = DEFAULT_PID_FILE, help = "Path of the pid file")]
    pub(crate) pid_file: PathBuf,
}

fn config_failure(e: anyhow::Error) -> StartupFailure {
    StartupFailure::Config(e.into())
}

impl SubCommandRunner for Start {
    fn run(&mut self) -> Result<()> {
        let config = self.pipeline.config().map_err(config_failure)?;
        let running = Running::new().map_err(config_failure)?;
        let _pid_file = PidFile::create(&self.pid_file).map_err(config_failure)?;

        let channel = EventChannel::new(config.channel.capacity, config.channel.policy)
            .map_err(|e| StartupFailure::Config(e.into()))?;
        debug!(
            "Event channel of {} records, {:?} policy",
            channel.capacity(),
            channel.policy()
        );
        let (registry, artifacts) = config.backend.build().map_err(config_failure)?;
        let sinks = config.sinks.build().map_err(config_failure)?;

        let mut supervisor = Supervisor::new(
            AttachmentManager::new(registry, artifacts),
            channel,
            Arc::new(Decoders::default()),
            sinks,
            config.consumer.consumer_config(),
        );

        supervisor.start(config.probes)?;
        info!("Running, press Ctrl-C or use 'hookwire stop' to stop");

        let res = supervisor.wait(&running);
        let shutdown = supervisor.shutdown();

        res?;
        shutdown?;
        Ok(())
    }
}

/// Stop a running instance.
#[derive(Parser, Debug, Default)]
#[command(name = "stop")]
pub(crate) struct Stop {
    #[arg(long, default_value = DEFAULT_PID_FILE, help = "Path of the pid file")]
    pub(crate) pid_file: PathBuf,
}

impl SubCommandRunner for Stop {
    fn run(&mut self) -> Result<()> {
        let pid = read_pid(&self.pid_file)?;
        kill(pid, Signal::SIGTERM).with_context(|| format!("Could not signal process {pid}"))?;

        info!("Sent SIGTERM to {pid}");
        Ok(())
    }
}

/// Validate the configuration and the probes, without attaching anything.
#[derive(Parser, Debug, Default)]
#[command(name = "check")]
pub(crate) struct Check {
    #[command(flatten)]
    pub(crate) pipeline: PipelineArgs,
}

impl SubCommandRunner for Check {
    fn run(&mut self) -> Result<()> {
        let config = self.pipeline.config().map_err(config_failure)?;

        EventChannel::new(config.channel.capacity, config.channel.policy)
            .map_err(|e| StartupFailure::Config(e.into()))?;
        let (registry, artifacts) = config.backend.build().map_err(config_failure)?;
        let manager = AttachmentManager::new(registry, artifacts);
        let decoders = Decoders::default();

        if config.probes.is_empty() {
            warn!("No probe configured");
        }

        for (i, descriptor) in config.probes.iter().enumerate() {
            manager
                .validate(descriptor, &decoders, &config.probes[..i])
                .map_err(|source| StartupFailure::Probe {
                    probe: descriptor.id().to_string(),
                    source,
                })?;
            info!("Probe {descriptor} is valid");
        }

        info!(
            "Configuration is valid ({} probe(s), poll interval {:?})",
            config.probes.len(),
            Duration::from_millis(config.consumer.poll_interval_ms)
        );
        Ok(())
    }
}
