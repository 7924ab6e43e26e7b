use std::{
    error::Error as StdError,
    io, mem,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use events::Decoders;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    core::{
        events::{ChannelStats, ConsumerConfig, ConsumerStats, EventChannel, EventConsumer},
        probe::{AttachmentManager, ProbeDescriptor},
        Error,
    },
    helpers::signals::Running,
    sink::Sink,
};

/// Interval at which the consumer health is checked while running.
const WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Errors preventing the pipeline from starting. Any attachment done before
/// the failure was rolled back.
#[derive(Debug, Error)]
pub(crate) enum StartupFailure {
    #[error("invalid configuration")]
    Config(#[source] Box<dyn StdError + Send + Sync>),
    #[error("could not set up probe '{probe}'")]
    Probe {
        probe: String,
        #[source]
        source: Error,
    },
    #[error("could not start event delivery")]
    Events(#[source] Box<dyn StdError + Send + Sync>),
    #[error("could not start the event consumer")]
    Consumer(#[source] io::Error),
}

/// Process exit code matching the outcome of a command: 0 on success, 1 if
/// the pipeline failed to start, 2 on runtime errors.
pub(crate) fn exit_code(res: &Result<()>) -> u8 {
    match res {
        Ok(()) => 0,
        Err(e) if e.chain().any(|c| c.is::<StartupFailure>()) => 1,
        Err(_) => 2,
    }
}

/// Final counters of a pipeline run.
#[derive(Debug, Default)]
pub(crate) struct ShutdownReport {
    pub(crate) consumer: ConsumerStats,
    pub(crate) channel: ChannelStats,
}

struct RunningConsumer {
    run_state: Running,
    thread: JoinHandle<ConsumerStats>,
}

/// Owns the attachments and the channel for the lifetime of the pipeline:
/// attach, run, drain and detach.
pub(crate) struct Supervisor {
    manager: AttachmentManager,
    channel: Option<EventChannel>,
    decoders: Arc<Decoders>,
    /// Handed over to the consumer on start.
    sinks: Vec<Box<dyn Sink>>,
    consumer_config: ConsumerConfig,
    consumer: Option<RunningConsumer>,
    events_started: bool,
    done: bool,
}

impl Supervisor {
    pub(crate) fn new(
        manager: AttachmentManager,
        channel: EventChannel,
        decoders: Arc<Decoders>,
        sinks: Vec<Box<dyn Sink>>,
        consumer_config: ConsumerConfig,
    ) -> Self {
        Supervisor {
            manager,
            channel: Some(channel),
            decoders,
            sinks,
            consumer_config,
            consumer: None,
            events_started: false,
            done: false,
        }
    }

    pub(crate) fn manager(&self) -> &AttachmentManager {
        &self.manager
    }

    /// Validate and attach all descriptors, then start delivering and
    /// consuming events. Attaching is all-or-nothing: on failure the probes
    /// attached so far are detached, in reverse order.
    pub(crate) fn start(&mut self, descriptors: Vec<ProbeDescriptor>) -> Result<(), StartupFailure> {
        if self.channel.is_none() || self.events_started {
            return Err(StartupFailure::Events("pipeline already started".into()));
        }

        // Fail fast, before attaching anything.
        for (i, descriptor) in descriptors.iter().enumerate() {
            self.manager
                .validate(descriptor, &self.decoders, &descriptors[..i])
                .map_err(|source| StartupFailure::Probe {
                    probe: descriptor.id().to_string(),
                    source,
                })?;
        }

        if descriptors.is_empty() {
            warn!("No probe to attach");
        }

        for descriptor in descriptors.into_iter() {
            let id = descriptor.id().to_string();
            if let Err(source) = self.manager.attach(Arc::new(descriptor)) {
                error!("{source} ({:?})", source.kind());
                self.rollback();
                return Err(StartupFailure::Probe { probe: id, source });
            }
        }

        if let Err(e) = self.start_events() {
            self.rollback();
            return Err(StartupFailure::Events(e.into()));
        }

        if let Err(e) = self.start_consumer() {
            self.rollback();
            return Err(StartupFailure::Consumer(e));
        }

        info!("{} probe(s) attached", self.manager.active().len());
        Ok(())
    }

    fn start_events(&mut self) -> Result<()> {
        let publisher = self
            .channel
            .as_ref()
            .and_then(|c| c.publisher())
            .ok_or_else(|| anyhow!("event channel publisher unavailable"))?;

        self.manager.start_events(publisher)?;
        self.events_started = true;
        Ok(())
    }

    fn start_consumer(&mut self) -> io::Result<()> {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return Err(io::Error::other("event channel released")),
        };

        let consumer = EventConsumer::new(
            channel,
            self.manager.schema_table(),
            Arc::clone(&self.decoders),
            mem::take(&mut self.sinks),
            self.consumer_config.clone(),
        );

        let run_state = Running::ignore_signals();
        let thread = consumer.spawn(run_state.clone())?;
        self.consumer = Some(RunningConsumer { run_state, thread });
        Ok(())
    }

    /// Undo a partial start.
    fn rollback(&mut self) {
        if self.events_started {
            if let Err(e) = self.manager.stop_events() {
                warn!("Could not stop events: {e}");
            }
            self.events_started = false;
        }

        let errors = self.manager.detach_all();
        if !errors.is_empty() {
            warn!("{} probe(s) could not be detached", errors.len());
        }
    }

    /// Run until `running` is stopped (e.g. a termination signal is
    /// received). An error is returned if the consumer dies in the meantime.
    pub(crate) fn wait(&self, running: &Running) -> Result<()> {
        while running.sleep(WAIT_INTERVAL) {
            if let Some(consumer) = &self.consumer {
                if consumer.thread.is_finished() {
                    bail!("event consumer exited unexpectedly");
                }
            }
        }
        Ok(())
    }

    /// Stop the consumer (which drains the channel a last time), detach all
    /// probes in reverse attach order and finally release the channel.
    pub(crate) fn shutdown(&mut self) -> Result<ShutdownReport> {
        if self.done {
            bail!("pipeline already shut down");
        }
        self.done = true;

        let mut report = ShutdownReport::default();
        let mut failures = Vec::new();

        if let Some(consumer) = self.consumer.take() {
            consumer.run_state.terminate();
            match consumer.thread.join() {
                Ok(stats) => report.consumer = stats,
                Err(_) => failures.push("event consumer panicked".to_string()),
            }
        }

        let errors = self.manager.detach_all();
        if !errors.is_empty() {
            failures.push(format!("{} probe(s) failed to detach", errors.len()));
        }

        if self.events_started {
            if let Err(e) = self.manager.stop_events() {
                failures.push(format!("could not stop events: {e}"));
            }
            self.events_started = false;
        }

        if let Some(channel) = self.channel.take() {
            report.channel = channel.stats();
        }
        Self::report(&report);

        if !failures.is_empty() {
            bail!("shutdown: {}", failures.join(", "));
        }
        Ok(report)
    }

    fn report(report: &ShutdownReport) {
        let (channel, consumer) = (&report.channel, &report.consumer);
        debug!("Channel stats: {channel:?}");

        if channel.dropped > 0 {
            warn!("lost {} event(s), the channel was full", channel.dropped);
        }
        if channel.overwritten > 0 {
            warn!(
                "lost {} event(s), overwritten before being read",
                channel.overwritten
            );
        }
        if channel.unread() > 0 {
            warn!(
                "{} event(s) left unprocessed in the channel",
                channel.unread()
            );
        }
        if consumer.decode_errors > 0 {
            warn!("{} event(s) could not be decoded", consumer.decode_errors);
        }
        if consumer.sink_errors > 0 {
            warn!(
                "{} event delivery(ies) failed, {} sink(s) disabled",
                consumer.sink_errors, consumer.sinks_disabled
            );
        }

        info!("{} event(s) processed", consumer.decoded);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.shutdown() {
                error!("{e}");
            }
        }
    }
}
