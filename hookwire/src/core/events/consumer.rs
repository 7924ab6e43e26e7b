//! # Consumer
//!
//! Drains the event channel on a dedicated thread, decodes the records and
//! forwards them to the sinks.

use std::{
    collections::HashMap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use events::{DecodedEvent, Decoders, EventRecord};
use log::{debug, error, warn, Level};

use super::EventChannel;
use crate::{
    core::{probe::ProbeDescriptor, Error},
    helpers::{ratelimit::RateLimiter, signals::Running},
    sink::Sink,
};

#[derive(Clone, Debug)]
pub(crate) struct ConsumerConfig {
    /// Time to sleep when the channel was found empty.
    pub(crate) poll_interval: Duration,
    /// Maximum number of records handled per drain cycle.
    pub(crate) batch_size: usize,
    /// Maximum number of records handled once stopped.
    pub(crate) final_drain_max: usize,
    /// Minimum interval between two logs of the same runtime error class.
    pub(crate) error_log_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            poll_interval: Duration::from_millis(100),
            batch_size: 256,
            final_drain_max: 8192,
            error_log_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ConsumerStats {
    pub(crate) decoded: u64,
    pub(crate) decode_errors: u64,
    /// Failed deliveries, counted once per sink.
    pub(crate) sink_errors: u64,
    /// Sinks disabled after panicking.
    pub(crate) sinks_disabled: u64,
}

pub(crate) struct EventConsumer {
    channel: EventChannel,
    /// Hook id to descriptor map, giving the schema of each record.
    table: HashMap<u32, Arc<ProbeDescriptor>>,
    decoders: Arc<Decoders>,
    sinks: Vec<Box<dyn Sink>>,
    config: ConsumerConfig,
    stats: ConsumerStats,
    decode_log: RateLimiter,
    sink_log: RateLimiter,
}

impl EventConsumer {
    pub(crate) fn new(
        channel: EventChannel,
        table: HashMap<u32, Arc<ProbeDescriptor>>,
        decoders: Arc<Decoders>,
        sinks: Vec<Box<dyn Sink>>,
        config: ConsumerConfig,
    ) -> Self {
        EventConsumer {
            channel,
            table,
            decoders,
            sinks,
            decode_log: RateLimiter::new(config.error_log_interval),
            sink_log: RateLimiter::new(config.error_log_interval),
            config,
            stats: ConsumerStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Decode a record according to the schema of the probe owning its hook
    /// id.
    pub(crate) fn decode(&self, record: &EventRecord) -> Result<DecodedEvent, Error> {
        let descriptor = self
            .table
            .get(&record.hook_id)
            .ok_or(Error::UnknownHookId(record.hook_id))?;

        let body = self
            .decoders
            .decode(
                descriptor.schema_version(),
                descriptor.kind(),
                record.payload(),
            )
            .map_err(|source| Error::Decode {
                probe: descriptor.id().to_string(),
                source,
            })?;

        Ok(DecodedEvent {
            timestamp: record.timestamp_ns,
            hook_id: record.hook_id,
            probe: descriptor.id().to_string(),
            hook: descriptor.hook().to_string(),
            kind: descriptor.kind(),
            body,
        })
    }

    /// Decode a single record and hand it to all sinks. Errors are counted,
    /// logged and never stop the processing.
    pub(crate) fn process(&mut self, record: &EventRecord) {
        let event = match self.decode(record) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_errors += 1;
                crate::ratelimited!(self.decode_log, Level::Warn, "Skipping event: {}", e);
                return;
            }
        };
        self.stats.decoded += 1;

        self.sinks.retain_mut(|sink| {
            match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(&event))) {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    self.stats.sink_errors += 1;
                    let e = Error::SinkUnavailable {
                        sink: sink.name().to_string(),
                        reason: format!("{e:#}"),
                    };
                    crate::ratelimited!(self.sink_log, Level::Warn, "{}", e);
                    true
                }
                Err(_) => {
                    // Its state can't be trusted anymore.
                    self.stats.sink_errors += 1;
                    self.stats.sinks_disabled += 1;
                    error!("Sink '{}' panicked, disabling it", sink.name());
                    false
                }
            }
        });
    }

    /// Run a single drain cycle of at most `max` records. Returns the number
    /// of records drained.
    pub(crate) fn run_once(&mut self, max: usize) -> usize {
        let channel = self.channel.clone();
        let mut count = 0;

        for record in channel.drain(max) {
            self.process(&record);
            count += 1;
        }

        count
    }

    /// Consume events until `running` is stopped. A final drain then takes
    /// care of the records still in the channel and the sinks are finished.
    pub(crate) fn run(mut self, running: Running) -> ConsumerStats {
        while running.running() {
            if self.run_once(self.config.batch_size) == 0 {
                running.sleep(self.config.poll_interval);
            }
        }

        let drained = self.run_once(self.config.final_drain_max);
        debug!("Final drain handled {drained} event(s)");
        if !self.channel.is_empty() {
            debug!(
                "{} event(s) still in the channel after the final drain",
                self.channel.len()
            );
        }

        for (limiter, what) in [
            (&mut self.decode_log, "decode"),
            (&mut self.sink_log, "sink"),
        ] {
            let suppressed = limiter.take_suppressed();
            if suppressed > 0 {
                warn!("{suppressed} {what} error message(s) were suppressed");
            }
        }

        for sink in self.sinks.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| sink.finish())) {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("Could not finish sink '{}': {e}", sink.name()),
                Err(_) => error!("Sink '{}' panicked while finishing", sink.name()),
            }
        }

        self.stats
    }

    /// Start consuming events on a dedicated thread.
    pub(crate) fn spawn(self, running: Running) -> io::Result<JoinHandle<ConsumerStats>> {
        thread::Builder::new()
            .name("hookwire-consumer".to_string())
            .spawn(move || self.run(running))
    }
}
