//! # Sinks
//!
//! Final destinations of the decoded events.

use anyhow::Result;
use events::DecodedEvent;

pub(crate) mod log;
pub(crate) use self::log::*;

pub(crate) mod metrics;
pub(crate) use metrics::*;

/// Receives every decoded event, in drain order. Sinks are run on the
/// consumer thread; an error returned by a sink only affects that sink. A
/// sink panicking is disabled for the rest of the run.
pub(crate) trait Sink: Send {
    fn name(&self) -> &str;
    fn deliver(&mut self, event: &DecodedEvent) -> Result<()>;
    /// Called once, after the last event was delivered.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
