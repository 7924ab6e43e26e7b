//! # Events
//!
//! Transport of the records from the probes execution context to the
//! consumer, and their decoding and delivery to the sinks.

pub(crate) mod channel;
pub(crate) use channel::*;

pub(crate) mod consumer;
pub(crate) use consumer::*;
