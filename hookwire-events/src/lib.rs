//! # Hookwire events
//!
//! This crate contains the definitions of the types carried by the hookwire
//! event pipeline: the fixed-layout record written at probe execution time,
//! the decoded events handed to sinks and the schema-versioned decoders
//! converting the former into the latter.

pub mod record;
pub use record::*;

pub mod kind;
pub use kind::*;

pub mod event;
pub use event::*;

pub mod decode;
pub use decode::*;
