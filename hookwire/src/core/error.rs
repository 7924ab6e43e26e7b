//! # Errors
//!
//! Error taxonomy of the core. Descriptor and attachment errors are fatal at
//! startup; decode and sink errors are recovered from where they happen.

use events::{DecodeError, ProbeKind};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidDescriptor,
    InvalidHook,
    SchemaMismatch,
    AlreadyAttached,
    AttachRejected,
    DetachFailed,
    DecodeError,
    SinkUnavailable,
    ChannelFull,
    InvalidCapacity,
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("invalid probe descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("hook '{hook}' is not recognized by the host for {kind} probes")]
    InvalidHook { hook: String, kind: ProbeKind },
    #[error("schema version {version} is not supported (supported: {supported:?})")]
    SchemaMismatch { version: u32, supported: Vec<u32> },
    #[error("a probe is already attached to {kind}:{hook}")]
    AlreadyAttached { hook: String, kind: ProbeKind },
    #[error("attach of probe '{probe}' rejected: {reason}")]
    AttachRejected { probe: String, reason: String },
    #[error("detach of probe '{probe}' failed: {reason}")]
    DetachFailed { probe: String, reason: String },
    #[error("record from unknown hook id {0}")]
    UnknownHookId(u32),
    #[error("could not decode event from probe '{probe}': {source}")]
    Decode {
        probe: String,
        #[source]
        source: DecodeError,
    },
    #[error("sink '{sink}' unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },
    #[error("event channel is full")]
    ChannelFull,
    #[error("channel capacity {0} is not a non-zero power of two")]
    InvalidCapacity(usize),
}

impl Error {
    pub(crate) fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            InvalidHook { .. } => ErrorKind::InvalidHook,
            SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            AlreadyAttached { .. } => ErrorKind::AlreadyAttached,
            AttachRejected { .. } => ErrorKind::AttachRejected,
            DetachFailed { .. } => ErrorKind::DetachFailed,
            UnknownHookId(_) | Decode { .. } => ErrorKind::DecodeError,
            SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            ChannelFull => ErrorKind::ChannelFull,
            InvalidCapacity(_) => ErrorKind::InvalidCapacity,
        }
    }
}
