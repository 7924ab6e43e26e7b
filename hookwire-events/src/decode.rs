//! Schema-versioned payload decoders.
//!
//! Each schema version has its own decoder, registered in `Decoders`. Adding
//! a schema means adding a decoder; neither the channel nor the consumer loop
//! need to know about it.

use std::collections::HashMap;

use thiserror::Error;

use crate::{EventBody, ProbeKind, XdpAction, XdpEvent};

pub const SCHEMA_MARKER: u32 = 1;
pub const SCHEMA_XDP: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no decoder for schema version {0}")]
    UnknownSchema(u32),
    #[error("payload too short for schema v{version} ({len} < {need} bytes)")]
    Short {
        version: u32,
        len: usize,
        need: usize,
    },
    #[error("invalid value {value} for field '{field}'")]
    InvalidField { field: &'static str, value: u64 },
}

/// Payload decoder for a given schema version.
pub trait SchemaDecoder: Send + Sync {
    /// Schema version handled by the decoder.
    fn version(&self) -> u32;
    /// Minimum payload length the schema requires.
    fn min_len(&self) -> usize;
    /// Decode a payload. Its length was already checked against `min_len`.
    fn decode(&self, kind: ProbeKind, payload: &[u8]) -> Result<EventBody, DecodeError>;
}

/// Registry of the known schema decoders, keyed by version.
pub struct Decoders {
    decoders: HashMap<u32, Box<dyn SchemaDecoder>>,
}

impl Default for Decoders {
    /// All built-in decoders.
    fn default() -> Self {
        let mut decoders = Self::empty();
        decoders.register(Box::new(MarkerDecoder));
        decoders.register(Box::new(XdpDecoder));
        decoders
    }
}

impl Decoders {
    pub fn empty() -> Self {
        Decoders {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder, replacing (and returning) any previous decoder of
    /// the same version.
    pub fn register(&mut self, decoder: Box<dyn SchemaDecoder>) -> Option<Box<dyn SchemaDecoder>> {
        self.decoders.insert(decoder.version(), decoder)
    }

    pub fn supports(&self, version: u32) -> bool {
        self.decoders.contains_key(&version)
    }

    /// Supported versions, sorted.
    pub fn versions(&self) -> Vec<u32> {
        let mut versions: Vec<u32> = self.decoders.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    pub fn decode(
        &self,
        version: u32,
        kind: ProbeKind,
        payload: &[u8],
    ) -> Result<EventBody, DecodeError> {
        let decoder = self
            .decoders
            .get(&version)
            .ok_or(DecodeError::UnknownSchema(version))?;

        if payload.len() < decoder.min_len() {
            return Err(DecodeError::Short {
                version,
                len: payload.len(),
                need: decoder.min_len(),
            });
        }

        decoder.decode(kind, payload)
    }
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

/// Schema v1: the hook fired, no payload.
pub struct MarkerDecoder;

impl SchemaDecoder for MarkerDecoder {
    fn version(&self) -> u32 {
        SCHEMA_MARKER
    }

    fn min_len(&self) -> usize {
        0
    }

    fn decode(&self, _: ProbeKind, _: &[u8]) -> Result<EventBody, DecodeError> {
        Ok(EventBody::Marker)
    }
}

/// Schema v2: XDP context, `ifindex:u32 | rx_queue:u32 | data_len:u32`,
/// followed by `action:u32` for exit probes.
pub struct XdpDecoder;

const XDP_CTX_LEN: usize = 12;
const XDP_EXIT_LEN: usize = 16;

impl SchemaDecoder for XdpDecoder {
    fn version(&self) -> u32 {
        SCHEMA_XDP
    }

    fn min_len(&self) -> usize {
        XDP_CTX_LEN
    }

    fn decode(&self, kind: ProbeKind, payload: &[u8]) -> Result<EventBody, DecodeError> {
        let mut event = XdpEvent {
            ifindex: read_u32(payload, 0),
            rx_queue: read_u32(payload, 4),
            data_len: read_u32(payload, 8),
            action: None,
        };

        if kind == ProbeKind::Exit && payload.len() >= XDP_EXIT_LEN {
            let raw = read_u32(payload, 12);
            event.action = Some(XdpAction::from_u32(raw).ok_or(DecodeError::InvalidField {
                field: "action",
                value: raw as u64,
            })?);
        }

        Ok(EventBody::Xdp(event))
    }
}
