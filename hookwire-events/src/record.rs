//! Fixed-layout records, as written by probes into the event channel.

use std::mem;

use thiserror::Error;

/// Size of the payload area of a record. Please keep in sync with its BPF
/// counterpart.
pub const PAYLOAD_SIZE: usize = 64;

/// Size of the header of a raw record coming from BPF: timestamp (u64),
/// payload length (u16) and two bytes of padding.
pub const RAW_HEADER_SIZE: usize = mem::size_of::<u64>() + 2 * mem::size_of::<u16>();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("payload of {0} bytes does not fit in a record ({PAYLOAD_SIZE} max)")]
    PayloadTooLarge(usize),
    #[error("raw record is truncated ({len} bytes, at least {need} needed)")]
    Truncated { len: usize, need: usize },
}

/// A single event, produced by a probe and immutable once written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventRecord {
    /// Monotonic timestamp of when the hook fired, in nanoseconds.
    pub timestamp_ns: u64,
    /// Identifier of the attachment that produced the event.
    pub hook_id: u32,
    /// Number of meaningful bytes at the start of `payload`.
    pub payload_len: u16,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Default for EventRecord {
    fn default() -> Self {
        EventRecord {
            timestamp_ns: 0,
            hook_id: 0,
            payload_len: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }
}

impl EventRecord {
    pub fn new(timestamp_ns: u64, hook_id: u32, payload: &[u8]) -> Result<Self, RecordError> {
        if payload.len() > PAYLOAD_SIZE {
            return Err(RecordError::PayloadTooLarge(payload.len()));
        }

        let mut record = EventRecord {
            timestamp_ns,
            hook_id,
            payload_len: payload.len() as u16,
            ..Default::default()
        };
        record.payload[..payload.len()].copy_from_slice(payload);
        Ok(record)
    }

    /// Parse a raw record as emitted by a BPF program. The BPF side does not
    /// know our attachment identifiers, the caller provides it.
    ///
    /// Raw layout (native endianness): `ts:u64 | len:u16 | pad:u16 |
    /// payload[len]`.
    pub fn from_raw(hook_id: u32, data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RAW_HEADER_SIZE {
            return Err(RecordError::Truncated {
                len: data.len(),
                need: RAW_HEADER_SIZE,
            });
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[..8]);
        let mut len = [0u8; 2];
        len.copy_from_slice(&data[8..10]);
        let len = u16::from_ne_bytes(len) as usize;

        let end = RAW_HEADER_SIZE + len;
        if data.len() < end {
            return Err(RecordError::Truncated {
                len: data.len(),
                need: end,
            });
        }

        Self::new(u64::from_ne_bytes(ts), hook_id, &data[RAW_HEADER_SIZE..end])
    }

    /// The meaningful part of the payload.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_len as usize).min(PAYLOAD_SIZE);
        &self.payload[..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record() {
        let record = EventRecord::new(42, 7, &[1, 2, 3]).unwrap();
        assert_eq!(record.payload(), &[1, 2, 3]);
        assert_eq!(record.hook_id, 7);

        assert!(EventRecord::new(0, 0, &[0; PAYLOAD_SIZE]).is_ok());
        assert_eq!(
            EventRecord::new(0, 0, &[0; PAYLOAD_SIZE + 1]),
            Err(RecordError::PayloadTooLarge(PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn from_raw() {
        // Too small for a header.
        assert!(EventRecord::from_raw(1, &[0; 4]).is_err());

        let mut raw = Vec::new();
        raw.extend_from_slice(&1337u64.to_ne_bytes());
        raw.extend_from_slice(&4u16.to_ne_bytes());
        raw.extend_from_slice(&[0, 0]);

        // Header announces more than what we have.
        assert_eq!(
            EventRecord::from_raw(1, &raw),
            Err(RecordError::Truncated {
                len: RAW_HEADER_SIZE,
                need: RAW_HEADER_SIZE + 4
            })
        );

        raw.extend_from_slice(&[9, 8, 7, 6, 5]);
        let record = EventRecord::from_raw(3, &raw).unwrap();
        assert_eq!(record.timestamp_ns, 1337);
        assert_eq!(record.hook_id, 3);
        // Trailing bytes past the announced length are ignored.
        assert_eq!(record.payload(), &[9, 8, 7, 6]);
    }
}
