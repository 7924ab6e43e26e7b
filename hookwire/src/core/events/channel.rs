//! Bounded ring buffer between a single publisher and the consumer.
//!
//! Positions are 64-bit counters that only ever grow: the ring is empty when
//! the write and read positions are equal and full when they are `capacity`
//! apart, so both states are never confused. A slot is addressed by
//! `position & mask`.
//!
//! Each slot is guarded by a sequence number, `2 * position + 1` while the
//! publisher writes it and `2 * position + 2` once the record at `position`
//! is complete. The consumer copies a slot, checks the sequence number did
//! not move and then claims the record by advancing the read position with a
//! compare-and-swap. When the overwrite-oldest policy evicts a record, the
//! publisher advances the read position with the same compare-and-swap, so a
//! record is either consumed or evicted, never both. Slot contents are atomic
//! words, no lock is needed.

use std::sync::{
    atomic::{fence, AtomicBool, AtomicU64, Ordering},
    Arc,
};

use events::{EventRecord, PAYLOAD_SIZE};
use serde::Deserialize;

use crate::core::Error;

const PAYLOAD_WORDS: usize = PAYLOAD_SIZE / 8;
/// Timestamp, hook id and payload length, then the payload.
const RECORD_WORDS: usize = 2 + PAYLOAD_WORDS;

/// What to do when publishing to a full channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum OverflowPolicy {
    /// Reject the new record.
    #[default]
    DropNewest,
    /// Evict the oldest unread record.
    OverwriteOldest,
}

struct Slot {
    seq: AtomicU64,
    words: [AtomicU64; RECORD_WORDS],
}

impl Slot {
    fn new() -> Self {
        Slot {
            seq: AtomicU64::new(0),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn store(&self, record: &EventRecord) {
        self.words[0].store(record.timestamp_ns, Ordering::Relaxed);
        self.words[1].store(
            record.hook_id as u64 | (record.payload_len as u64) << 32,
            Ordering::Relaxed,
        );
        for (i, chunk) in record.payload.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.words[2 + i].store(u64::from_ne_bytes(word), Ordering::Relaxed);
        }
    }

    fn load(&self) -> EventRecord {
        let mut record = EventRecord {
            timestamp_ns: self.words[0].load(Ordering::Relaxed),
            ..Default::default()
        };

        let word = self.words[1].load(Ordering::Relaxed);
        record.hook_id = word as u32;
        record.payload_len = (word >> 32) as u16;

        for (i, chunk) in record.payload.chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&self.words[2 + i].load(Ordering::Relaxed).to_ne_bytes());
        }
        record
    }
}

/// Channel counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ChannelStats {
    /// Records successfully published.
    pub(crate) published: u64,
    /// Records rejected because the channel was full (drop-newest).
    pub(crate) dropped: u64,
    /// Unread records evicted by newer ones (overwrite-oldest).
    pub(crate) overwritten: u64,
    pub(crate) consumed: u64,
}

impl ChannelStats {
    /// Events that never reached the consumer.
    pub(crate) fn lost(&self) -> u64 {
        self.dropped + self.overwritten
    }

    /// Published records neither consumed nor overwritten, i.e. still in the
    /// channel when the snapshot was taken.
    pub(crate) fn unread(&self) -> u64 {
        self.published
            .saturating_sub(self.consumed)
            .saturating_sub(self.overwritten)
    }
}

struct Ring {
    slots: Box<[Slot]>,
    mask: u64,
    capacity: u64,
    policy: OverflowPolicy,
    /// Write position. Only the publisher modifies it.
    head: AtomicU64,
    /// Read position.
    tail: AtomicU64,
    publisher_taken: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    overwritten: AtomicU64,
    consumed: AtomicU64,
}

impl Ring {
    fn publish(&self, record: &EventRecord) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.tail.load(Ordering::Acquire);

        while head.wrapping_sub(tail) >= self.capacity {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                OverflowPolicy::OverwriteOldest => {
                    match self.tail.compare_exchange_weak(
                        tail,
                        tail + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.overwritten.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        // Either the consumer made room or we failed
                        // spuriously, check again.
                        Err(current) => tail = current,
                    }
                }
            }
        }

        let slot = &self.slots[(head & self.mask) as usize];
        slot.seq.store(2 * head + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.store(record);
        slot.seq.store(2 * head + 2, Ordering::Release);

        self.head.store(head + 1, Ordering::Release);
        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn pop(&self) -> Option<EventRecord> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if tail >= head {
                return None;
            }

            let slot = &self.slots[(tail & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq != 2 * tail + 2 {
                // The record at `tail` is being overwritten, the read
                // position moved already.
                std::hint::spin_loop();
                continue;
            }

            let record = slot.load();
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != seq {
                continue;
            }

            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                return Some(record);
            }
        }
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.capacity) as usize
    }
}

/// Bounded channel of event records, with fixed capacity and an explicit
/// overflow policy. Cloning it gives another handle to the same channel.
#[derive(Clone)]
pub(crate) struct EventChannel {
    ring: Arc<Ring>,
}

impl EventChannel {
    /// Create a channel. `capacity` must be a non-zero power of two.
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self, Error> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }

        let slots = (0..capacity).map(|_| Slot::new()).collect();
        Ok(EventChannel {
            ring: Arc::new(Ring {
                slots,
                mask: capacity as u64 - 1,
                capacity: capacity as u64,
                policy,
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
                publisher_taken: AtomicBool::new(false),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                overwritten: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
            }),
        })
    }

    /// Get the channel publisher. There is a single one at a time, `None` is
    /// returned while it is in use.
    pub(crate) fn publisher(&self) -> Option<Publisher> {
        self.ring
            .publisher_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| Publisher {
                ring: Arc::clone(&self.ring),
            })
    }

    /// Take at most `max` records, in publish order. This never blocks: the
    /// iterator ends as soon as the channel is empty, and can't be restarted.
    pub(crate) fn drain(&self, max: usize) -> Drain<'_> {
        Drain {
            ring: &self.ring,
            remaining: max,
        }
    }

    /// Number of readable records.
    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.ring.capacity as usize
    }

    pub(crate) fn policy(&self) -> OverflowPolicy {
        self.ring.policy
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        ChannelStats {
            published: self.ring.published.load(Ordering::Relaxed),
            dropped: self.ring.dropped.load(Ordering::Relaxed),
            overwritten: self.ring.overwritten.load(Ordering::Relaxed),
            consumed: self.ring.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Write side of an `EventChannel`. Publishing takes `&mut self`, a single
/// record is written at a time.
pub(crate) struct Publisher {
    ring: Arc<Ring>,
}

impl Publisher {
    /// Publish a record. Returns false if it was rejected because the
    /// channel is full (drop-newest policy only).
    pub(crate) fn publish(&mut self, record: &EventRecord) -> bool {
        self.ring.publish(record)
    }

    pub(crate) fn try_publish(&mut self, record: &EventRecord) -> Result<(), Error> {
        match self.publish(record) {
            true => Ok(()),
            false => Err(Error::ChannelFull),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.ring.publisher_taken.store(false, Ordering::Release);
    }
}

/// Iterator returned by `EventChannel::drain`.
pub(crate) struct Drain<'a> {
    ring: &'a Ring,
    remaining: usize,
}

impl Iterator for Drain<'_> {
    type Item = EventRecord;

    fn next(&mut self) -> Option<EventRecord> {
        if self.remaining == 0 {
            return None;
        }

        match self.ring.pop() {
            Some(record) => {
                self.remaining -= 1;
                Some(record)
            }
            None => {
                self.remaining = 0;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use test_case::test_case;

    use super::*;

    fn record(ts: u64) -> EventRecord {
        // Make the payload depend on the timestamp to detect torn reads.
        let payload = [ts as u8; PAYLOAD_SIZE];
        EventRecord::new(ts, ts as u32, &payload[..(ts % PAYLOAD_SIZE as u64) as usize]).unwrap()
    }

    fn timestamps(channel: &EventChannel, max: usize) -> Vec<u64> {
        channel.drain(max).map(|r| r.timestamp_ns).collect()
    }

    #[test_case(0 => false)]
    #[test_case(1 => true)]
    #[test_case(3 => false)]
    #[test_case(4 => true)]
    #[test_case(1000 => false)]
    #[test_case(1024 => true)]
    fn capacity(capacity: usize) -> bool {
        EventChannel::new(capacity, OverflowPolicy::DropNewest).is_ok()
    }

    #[test]
    fn keeps_order_and_content() {
        let channel = EventChannel::new(64, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        for ts in 0..64 {
            assert!(publisher.publish(&record(ts)));
        }
        assert_eq!(channel.len(), 64);

        let drained: Vec<EventRecord> = channel.drain(100).collect();
        assert_eq!(drained, (0..64).map(record).collect::<Vec<_>>());
        assert!(channel.is_empty());
    }

    #[test]
    fn drop_newest() {
        let channel = EventChannel::new(4, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        for ts in 1..=4 {
            assert!(publisher.publish(&record(ts)));
        }
        assert!(!publisher.publish(&record(5)));
        assert!(!publisher.publish(&record(6)));
        assert!(matches!(
            publisher.try_publish(&record(7)),
            Err(Error::ChannelFull)
        ));
        assert_eq!(channel.len(), 4);

        assert_eq!(timestamps(&channel, 10), vec![1, 2, 3, 4]);
        assert_eq!(
            channel.stats(),
            ChannelStats {
                published: 4,
                dropped: 3,
                overwritten: 0,
                consumed: 4
            }
        );
        assert_eq!(channel.stats().unread(), 0);
    }

    #[test]
    fn overwrite_oldest() {
        let channel = EventChannel::new(4, OverflowPolicy::OverwriteOldest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        for ts in 1..=5 {
            assert!(publisher.publish(&record(ts)));
        }
        assert_eq!(channel.len(), 4);
        assert_eq!(timestamps(&channel, 10), vec![2, 3, 4, 5]);

        for ts in 0..100 {
            assert!(publisher.publish(&record(ts)));
            assert!(channel.len() <= channel.capacity());
        }
        assert_eq!(timestamps(&channel, 10), vec![96, 97, 98, 99]);
        assert_eq!(channel.stats().overwritten, 97);
        assert_eq!(channel.stats().lost(), 97);
        assert_eq!(channel.stats().unread(), 0);

        publisher.publish(&record(100));
        publisher.publish(&record(101));
        assert_eq!(timestamps(&channel, 1), vec![100]);
        assert_eq!(channel.stats().unread(), 1);
    }

    #[test]
    fn drain_is_bounded() {
        let channel = EventChannel::new(8, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();
        for ts in 0..6 {
            publisher.publish(&record(ts));
        }

        assert_eq!(timestamps(&channel, 2), vec![0, 1]);
        assert_eq!(timestamps(&channel, 0), Vec::<u64>::new());
        assert_eq!(timestamps(&channel, 10), vec![2, 3, 4, 5]);
        assert_eq!(timestamps(&channel, 10), Vec::<u64>::new());
    }

    #[test]
    fn drain_is_not_restartable() {
        let channel = EventChannel::new(8, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        let mut drain = channel.drain(10);
        assert!(drain.next().is_none());

        publisher.publish(&record(1));
        assert!(drain.next().is_none());
        assert_eq!(timestamps(&channel, 10), vec![1]);
    }

    #[test]
    fn single_publisher() {
        let channel = EventChannel::new(8, OverflowPolicy::DropNewest).unwrap();

        let publisher = channel.publisher().unwrap();
        assert!(channel.publisher().is_none());
        assert!(channel.clone().publisher().is_none());

        drop(publisher);
        assert!(channel.publisher().is_some());
    }

    #[test]
    fn wraps_around() {
        let channel = EventChannel::new(2, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        for ts in 0..100 {
            assert!(publisher.publish(&record(ts)));
            assert_eq!(channel.drain(1).next(), Some(record(ts)));
        }
    }

    const CONCURRENT_EVENTS: u64 = 200_000;

    #[test]
    fn concurrent_drop_newest() {
        let channel = EventChannel::new(64, OverflowPolicy::DropNewest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        let producer = thread::spawn(move || {
            let mut ts = 0;
            while ts < CONCURRENT_EVENTS {
                // Retry rejected records so none is lost.
                if publisher.publish(&record(ts)) {
                    ts += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < CONCURRENT_EVENTS {
            for r in channel.drain(16) {
                assert_eq!(r, record(expected));
                expected += 1;
            }
        }

        producer.join().unwrap();
        assert!(channel.is_empty());
        assert_eq!(channel.stats().consumed, CONCURRENT_EVENTS);
    }

    #[test]
    fn concurrent_overwrite_oldest() {
        let channel = EventChannel::new(16, OverflowPolicy::OverwriteOldest).unwrap();
        let mut publisher = channel.publisher().unwrap();

        let producer = thread::spawn(move || {
            for ts in 0..CONCURRENT_EVENTS {
                assert!(publisher.publish(&record(ts)));
            }
        });

        let mut last = None;
        let mut received = 0;
        // The last record can't be evicted, wait for it.
        while last != Some(CONCURRENT_EVENTS - 1) {
            for r in channel.drain(8) {
                // Gaps are expected, but order must hold and records must
                // never be torn.
                assert_eq!(r, record(r.timestamp_ns));
                if let Some(last) = last {
                    assert!(r.timestamp_ns > last);
                }
                last = Some(r.timestamp_ns);
                received += 1;
            }
        }

        producer.join().unwrap();
        assert!(channel.is_empty());
        let stats = channel.stats();
        assert_eq!(stats.published, CONCURRENT_EVENTS);
        assert_eq!(stats.consumed, received);
        assert_eq!(stats.consumed + stats.overwritten, CONCURRENT_EVENTS);
    }
}
