//! Per-producer playback timing, published from the device callback.
//!
//! The record is a seqlock: the writer bumps the sequence to an odd
//! value, stores the fields, then bumps it even again. Readers retry
//! while the sequence is odd or changed underneath them. All fields
//! are cumulative counters, so a reader can diff two snapshots.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[repr(C)]
#[derive(Default)]
pub struct TimingRecord {
    sequence: AtomicU32,
    _pad: u32,
    device_played_frames: AtomicU64,
    ring_read_frames: AtomicU64,
    monotonic_ns: AtomicU64,
    underruns: AtomicU64,
}

/// A consistent view of a [`TimingRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingSnapshot {
    /// Frames of this producer's stream the device has played,
    /// relative to when the producer was first mixed. Non-decreasing.
    pub device_played_frames: u64,
    /// Total frames drained from the producer's ring.
    pub ring_read_frames: u64,
    /// Monotonic timestamp of the last publish, in nanoseconds.
    pub monotonic_ns: u64,
    /// Number of device callbacks this producer could not supply.
    pub underruns: u64,
}

pub fn timing_pair() -> (TimingWriter, TimingReader) {
    let record = Arc::new(TimingRecord::default());
    (
        TimingWriter {
            record: Arc::clone(&record),
        },
        TimingReader { record },
    )
}

/// The mixer's end. Single writer; called from the device callback.
pub struct TimingWriter {
    record: Arc<TimingRecord>,
}

impl Clone for TimingWriter {
    fn clone(&self) -> Self {
        Self {
            record: Arc::clone(&self.record),
        }
    }
}

impl TimingWriter {
    pub fn publish(
        &self,
        device_played_frames: u64,
        monotonic_ns: u64,
        frames_read: u64,
        underruns: u64,
    ) {
        let r = &*self.record;
        r.sequence.fetch_add(1, Ordering::AcqRel);
        r.device_played_frames
            .store(device_played_frames, Ordering::Release);
        r.ring_read_frames.fetch_add(frames_read, Ordering::AcqRel);
        r.monotonic_ns.store(monotonic_ns, Ordering::Release);
        r.underruns.fetch_add(underruns, Ordering::AcqRel);
        r.sequence.fetch_add(1, Ordering::AcqRel);
    }
}

/// The producer's end.
pub struct TimingReader {
    record: Arc<TimingRecord>,
}

impl TimingReader {
    pub fn read(&self) -> TimingSnapshot {
        let r = &*self.record;
        loop {
            let before = r.sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = TimingSnapshot {
                device_played_frames: r.device_played_frames.load(Ordering::Acquire),
                ring_read_frames: r.ring_read_frames.load(Ordering::Acquire),
                monotonic_ns: r.monotonic_ns.load(Ordering::Acquire),
                underruns: r.underruns.load(Ordering::Acquire),
            };
            if r.sequence.load(Ordering::Acquire) == before {
                return snapshot;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_publishes() {
        let (writer, reader) = timing_pair();
        writer.publish(128, 1_000, 128, 0);
        writer.publish(256, 2_000, 128, 1);

        let snap = reader.read();
        assert_eq!(snap.device_played_frames, 256);
        assert_eq!(snap.ring_read_frames, 256);
        assert_eq!(snap.monotonic_ns, 2_000);
        assert_eq!(snap.underruns, 1);
    }

    #[test]
    fn played_frames_are_monotonic_under_concurrent_reads() {
        let (writer, reader) = timing_pair();

        let t = std::thread::spawn(move || {
            for i in 1..=10_000u64 {
                writer.publish(i * 128, i, 128, 0);
            }
        });

        let mut last = 0;
        for _ in 0..10_000 {
            let snap = reader.read();
            assert!(snap.device_played_frames >= last);
            last = snap.device_played_frames;
        }
        t.join().unwrap();
    }
}
