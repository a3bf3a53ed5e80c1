//! The output stream mixer.
//!
//! One device stream serves many producer sessions. The set of
//! producers is an immutable snapshot swapped atomically from the
//! control thread; the device callback only ever reads the current
//! snapshot, and retired snapshots are reclaimed by a deferred
//! collector so nothing is freed on the device thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use basedrop::{Collector, Handle, Shared, SharedCell};

use crate::backend::{
    MixerCallback, OutputBackend, StreamConfig, StreamError, StreamHandle,
};
use crate::ring::RingConsumer;
use crate::timing::TimingWriter;
use crate::MAX_CHANNELS;

/// Most frames a single device callback is expected to ask for.
/// Larger callbacks are mixed with the tail left silent.
const MAX_CALLBACK_FRAMES: usize = 8192;

struct ProducerEntry {
    id: u64,
    ring: RingConsumer,
    timing: TimingWriter,
    bytes_per_frame: u32,
    muted: AtomicBool,
    /// Device frame count when this producer was first mixed; its
    /// published play position is relative to this.
    base_frames: AtomicU64,
    base_set: AtomicBool,
}

struct ProducerSnapshot {
    producers: Vec<Arc<ProducerEntry>>,
}

/// Callback-side state. Owned by the closure handed to the backend.
struct MixLoop {
    snapshot: Arc<SharedCell<ProducerSnapshot>>,
    scratch: Vec<f32>,
    device_frames: u64,
    channels: usize,
    epoch: Instant,
}

impl MixLoop {
    fn mix(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = (out.len() / self.channels).min(MAX_CALLBACK_FRAMES);
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        let snapshot = self.snapshot.get();

        for producer in snapshot.producers.iter() {
            if !producer.base_set.load(Ordering::Acquire) {
                producer
                    .base_frames
                    .store(self.device_frames, Ordering::Release);
                producer.base_set.store(true, Ordering::Release);
            }

            let bpf = producer.bytes_per_frame as usize;
            let src_channels = bpf / 4;
            let want = (frames * bpf).min(self.scratch.len() * 4);
            // Only whole frames leave the ring; a partially written
            // frame stays for the next callback.
            let avail = producer.ring.available_to_read();
            let take = want.min(avail - avail % bpf);

            let scratch_bytes = bytemuck::cast_slice_mut(&mut self.scratch);
            let bytes_read = producer.ring.try_read(&mut scratch_bytes[..take]);
            let frames_read = bytes_read / bpf;
            let muted = producer.muted.load(Ordering::Relaxed);
            let underruns = u64::from(frames_read == 0 && !muted);

            if !muted && frames_read > 0 {
                for f in 0..frames_read {
                    for c in 0..self.channels {
                        let sample = self.scratch[f * src_channels + c.min(src_channels - 1)];
                        out[f * self.channels + c] += sample;
                    }
                }
            }

            let played = self
                .device_frames
                .saturating_sub(producer.base_frames.load(Ordering::Acquire));
            producer
                .timing
                .publish(played, now_ns, frames_read as u64, underruns);
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        self.device_frames += frames as u64;
    }
}

/// A pending result from a stream operation, resolved on the control
/// thread.
pub struct StreamOp<T> {
    rx: crossbeam_channel::Receiver<Result<T, StreamError>>,
}

impl<T> StreamOp<T> {
    fn resolved(result: Result<T, StreamError>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    fn pending() -> (crossbeam_channel::Sender<Result<T, StreamError>>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self { rx })
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<T, StreamError> {
        self.rx.recv().unwrap_or(Err(StreamError::Abandoned))
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_wait(&self) -> Option<Result<T, StreamError>> {
        self.rx.try_recv().ok()
    }
}

pub struct OutputStream<B: OutputBackend> {
    backend: B,
    stream: Option<B::Stream>,
    producers: Vec<Arc<ProducerEntry>>,
    snapshot: Arc<SharedCell<ProducerSnapshot>>,
    collector: Collector,
    handle: Handle,
    when_ready: Vec<Box<dyn FnOnce() + Send>>,
    pending_drains: Vec<crossbeam_channel::Sender<Result<(), StreamError>>>,
}

impl<B: OutputBackend> OutputStream<B> {
    pub fn new(backend: B) -> Self {
        let collector = Collector::new();
        let handle = collector.handle();
        let snapshot = Arc::new(SharedCell::new(Shared::new(
            &handle,
            ProducerSnapshot {
                producers: Vec::new(),
            },
        )));
        Self {
            backend,
            stream: None,
            producers: Vec::new(),
            snapshot,
            collector,
            handle,
            when_ready: Vec::new(),
            pending_drains: Vec::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the device stream if it is not already open. Idempotent;
    /// fires queued `when_ready` callbacks on first success.
    pub fn ensure_started(&mut self, config: StreamConfig) -> Result<(), StreamError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if config.channels == 0 {
            return Err(StreamError::OpenFailed(
                "output stream needs at least one channel".into(),
            ));
        }

        let mut mix = MixLoop {
            snapshot: Arc::clone(&self.snapshot),
            scratch: vec![0.0; MAX_CALLBACK_FRAMES * MAX_CHANNELS],
            device_frames: 0,
            channels: config.channels as usize,
            epoch: Instant::now(),
        };
        let callback: MixerCallback = Box::new(move |out| mix.mix(out));

        let stream = self.backend.open_stream(config, callback)?;
        log::debug!(
            "output stream started: {} Hz, {} channels",
            stream.sample_rate(),
            stream.channels()
        );
        self.stream = Some(stream);

        for ready in self.when_ready.drain(..) {
            ready();
        }
        Ok(())
    }

    /// Run `ready` once the stream is open; immediately if it already
    /// is.
    pub fn when_ready(&mut self, ready: Box<dyn FnOnce() + Send>) {
        if self.stream.is_some() {
            ready();
        } else {
            self.when_ready.push(ready);
        }
    }

    /// Add a producer to the mix. Its play position starts counting
    /// from the first callback that sees it.
    pub fn register_producer(
        &mut self,
        id: u64,
        ring: RingConsumer,
        timing: TimingWriter,
        bytes_per_frame: u32,
    ) -> Result<(), StreamError> {
        if bytes_per_frame == 0 || bytes_per_frame % 4 != 0 {
            return Err(StreamError::BadFrameStride(bytes_per_frame));
        }
        self.producers.push(Arc::new(ProducerEntry {
            id,
            ring,
            timing,
            bytes_per_frame,
            muted: AtomicBool::new(false),
            base_frames: AtomicU64::new(0),
            base_set: AtomicBool::new(false),
        }));
        self.swap_snapshot();
        Ok(())
    }

    pub fn unregister_producer(&mut self, id: u64) -> bool {
        let before = self.producers.len();
        self.producers.retain(|p| p.id != id);
        let removed = self.producers.len() != before;
        if removed {
            self.swap_snapshot();
        }
        removed
    }

    /// A muted producer's ring is still drained and its timing still
    /// published; it just contributes silence.
    pub fn set_producer_muted(&mut self, id: u64, muted: bool) -> bool {
        match self.producers.iter().find(|p| p.id == id) {
            Some(p) => {
                p.muted.store(muted, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn swap_snapshot(&mut self) {
        let snapshot = ProducerSnapshot {
            producers: self.producers.clone(),
        };
        self.snapshot.set(Shared::new(&self.handle, snapshot));
        self.collector.collect();
    }

    pub fn resume(&mut self) -> StreamOp<()> {
        StreamOp::resolved(match &mut self.stream {
            Some(stream) => stream.resume(),
            None => Err(StreamError::NotStarted),
        })
    }

    pub fn set_volume(&mut self, volume: f32) -> StreamOp<()> {
        StreamOp::resolved(match &mut self.stream {
            Some(stream) => stream.set_volume(volume),
            None => Err(StreamError::NotStarted),
        })
    }

    /// Suspend once every producer ring has been played out. Resolves
    /// from [`OutputStream::poll_ops`].
    pub fn drain_buffer_and_suspend(&mut self) -> StreamOp<()> {
        if self.stream.is_none() {
            return StreamOp::resolved(Err(StreamError::NotStarted));
        }
        let (tx, op) = StreamOp::pending();
        self.pending_drains.push(tx);
        self.poll_ops();
        op
    }

    /// Drop all buffered audio and suspend immediately.
    pub fn discard_buffer_and_suspend(&mut self) -> StreamOp<()> {
        let Some(stream) = &mut self.stream else {
            return StreamOp::resolved(Err(StreamError::NotStarted));
        };
        for producer in &self.producers {
            producer.ring.skip_all();
        }
        StreamOp::resolved(stream.suspend())
    }

    /// Control-thread housekeeping: resolve pending drains and let
    /// the collector reclaim retired snapshots.
    pub fn poll_ops(&mut self) {
        if !self.pending_drains.is_empty() {
            let drained = self
                .producers
                .iter()
                .all(|p| p.ring.available_to_read() < p.bytes_per_frame as usize);
            if drained {
                let result = match &mut self.stream {
                    Some(stream) => stream.suspend(),
                    None => Err(StreamError::NotStarted),
                };
                for tx in self.pending_drains.drain(..) {
                    let _ = tx.send(result.clone());
                }
            }
        }
        self.collector.collect();
    }
}

impl<B: OutputBackend> Drop for OutputStream<B> {
    fn drop(&mut self) {
        self.producers.clear();
        self.snapshot.set(Shared::new(
            &self.handle,
            ProducerSnapshot {
                producers: Vec::new(),
            },
        ));
        self.collector.collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::ring::{RingFormat, RingTransport};
    use crate::timing::{timing_pair, TimingReader};

    const CONFIG: StreamConfig = StreamConfig {
        sample_rate: 48_000,
        channels: 2,
        target_latency_ms: 10,
    };

    struct TestProducer {
        writer: crate::ring::RingProducer,
        timing: TimingReader,
    }

    fn add_producer(
        stream: &mut OutputStream<MockBackend>,
        id: u64,
        channels: u32,
    ) -> TestProducer {
        let (writer, reader) = RingTransport::create(
            1 << 16,
            RingFormat {
                sample_rate: 48_000,
                channel_count: channels,
                channel_capacity: channels,
            },
        )
        .unwrap()
        .split();
        let (timing_writer, timing_reader) = timing_pair();
        stream
            .register_producer(id, reader, timing_writer, channels * 4)
            .unwrap();
        TestProducer {
            writer,
            timing: timing_reader,
        }
    }

    #[test]
    fn producers_sum_with_clamping() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut a = add_producer(&mut stream, 1, 2);
        let mut b = add_producer(&mut stream, 2, 2);
        a.writer.try_write_samples(&[0.25f32; 8]);
        b.writer.try_write_samples(&[0.5f32; 8]);

        let out = controller.pump(4);
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        // Hot signals clamp at unity.
        a.writer.try_write_samples(&[0.9f32; 8]);
        b.writer.try_write_samples(&[0.9f32; 8]);
        let out = controller.pump(4);
        assert!(out.iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn mono_producer_is_upmixed_to_both_channels() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut p = add_producer(&mut stream, 1, 1);
        p.writer.try_write_samples(&[0.5f32; 4]);

        let out = controller.pump(4);
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[0], 0.5);
            assert_eq!(frame[1], 0.5);
        }
    }

    #[test]
    fn muted_producer_still_drains_and_publishes_timing() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut p = add_producer(&mut stream, 1, 2);
        assert!(stream.set_producer_muted(1, true));
        p.writer.try_write_samples(&[0.5f32; 8]);

        let out = controller.pump(4);
        assert!(out.iter().all(|&s| s == 0.0));

        let snap = p.timing.read();
        assert_eq!(snap.ring_read_frames, 4);
        assert_eq!(snap.underruns, 0);
    }

    #[test]
    fn empty_ring_counts_one_underrun_per_callback() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let p = add_producer(&mut stream, 1, 2);
        controller.pump(4);
        controller.pump(4);

        let snap = p.timing.read();
        assert_eq!(snap.underruns, 2);
        assert_eq!(snap.ring_read_frames, 0);
    }

    #[test]
    fn played_frames_advance_with_the_device() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        // Device runs before the producer arrives; its position must
        // start from its registration, not the device epoch.
        controller.pump(100);
        let mut p = add_producer(&mut stream, 1, 2);
        p.writer.try_write_samples(&[0.1f32; 32]);
        controller.pump(8);
        let first = p.timing.read();

        p.writer.try_write_samples(&[0.1f32; 32]);
        controller.pump(8);
        let second = p.timing.read();

        assert_eq!(first.device_played_frames, 0);
        assert_eq!(second.device_played_frames, 8);
        assert!(second.monotonic_ns >= first.monotonic_ns);
        assert_eq!(second.ring_read_frames, 16);
    }

    #[test]
    fn discard_buffer_and_suspend_is_immediate() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut p = add_producer(&mut stream, 1, 2);
        p.writer.try_write_samples(&[0.5f32; 64]);

        stream.discard_buffer_and_suspend().wait().unwrap();
        assert!(!controller.is_playing());
        assert_eq!(p.writer.available_to_write(), 1 << 16);
    }

    #[test]
    fn drain_resolves_once_rings_are_empty() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut p = add_producer(&mut stream, 1, 2);
        p.writer.try_write_samples(&[0.5f32; 16]);

        let op = stream.drain_buffer_and_suspend();
        assert!(op.try_wait().is_none());

        controller.pump(8);
        stream.poll_ops();
        assert!(matches!(op.try_wait(), Some(Ok(()))));
        assert!(!controller.is_playing());
    }

    #[test]
    fn resume_and_volume_round_trip_through_the_backend() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);

        assert!(stream.resume().wait().is_err());

        stream.ensure_started(CONFIG).unwrap();
        stream.set_volume(0.5).wait().unwrap();
        assert_eq!(controller.volume(), 0.5);

        stream.discard_buffer_and_suspend().wait().unwrap();
        stream.resume().wait().unwrap();
        assert!(controller.is_playing());
    }

    #[test]
    fn zero_channel_config_is_rejected() {
        let (backend, _controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        let config = StreamConfig {
            channels: 0,
            ..CONFIG
        };
        assert!(matches!(
            stream.ensure_started(config),
            Err(StreamError::OpenFailed(_))
        ));
        assert!(!stream.is_started());
    }

    #[test]
    fn when_ready_fires_on_start() {
        let (backend, _controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        stream.when_ready(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!fired.load(Ordering::SeqCst));

        stream.ensure_started(CONFIG).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn unregistered_producers_stop_being_mixed() {
        let (backend, controller) = MockBackend::new();
        let mut stream = OutputStream::new(backend);
        stream.ensure_started(CONFIG).unwrap();

        let mut p = add_producer(&mut stream, 1, 2);
        p.writer.try_write_samples(&[0.5f32; 16]);
        assert!(stream.unregister_producer(1));

        let out = controller.pump(4);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!stream.unregister_producer(1));
    }
}
