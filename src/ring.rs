//! Lock-free SPSC byte ring over a shared memory region.
//!
//! The region starts with a validated [`RingHeader`] followed by a
//! power-of-two payload area. Cursors are monotonic byte counters, so
//! the full capacity is usable and fill level is always
//! `write_pos - read_pos`. Exactly one producer and one consumer may
//! use a ring at a time; the transport does not enforce this.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use thiserror::Error;

pub const RING_MAGIC: u32 = u32::from_le_bytes(*b"SARB");
pub const RING_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity must be a nonzero power of two, got {0}")]
    CapacityNotPowerOfTwo(u32),
    #[error("bad ring magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported ring version {0}")]
    UnsupportedVersion(u32),
    #[error("header capacity {capacity} and mask {mask} disagree")]
    BadMask { capacity: u32, mask: u32 },
    #[error("region is {actual} bytes but the header requires {required}")]
    RegionTooSmall { required: usize, actual: usize },
    #[error("channel count {count} exceeds channel capacity {capacity}")]
    BadChannelCount { count: u32, capacity: u32 },
    #[error("region pointer is not aligned to {0} bytes")]
    BadAlignment(usize),
}

/// Stream format metadata carried in the ring header so an attaching
/// consumer can interpret the payload without a side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFormat {
    pub sample_rate: u32,
    pub channel_count: u32,
    pub channel_capacity: u32,
}

#[repr(C)]
pub struct RingHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    mask: u32,
    sample_rate: u32,
    channel_capacity: u32,
    channel_count: u32,
    _reserved: u32,
    write_pos: CachePadded<AtomicU64>,
    read_pos: CachePadded<AtomicU64>,
}

struct RingInner {
    base: NonNull<u8>,
    len: usize,
    owned: Option<Layout>,
}

// SAFETY: the payload is only touched through the SPSC cursor
// protocol below, and the header fields other than the cursors are
// immutable after construction.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: `base` was validated (or initialized) to hold a
        // live RingHeader for the lifetime of the inner.
        unsafe { &*(self.base.as_ptr() as *const RingHeader) }
    }

    #[inline]
    fn data(&self) -> *mut u8 {
        // SAFETY: the region extends `capacity` bytes past the header.
        unsafe { self.base.as_ptr().add(mem::size_of::<RingHeader>()) }
    }
}

impl Drop for RingInner {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: allocated with this exact layout in `create`.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// A shared ring region, split into its producer and consumer ends.
pub struct RingTransport {
    inner: Arc<RingInner>,
}

impl RingTransport {
    /// The region size required for a given payload capacity.
    pub fn required_region_len(capacity: u32) -> usize {
        mem::size_of::<RingHeader>() + capacity as usize
    }

    /// Allocate an owned region and initialize its header.
    pub fn create(capacity: u32, format: RingFormat) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::CapacityNotPowerOfTwo(capacity));
        }
        if format.channel_count > format.channel_capacity {
            return Err(RingError::BadChannelCount {
                count: format.channel_count,
                capacity: format.channel_capacity,
            });
        }

        let len = Self::required_region_len(capacity);
        let layout = Layout::from_size_align(len, mem::align_of::<RingHeader>())
            .map_err(|_| RingError::CapacityNotPowerOfTwo(capacity))?;

        // SAFETY: layout has nonzero size; the header is written
        // before any other access.
        let base = unsafe {
            let raw = alloc::alloc_zeroed(layout);
            let Some(base) = NonNull::new(raw) else {
                alloc::handle_alloc_error(layout);
            };
            ptr::write(
                base.as_ptr() as *mut RingHeader,
                RingHeader {
                    magic: RING_MAGIC,
                    version: RING_VERSION,
                    capacity,
                    mask: capacity - 1,
                    sample_rate: format.sample_rate,
                    channel_capacity: format.channel_capacity,
                    channel_count: format.channel_count,
                    _reserved: 0,
                    write_pos: CachePadded::new(AtomicU64::new(0)),
                    read_pos: CachePadded::new(AtomicU64::new(0)),
                },
            );
            base
        };

        Ok(Self {
            inner: Arc::new(RingInner {
                base,
                len,
                owned: Some(layout),
            }),
        })
    }

    /// Attach to an existing region, validating its header.
    ///
    /// Fails closed: no field of the region is trusted until every
    /// check passes.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a readable and writable region of at least
    /// `len` bytes that outlives the returned transport and all ends
    /// split from it.
    pub unsafe fn attach(ptr: *mut u8, len: usize) -> Result<Self, RingError> {
        let align = mem::align_of::<RingHeader>();
        if ptr.align_offset(align) != 0 {
            return Err(RingError::BadAlignment(align));
        }
        if len < mem::size_of::<RingHeader>() {
            return Err(RingError::RegionTooSmall {
                required: mem::size_of::<RingHeader>(),
                actual: len,
            });
        }

        let header = &*(ptr as *const RingHeader);
        if header.magic != RING_MAGIC {
            return Err(RingError::BadMagic(header.magic));
        }
        if header.version != RING_VERSION {
            return Err(RingError::UnsupportedVersion(header.version));
        }
        if header.capacity == 0 || !header.capacity.is_power_of_two() {
            return Err(RingError::CapacityNotPowerOfTwo(header.capacity));
        }
        if header.mask != header.capacity - 1 {
            return Err(RingError::BadMask {
                capacity: header.capacity,
                mask: header.mask,
            });
        }
        let required = Self::required_region_len(header.capacity);
        if len < required {
            return Err(RingError::RegionTooSmall {
                required,
                actual: len,
            });
        }
        if header.channel_count > header.channel_capacity {
            return Err(RingError::BadChannelCount {
                count: header.channel_count,
                capacity: header.channel_capacity,
            });
        }

        Ok(Self {
            inner: Arc::new(RingInner {
                base: NonNull::new_unchecked(ptr),
                len,
                owned: None,
            }),
        })
    }

    /// The raw region, for embedders that map it elsewhere.
    pub fn region(&self) -> (*const u8, usize) {
        (self.inner.base.as_ptr(), self.inner.len)
    }

    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                inner: Arc::clone(&self.inner),
            },
            RingConsumer { inner: self.inner },
        )
    }
}

#[inline]
fn fill_level(header: &RingHeader) -> (u64, u64) {
    let write = header.write_pos.load(Ordering::Acquire);
    let read = header.read_pos.load(Ordering::Acquire);
    (write, read)
}

/// The writing end. Never blocks; a full ring results in a short
/// write and the caller decides whether to retry or drop.
pub struct RingProducer {
    inner: Arc<RingInner>,
}

impl RingProducer {
    pub fn format(&self) -> RingFormat {
        let h = self.inner.header();
        RingFormat {
            sample_rate: h.sample_rate,
            channel_count: h.channel_count,
            channel_capacity: h.channel_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.header().capacity as usize
    }

    pub fn available_to_write(&self) -> usize {
        let h = self.inner.header();
        let write = h.write_pos.load(Ordering::Relaxed);
        let read = h.read_pos.load(Ordering::Acquire);
        h.capacity as usize - write.wrapping_sub(read) as usize
    }

    /// Copy as many bytes as fit and return how many were taken.
    pub fn try_write(&mut self, bytes: &[u8]) -> usize {
        self.write_inner(bytes, 1)
    }

    /// Sample-granular write: never splits an `f32` across calls.
    pub fn try_write_samples(&mut self, samples: &[f32]) -> usize {
        self.write_inner(bytemuck::cast_slice(samples), mem::size_of::<f32>())
            / mem::size_of::<f32>()
    }

    /// Frame-granular write for interleaved audio: never splits a
    /// frame of `channels` samples across calls, so a short write on
    /// a nearly full ring cannot shift the consumer's frame
    /// alignment. Returns samples written (a multiple of `channels`).
    pub fn try_write_frames(&mut self, samples: &[f32], channels: usize) -> usize {
        let granule = channels.max(1) * mem::size_of::<f32>();
        self.write_inner(bytemuck::cast_slice(samples), granule) / mem::size_of::<f32>()
    }

    fn write_inner(&mut self, bytes: &[u8], granule: usize) -> usize {
        let h = self.inner.header();
        let capacity = h.capacity as usize;
        let write = h.write_pos.load(Ordering::Relaxed);
        let read = h.read_pos.load(Ordering::Acquire);

        let free = capacity - write.wrapping_sub(read) as usize;
        let mut n = bytes.len().min(free);
        n -= n % granule;
        if n == 0 {
            return 0;
        }

        let idx = (write & h.mask as u64) as usize;
        let first = n.min(capacity - idx);
        // SAFETY: the SPSC protocol guarantees `[write, write + free)`
        // is not read by the consumer until `write_pos` is published.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.inner.data().add(idx), first);
            if n > first {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.inner.data(), n - first);
            }
        }
        h.write_pos.store(write + n as u64, Ordering::Release);
        n
    }

    /// Drop all buffered data by jumping the read cursor to the write
    /// cursor. Used by producers resetting their timeline.
    pub fn discard_all(&mut self) {
        let h = self.inner.header();
        let write = h.write_pos.load(Ordering::Relaxed);
        h.read_pos.store(write, Ordering::Release);
    }
}

/// The reading end. All state lives in the shared header, so reads
/// take `&self`; single-reader discipline is the caller's.
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

impl RingConsumer {
    pub fn format(&self) -> RingFormat {
        let h = self.inner.header();
        RingFormat {
            sample_rate: h.sample_rate,
            channel_count: h.channel_count,
            channel_capacity: h.channel_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.header().capacity as usize
    }

    pub fn available_to_read(&self) -> usize {
        let h = self.inner.header();
        let (write, read) = fill_level(h);
        write.wrapping_sub(read) as usize
    }

    /// Copy out as many bytes as are buffered, up to `out.len()`.
    /// Returns 0 when the ring is empty (the caller substitutes
    /// silence).
    pub fn try_read(&self, out: &mut [u8]) -> usize {
        self.read_inner(out, 1)
    }

    /// Sample-granular read: never splits an `f32` across calls.
    pub fn try_read_samples(&self, out: &mut [f32]) -> usize {
        self.read_inner(bytemuck::cast_slice_mut(out), mem::size_of::<f32>())
            / mem::size_of::<f32>()
    }

    fn read_inner(&self, out: &mut [u8], granule: usize) -> usize {
        let h = self.inner.header();
        let capacity = h.capacity as usize;
        let (write, read) = fill_level(h);

        let avail = write.wrapping_sub(read) as usize;
        let mut n = out.len().min(avail);
        n -= n % granule;
        if n == 0 {
            return 0;
        }

        let idx = (read & h.mask as u64) as usize;
        let first = n.min(capacity - idx);
        // SAFETY: the producer does not overwrite `[read, write)`
        // until the read cursor has advanced past it.
        unsafe {
            ptr::copy_nonoverlapping(self.inner.data().add(idx), out.as_mut_ptr(), first);
            if n > first {
                ptr::copy_nonoverlapping(self.inner.data(), out.as_mut_ptr().add(first), n - first);
            }
        }

        // The producer may have jumped the read cursor underneath us
        // with `discard_all`. The compare-exchange detects that case
        // and the bytes copied out are treated as never having been
        // buffered.
        match h.read_pos.compare_exchange(
            read,
            read + n as u64,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => n,
            Err(_) => 0,
        }
    }

    /// Advance the read cursor past everything currently buffered,
    /// returning how many bytes were skipped.
    pub fn skip_all(&self) -> usize {
        let h = self.inner.header();
        loop {
            let (write, read) = fill_level(h);
            let n = write.wrapping_sub(read) as usize;
            if n == 0 {
                return 0;
            }
            if h
                .read_pos
                .compare_exchange(read, write, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return n;
            }
        }
    }
}
