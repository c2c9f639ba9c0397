//! Lock-free single-producer single-consumer ring buffer
//!
//! The transport between the fill thread (producer) and the audio callback
//! (consumer). Neither side ever blocks, locks, or allocates:
//!
//! - `write` is called only by the producer thread
//! - `read`, `peek`, `skip` and `reset` only by the consumer thread
//! - the space queries are safe from either side
//!
//! Write and read counters increase monotonically; positions are the
//! counters masked by the power-of-two storage size. One slot is reserved
//! so a full buffer is distinguishable from an empty one:
//! `read_space() + write_space() == capacity() - 1` at every observation
//! point. The producer release-stores the write counter after copying data
//! and the consumer acquire-loads it before reading, so the consumer never
//! observes uninitialised slots.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity lock-free SPSC queue of `Copy` samples
pub struct RingBuffer<T> {
    data: Box<[UnsafeCell<T>]>,
    mask: usize,
    /// Monotonic count of samples ever written (producer-owned)
    write_count: AtomicUsize,
    /// Monotonic count of samples ever consumed (consumer-owned)
    read_count: AtomicUsize,
}

// SAFETY: designed for single-producer single-consumer use. The producer
// only writes slots in [write_count, write_count + write_space) and
// publishes them with a release store; the consumer only reads slots in
// [read_count, read_count + read_space) after an acquire load. The two
// ranges never overlap because of the reserved slot.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a buffer able to hold at least `size` samples
    ///
    /// Storage is rounded up to the next power of two above `size` so that
    /// the requested count is usable despite the reserved slot.
    pub fn new(size: usize) -> Self {
        let storage = (size + 1).next_power_of_two();
        let data = (0..storage)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data,
            mask: storage - 1,
            write_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
        }
    }

    /// Total storage slots (one of which is reserved)
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples available to read
    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.write_count.load(Ordering::Acquire);
        let r = self.read_count.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Number of samples that can be written without overrunning the reader
    #[inline]
    pub fn write_space(&self) -> usize {
        self.capacity() - 1 - self.read_space()
    }

    /// Append samples; returns how many fitted
    ///
    /// Producer side only.
    pub fn write(&self, src: &[T]) -> usize {
        let n = src.len().min(self.write_space());
        let w = self.write_count.load(Ordering::Relaxed);
        for (i, &v) in src[..n].iter().enumerate() {
            // SAFETY: slots in [w, w + n) are unreachable by the consumer
            // until the release store below.
            unsafe {
                *self.data[w.wrapping_add(i) & self.mask].get() = v;
            }
        }
        self.write_count.store(w.wrapping_add(n), Ordering::Release);
        n
    }

    /// Copy samples into `dst` without consuming them; returns how many
    ///
    /// Consumer side only.
    pub fn peek(&self, dst: &mut [T]) -> usize {
        let n = dst.len().min(self.read_space());
        let r = self.read_count.load(Ordering::Relaxed);
        for (i, d) in dst[..n].iter_mut().enumerate() {
            // SAFETY: slots in [r, r + n) were published by the producer's
            // release store, observed by the acquire load in read_space.
            unsafe {
                *d = *self.data[r.wrapping_add(i) & self.mask].get();
            }
        }
        n
    }

    /// Copy samples into `dst` and consume them; returns how many
    ///
    /// Consumer side only.
    pub fn read(&self, dst: &mut [T]) -> usize {
        let n = self.peek(dst);
        let r = self.read_count.load(Ordering::Relaxed);
        self.read_count.store(r.wrapping_add(n), Ordering::Release);
        n
    }

    /// Discard up to `n` readable samples; returns how many were discarded
    ///
    /// Consumer side only.
    pub fn skip(&self, n: usize) -> usize {
        let n = n.min(self.read_space());
        let r = self.read_count.load(Ordering::Relaxed);
        self.read_count.store(r.wrapping_add(n), Ordering::Release);
        n
    }

    /// Discard everything currently readable
    ///
    /// Consumer side only; equivalent to skipping the whole read space.
    pub fn reset(&self) {
        self.skip(self.read_space());
    }
}
