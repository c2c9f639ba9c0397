//! Deferred reclamation of objects still visible to the audio callback
//!
//! When the fill thread replaces a set of ring buffers (or the stretcher
//! state) the audio callback may still be part-way through a pull that
//! uses the old instance. The callback can neither lock nor wait, so the
//! replaced object is *claimed* into a scavenger instead of being dropped:
//! a timestamped slot holds it until a grace interval has passed, after
//! which any in-flight callback has long since returned and the memory can
//! be freed.
//!
//! `claim` runs on non-realtime threads; `scavenge` runs on the callback
//! thread and is a bounded, non-blocking sweep. Freeing from the callback
//! is acceptable here because the objects are small once their buffers
//! have been superseded, and the sweep touches at most `slot_count`
//! entries per call.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::Instant;

/// Default grace interval before a claimed object may be freed
///
/// Must be at least twice the longest plausible callback period; 250ms
/// covers even pathological device block sizes.
pub const DEFAULT_GRACE_MS: u64 = 250;

/// Default number of slots; claims beyond this are dropped inline
pub const DEFAULT_SLOTS: usize = 32;

/// Slot reservation marker used while a claim is being published
const RESERVED: usize = 1;

struct Slot<T> {
    ptr: AtomicPtr<T>,
    claimed_at_ms: AtomicU64,
}

/// Time-delayed deleter for objects handed off from non-RT threads
pub struct Scavenger<T> {
    slots: Box<[Slot<T>]>,
    grace_ms: u64,
    epoch: Instant,
}

impl<T: Send> Scavenger<T> {
    /// Create a scavenger with `slot_count` slots and the given grace interval
    pub fn new(slot_count: usize, grace_ms: u64) -> Self {
        let slots = (0..slot_count.max(1))
            .map(|_| Slot {
                ptr: AtomicPtr::new(std::ptr::null_mut()),
                claimed_at_ms: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            grace_ms,
            epoch: Instant::now(),
        }
    }

    /// Create a scavenger with the default slot count and grace interval
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SLOTS, DEFAULT_GRACE_MS)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Hand an object over for deferred deletion
    ///
    /// Callable from any non-realtime thread. If every slot is occupied
    /// the object is dropped on the calling thread instead (which is legal
    /// there) and a warning is logged; deletion never migrates onto the
    /// callback thread through this path.
    pub fn claim(&self, value: Box<T>) {
        let raw = Box::into_raw(value);
        let stamp = self.now_ms();
        for slot in self.slots.iter() {
            if slot
                .ptr
                .compare_exchange(
                    std::ptr::null_mut(),
                    RESERVED as *mut T,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Timestamp must be in place before the pointer becomes
                // visible to the sweeper.
                slot.claimed_at_ms.store(stamp, Ordering::Relaxed);
                slot.ptr.store(raw, Ordering::Release);
                return;
            }
        }
        log::warn!("scavenger full ({} slots); dropping inline", self.slots.len());
        // SAFETY: raw came from Box::into_raw above and was never published.
        drop(unsafe { Box::from_raw(raw) });
    }

    /// Free every claimed object older than the grace interval
    ///
    /// Callable from the realtime thread; never blocks. Only one thread
    /// may sweep.
    pub fn scavenge(&self) {
        let now = self.now_ms();
        for slot in self.slots.iter() {
            let p = slot.ptr.load(Ordering::Acquire);
            if p.is_null() || p as usize == RESERVED {
                continue;
            }
            let age = now.saturating_sub(slot.claimed_at_ms.load(Ordering::Relaxed));
            if age >= self.grace_ms {
                slot.ptr.store(std::ptr::null_mut(), Ordering::Release);
                // SAFETY: p was published by claim() and is removed from
                // the slot before being freed; only the sweeper clears
                // non-reserved pointers.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }

    /// Number of objects currently awaiting reclamation
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                let p = s.ptr.load(Ordering::Acquire);
                !p.is_null() && p as usize != RESERVED
            })
            .count()
    }
}

impl<T> Drop for Scavenger<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let p = slot.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() && p as usize != RESERVED {
                // SAFETY: sole owner at teardown.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_nothing_freed_before_grace() {
        let drops = Arc::new(AtomicUsize::new(0));
        let scav = Scavenger::new(4, 10_000);
        scav.claim(Box::new(DropCounter(drops.clone())));
        scav.scavenge();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(scav.pending(), 1);
    }

    #[test]
    fn test_freed_after_grace() {
        let drops = Arc::new(AtomicUsize::new(0));
        let scav = Scavenger::new(4, 20);
        scav.claim(Box::new(DropCounter(drops.clone())));
        std::thread::sleep(std::time::Duration::from_millis(40));
        scav.scavenge();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(scav.pending(), 0);
    }

    #[test]
    fn test_overflow_drops_inline() {
        let drops = Arc::new(AtomicUsize::new(0));
        let scav = Scavenger::new(2, 10_000);
        for _ in 0..5 {
            scav.claim(Box::new(DropCounter(drops.clone())));
        }
        // Two parked in slots, three dropped by the claiming thread
        assert_eq!(scav.pending(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_drains_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let scav = Scavenger::new(8, 10_000);
            for _ in 0..3 {
                scav.claim(Box::new(DropCounter(drops.clone())));
            }
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
