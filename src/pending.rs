//! Per-worker connection counts shared between the supervisor and workers.
//!
//! The table lives in an anonymous shared mapping created before the first
//! fork, so every worker process sees the same counters. The supervisor
//! increments a worker's slot when it hands a connection over; the worker
//! decrements it when the connection is torn down.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One atomic counter per worker in memory shared across `fork`.
pub struct PendingTable {
    ptr: NonNull<AtomicUsize>,
    len: usize,
}

// The mapping is only ever accessed through atomics.
unsafe impl Send for PendingTable {}
unsafe impl Sync for PendingTable {}

impl PendingTable {
    /// Maps a zeroed table with one counter per worker.
    pub fn new(len: usize) -> io::Result<Self> {
        let bytes = len.max(1) * std::mem::size_of::<AtomicUsize>();
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<AtomicUsize>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        // Anonymous mappings are zero-filled, which is a valid AtomicUsize(0).
        Ok(Self { ptr, len })
    }

    fn slots(&self) -> &[AtomicUsize] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn slot(&self, index: usize) -> Option<&AtomicUsize> {
        let slot = self.slots().get(index);
        if slot.is_none() {
            log::warn!("pending table has no slot {}", index);
        }
        slot
    }

    pub fn get(&self, index: usize) -> usize {
        self.slots()
            .get(index)
            .map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    /// Counts a connection handed to worker `index`.
    pub fn increment(&self, index: usize) {
        if let Some(slot) = self.slot(index) {
            slot.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Returns false if the counter was already zero, leaving it unchanged.
    pub fn decrement(&self, index: usize) -> bool {
        let Some(slot) = self.slot(index) else {
            return false;
        };
        let ok = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !ok {
            log::warn!("pending count for worker {} would go negative", index);
        }
        ok
    }

    /// Zeroes a slot, used when its worker is replaced.
    pub fn reset(&self, index: usize) {
        if let Some(slot) = self.slot(index) {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> Vec<usize> {
        self.slots().iter().map(|s| s.load(Ordering::Acquire)).collect()
    }

    /// Index of the worker with the fewest pending connections, ignoring
    /// the slots in `skip`. The counters are read afresh on every call.
    ///
    /// # Returns
    /// - `None` if every slot is skipped
    pub fn least_loaded(&self, skip: &[usize]) -> Option<usize> {
        least_loaded(&self.snapshot(), skip)
    }
}

impl Drop for PendingTable {
    fn drop(&mut self) {
        let bytes = self.len.max(1) * std::mem::size_of::<AtomicUsize>();
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), bytes);
        }
    }
}

/// Position of the smallest count outside `skip`; ties go to the lowest index.
pub fn least_loaded(counts: &[usize], skip: &[usize]) -> Option<usize> {
    counts
        .iter()
        .enumerate()
        .filter(|(index, _)| !skip.contains(index))
        .min_by_key(|&(index, &count)| (count, index))
        .map(|(index, _)| index)
}
