// SPDX-License-Identifier: Apache-2.0 OR MIT
// Lock-free multi-producer, single-consumer ring of log entries

use super::entry::LogEntry;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

#[repr(align(64))]
struct CacheAligned<T>(T);

struct Slot {
    state: AtomicU8,
    entry: UnsafeCell<LogEntry>,
}

/// Bounded ring shared by every thread logging to one facility.
///
/// Writers reserve a sequence number with a CAS loop and never block. When
/// the consumer falls behind, the oldest unread entries are overwritten and
/// counted as overruns.
pub struct MPSCRingBuffer {
    slots: Box<[Slot]>,
    mask: usize,
    write_seq: CacheAligned<AtomicU64>,
    read_seq: CacheAligned<AtomicU64>,
    overruns: AtomicU64,
}

// SAFETY: a slot's payload is only touched by the writer that moved its
// state to WRITING or by the single consumer after observing READY.
unsafe impl Sync for MPSCRingBuffer {}
unsafe impl Send for MPSCRingBuffer {}

impl MPSCRingBuffer {
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of 2");
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(EMPTY),
                entry: UnsafeCell::new(LogEntry::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            write_seq: CacheAligned(AtomicU64::new(0)),
            read_seq: CacheAligned(AtomicU64::new(0)),
            overruns: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn write(&self, mut entry: LogEntry) {
        let mut seq = self.write_seq.0.load(Ordering::Relaxed);
        loop {
            match self.write_seq.0.compare_exchange_weak(
                seq,
                seq + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    seq = current;
                    std::hint::spin_loop();
                }
            }
        }

        let read_seq = self.read_seq.0.load(Ordering::Acquire);
        if seq >= read_seq + self.capacity() as u64 {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }

        let slot = &self.slots[seq as usize & self.mask];
        // A slow writer from a previous lap may still own this slot.
        while slot
            .state
            .compare_exchange_weak(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if slot
                .state
                .compare_exchange_weak(READY, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            std::hint::spin_loop();
        }

        entry.sequence = seq;
        // SAFETY: the slot is in WRITING state and owned by this writer.
        unsafe {
            *slot.entry.get() = entry;
        }
        slot.state.store(READY, Ordering::Release);
    }

    /// Pop the oldest entry; only one consumer may call this.
    pub fn read(&self) -> Option<LogEntry> {
        loop {
            let read_seq = self.read_seq.0.load(Ordering::Relaxed);
            let write_seq = self.write_seq.0.load(Ordering::Acquire);
            if read_seq >= write_seq {
                return None;
            }
            // Skip what writers already lapped.
            if write_seq - read_seq > self.capacity() as u64 {
                self.read_seq
                    .0
                    .store(write_seq - self.capacity() as u64, Ordering::Release);
                continue;
            }

            let slot = &self.slots[read_seq as usize & self.mask];
            if slot
                .state
                .compare_exchange(READY, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Reserved but not yet published.
                return None;
            }
            // SAFETY: the consumer moved the slot to WRITING above.
            let entry = unsafe { *slot.entry.get() };
            slot.state.store(EMPTY, Ordering::Release);
            self.read_seq.0.store(read_seq + 1, Ordering::Release);
            if entry.sequence == read_seq {
                return Some(entry);
            }
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        let write_seq = self.write_seq.0.load(Ordering::Relaxed);
        let read_seq = self.read_seq.0.load(Ordering::Relaxed);
        (write_seq.saturating_sub(read_seq) as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
