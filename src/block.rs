//! Fixed-capacity rings of raw blocks shared between threads.
//!
//! The same ring type backs both sides of the ingest: the packet source
//! fills input blocks of slot-aligned frames, and the ingest fills output
//! blocks of header + voltage data for the downstream consumer. Slots cycle
//! FREE -> PROCESSING -> FILLED -> FREE; every wait is bounded and a
//! shutdown wakes all waiters.

use std::cell::UnsafeCell;
use std::time::{Duration, Instant};

use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Processing,
    Filled,
}

/// Outcome of a bounded slot wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingWait {
    Ready,
    TimedOut,
    Shutdown,
}

struct Shared {
    states: Box<[SlotState]>,
    shutdown: bool,
}

pub struct BlockRing {
    header_size: usize,
    data_size: usize,
    // u64 backing keeps every data view 8-byte aligned, so 16-bit sample
    // views never fault the cast
    slots: Vec<UnsafeCell<Box<[u64]>>>,
    shared: Mutex<Shared>,
    cond: Condvar,
}

// Slot payloads are raced only through the state protocol: a slot's bytes
// are touched exclusively by whoever moved it out of Free (producer, until
// set_filled) or observed it Filled (consumer, until set_free).
unsafe impl Send for BlockRing {}
unsafe impl Sync for BlockRing {}

impl BlockRing {
    pub fn new(n_blocks: usize, header_size: usize, data_size: usize) -> Self {
        assert!(n_blocks > 0);
        assert_eq!(header_size % 8, 0);
        assert_eq!(data_size % 8, 0);
        let words = (header_size + data_size) / 8;
        let slots = (0..n_blocks)
            .map(|_| UnsafeCell::new(vec![0u64; words].into_boxed_slice()))
            .collect();
        Self {
            header_size,
            data_size,
            slots,
            shared: Mutex::new(Shared {
                states: vec![SlotState::Free; n_blocks].into_boxed_slice(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn n_blocks(&self) -> usize {
        self.slots.len()
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of slots not currently free
    pub fn used(&self) -> usize {
        self.shared
            .lock()
            .states
            .iter()
            .filter(|s| **s != SlotState::Free)
            .count()
    }

    /// Wake every waiter; subsequent waits return Shutdown immediately
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Claim `idx` for writing once it is free
    pub fn wait_free(&self, idx: usize, timeout: Duration) -> RingWait {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        loop {
            if shared.shutdown {
                return RingWait::Shutdown;
            }
            if shared.states[idx] == SlotState::Free {
                shared.states[idx] = SlotState::Processing;
                return RingWait::Ready;
            }
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                return RingWait::TimedOut;
            }
        }
    }

    /// Wait for `idx` to be published; the slot stays Filled until the
    /// consumer releases it with set_free
    pub fn wait_filled(&self, idx: usize, timeout: Duration) -> RingWait {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        loop {
            if shared.shutdown {
                return RingWait::Shutdown;
            }
            if shared.states[idx] == SlotState::Filled {
                return RingWait::Ready;
            }
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                return RingWait::TimedOut;
            }
        }
    }

    pub fn set_filled(&self, idx: usize) {
        let mut shared = self.shared.lock();
        debug_assert_eq!(shared.states[idx], SlotState::Processing);
        shared.states[idx] = SlotState::Filled;
        self.cond.notify_all();
    }

    pub fn set_free(&self, idx: usize) {
        let mut shared = self.shared.lock();
        shared.states[idx] = SlotState::Free;
        self.cond.notify_all();
    }

    /// # Safety
    /// The caller must hold `idx` in Processing (via wait_free).
    pub unsafe fn header_mut(&self, idx: usize) -> &mut [u8] {
        let buf = &mut *self.slots[idx].get();
        &mut buf.as_mut_byte_slice()[..self.header_size]
    }

    /// # Safety
    /// The caller must hold `idx` in Processing (via wait_free).
    pub unsafe fn data_mut(&self, idx: usize) -> &mut [u8] {
        let buf = &mut *self.slots[idx].get();
        &mut buf.as_mut_byte_slice()[self.header_size..]
    }

    /// # Safety
    /// The caller must have observed `idx` Filled (via wait_filled) and not
    /// yet released it.
    pub unsafe fn header(&self, idx: usize) -> &[u8] {
        let buf = &*self.slots[idx].get();
        &buf.as_byte_slice()[..self.header_size]
    }

    /// # Safety
    /// The caller must have observed `idx` Filled (via wait_filled) and not
    /// yet released it.
    pub unsafe fn data(&self, idx: usize) -> &[u8] {
        let buf = &*self.slots[idx].get();
        &buf.as_byte_slice()[self.header_size..]
    }
}
