//! Epoch-based protection for hlkv.
//!
//! Every session owns an entry in a fixed table and publishes the epoch it
//! last observed. Actions that change address boundaries (head advance,
//! index grow, checkpoint phase transitions) are registered against a bumped
//! epoch and run exactly once, on the first thread that observes every
//! active entry past that epoch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// A deferred action registered with `bump_epoch`.
pub type DrainAction = Box<dyn FnOnce() + Send>;

/// Published when an entry is not protecting anything.
const K_UNPROTECTED: u64 = u64::MAX;

/// Upper bound on concurrently registered sessions (plus iterators and
/// internal drivers holding temporary entries).
pub const K_MAX_SESSIONS: usize = 128;

/// One table slot, padded to a cache line so entries do not false-share.
#[repr(align(64))]
struct EpochEntry {
    local_epoch: AtomicU64,
    in_use: AtomicBool,
}

impl EpochEntry {
    fn new() -> Self {
        EpochEntry {
            local_epoch: AtomicU64::new(K_UNPROTECTED),
            in_use: AtomicBool::new(false),
        }
    }
}

pub struct LightEpoch {
    current_epoch: AtomicU64,
    entries: Box<[EpochEntry]>,
    drain_list: Mutex<VecDeque<(u64, DrainAction)>>,
    drain_count: AtomicU64,
}

impl LightEpoch {
    pub fn new() -> Self {
        let entries = (0..K_MAX_SESSIONS)
            .map(|_| EpochEntry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LightEpoch {
            current_epoch: AtomicU64::new(1),
            entries,
            drain_list: Mutex::new(VecDeque::new()),
            drain_count: AtomicU64::new(0),
        }
    }

    /// Claims a free table slot. Returns `None` when every slot is taken.
    pub fn acquire_entry(&self) -> Option<usize> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.local_epoch.store(K_UNPROTECTED, Ordering::SeqCst);
                return Some(idx);
            }
        }
        None
    }

    /// Releases a slot previously returned by `acquire_entry`.
    pub fn release_entry(&self, slot: usize) {
        let entry = &self.entries[slot];
        entry.local_epoch.store(K_UNPROTECTED, Ordering::SeqCst);
        entry.in_use.store(false, Ordering::Release);
        self.drain(true);
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Publishes the current epoch into the slot's entry.
    #[inline]
    pub fn protect(&self, slot: usize) {
        let epoch = self.current();
        self.entries[slot].local_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Publishes that the slot no longer protects anything.
    #[inline]
    pub fn unprotect(&self, slot: usize) {
        self.entries[slot]
            .local_epoch
            .store(K_UNPROTECTED, Ordering::SeqCst);
        self.drain(true);
    }

    /// Re-reads the current epoch into the slot and runs any drain actions
    /// that have become safe.
    #[inline]
    pub fn refresh(&self, slot: usize) {
        self.protect(slot);
        self.try_drain();
    }

    /// Atomically bumps the current epoch and registers `action` to run once
    /// every protected entry has observed the new epoch. Returns the epoch
    /// the action is gated on.
    pub fn bump_epoch(&self, action: DrainAction) -> u64 {
        let epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut list = self.drain_list.lock();
            list.push_back((epoch, action));
            self.drain_count.store(list.len() as u64, Ordering::Release);
        }
        self.drain(true);
        epoch
    }

    /// The highest epoch every protected entry has moved past. With no
    /// protected entries all registered actions are safe.
    fn compute_safe_epoch(&self) -> u64 {
        let mut safe = u64::MAX;
        for entry in self.entries.iter() {
            if !entry.in_use.load(Ordering::Acquire) {
                continue;
            }
            let local = entry.local_epoch.load(Ordering::SeqCst);
            if local < safe {
                safe = local;
            }
        }
        safe
    }

    /// Pops and runs every drain action whose epoch is now safe. Actions run
    /// outside the list lock so they may themselves bump the epoch.
    fn try_drain(&self) {
        self.drain(false);
    }

    fn drain(&self, blocking: bool) {
        loop {
            if self.drain_count.load(Ordering::Acquire) == 0 {
                return;
            }
            let safe = self.compute_safe_epoch();
            let mut ready: Vec<DrainAction> = Vec::new();
            {
                let mut list = if blocking {
                    self.drain_list.lock()
                } else {
                    match self.drain_list.try_lock() {
                        Some(list) => list,
                        // Another thread is draining; it re-checks after its
                        // own pass.
                        None => return,
                    }
                };
                let mut i = 0;
                while i < list.len() {
                    if list[i].0 <= safe {
                        let (_, action) = list.remove(i).expect("index checked");
                        ready.push(action);
                    } else {
                        i += 1;
                    }
                }
                self.drain_count.store(list.len() as u64, Ordering::Release);
            }
            if ready.is_empty() {
                return;
            }
            for action in ready {
                action();
            }
            // Entries may have moved while the lock was held; take another
            // pass so nothing newly safe is stranded.
        }
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}
