use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::index::hash_bucket::HashBucket;

/// Buckets handed out per slab allocation.
const K_SLAB_BUCKETS: usize = 512;
/// Upper bound on slabs; bounds the arena at ~2M overflow buckets.
const K_MAX_SLABS: usize = 4096;

/// Arena for overflow hash buckets. Allocation is rare (a bucket chain must
/// exceed seven entries first), so slab growth takes a mutex; lookups are a
/// pair of atomic loads. Slot 0 is reserved as the null link, matching the
/// overflow entry's encoding.
pub struct BucketArena {
    slabs: Box<[AtomicPtr<HashBucket>]>,
    next_slot: AtomicU64,
    free_list: Mutex<Vec<u64>>,
    grow_lock: Mutex<()>,
}

impl BucketArena {
    pub fn new() -> Self {
        let slabs = (0..K_MAX_SLABS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BucketArena {
            slabs,
            next_slot: AtomicU64::new(1),
            free_list: Mutex::new(Vec::new()),
            grow_lock: Mutex::new(()),
        }
    }

    /// Allocates an overflow bucket, returning its 1-based slot.
    pub fn allocate(&self) -> u64 {
        if let Some(slot) = self.free_list.lock().pop() {
            return slot;
        }
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let slab_idx = (slot as usize) / K_SLAB_BUCKETS;
        assert!(slab_idx < K_MAX_SLABS, "overflow bucket arena exhausted");
        if self.slabs[slab_idx].load(Ordering::Acquire).is_null() {
            let _guard = self.grow_lock.lock();
            if self.slabs[slab_idx].load(Ordering::Acquire).is_null() {
                let slab: Box<[HashBucket]> =
                    (0..K_SLAB_BUCKETS).map(|_| HashBucket::default()).collect();
                let ptr = Box::into_raw(slab) as *mut HashBucket;
                self.slabs[slab_idx].store(ptr, Ordering::Release);
            }
        }
        slot
    }

    /// Returns a bucket allocated earlier but never linked into a chain
    /// (the linking CAS lost) for reuse.
    pub fn recycle(&self, slot: u64) {
        self.free_list.lock().push(slot);
    }

    /// Fetches the bucket at `slot`.
    pub fn get(&self, slot: u64) -> &HashBucket {
        debug_assert!(slot != 0 && slot < self.next_slot.load(Ordering::Acquire));
        let slab_idx = (slot as usize) / K_SLAB_BUCKETS;
        let ptr = self.slabs[slab_idx].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr.add(slot as usize % K_SLAB_BUCKETS) }
    }
}

impl Default for BucketArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BucketArena {
    fn drop(&mut self) {
        for slab in self.slabs.iter() {
            let ptr = slab.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        ptr,
                        K_SLAB_BUCKETS,
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Address;
    use crate::index::hash_bucket::HashBucketEntry;

    #[test]
    fn slots_start_at_one_and_are_distinct() {
        let arena = BucketArena::new();
        let a = arena.allocate();
        let b = arena.allocate();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn buckets_are_zeroed_and_writable() {
        let arena = BucketArena::new();
        let slot = arena.allocate();
        let bucket = arena.get(slot);
        assert!(bucket.entries[0].load().unused());
        bucket.entries[0].store(HashBucketEntry::new(Address::from_control(0x80), 3, false));
        assert_eq!(arena.get(slot).entries[0].load().tag(), 3);
    }

    #[test]
    fn recycled_slots_are_reused() {
        let arena = BucketArena::new();
        let a = arena.allocate();
        arena.recycle(a);
        assert_eq!(arena.allocate(), a);
    }
}
