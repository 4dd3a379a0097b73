//! The in-memory hash index: a flat array of cache-line buckets, each a
//! seven-entry set plus an overflow chain, mapping key hashes to log
//! addresses.
//!
//! Entries mutate by CAS only. Insertion claims a free slot with the
//! tentative bit, re-scans for a racing insert of the same tag, and only
//! then finalizes, so two threads can never publish the same tag twice in
//! one bucket. Growth doubles the table cooperatively: the old table is
//! split chunk by chunk, and any operation landing in a not-yet-split
//! bucket first rehashes that chunk itself.

pub mod hash_bucket;
pub mod key_hash;
pub mod overflow;

use std::cell::UnsafeCell;
use std::cmp::min;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::core::address::Address;
use crate::index::hash_bucket::{
    AtomicHashBucketEntry, HashBucket, HashBucketEntry, HashBucketOverflowEntry,
};
use crate::index::key_hash::KeyHash;
use crate::index::overflow::BucketArena;

/// Resolves a record address to `(key_hash, previous_address)`, or `None`
/// when the record is no longer resident. Supplied by the operation engine,
/// which knows the key type.
pub type HashResolver<'a> = &'a dyn Fn(Address) -> Option<(u64, Address)>;

/// Source buckets a grow participant splits per claim.
const K_GROW_CHUNK_BUCKETS: u64 = 256;

const K_CHUNK_PENDING: u8 = 0;
const K_CHUNK_BUSY: u8 = 1;
const K_CHUNK_DONE: u8 = 2;

struct HashTable {
    size: u64,
    buckets: Box<[HashBucket]>,
}

impl HashTable {
    fn new(size: u64) -> Self {
        let buckets = (0..size)
            .map(|_| HashBucket::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        HashTable { size, buckets }
    }
}

/// Bookkeeping for an in-flight doubling.
struct GrowState {
    old_version: usize,
    old_size: u64,
    new_size: u64,
    chunks: Box<[AtomicU8]>,
    next_chunk: AtomicU64,
    remaining: AtomicU64,
}

enum SlotSearch<'a> {
    Match(HashBucketEntry, &'a AtomicHashBucketEntry),
    Free(&'a AtomicHashBucketEntry),
    Retry,
}

pub struct MemHashIndex {
    // Two table slots: the live version and, during a grow, its successor.
    tables: [UnsafeCell<Option<Box<HashTable>>>; 2],
    version: AtomicUsize,
    overflow: BucketArena,
    entry_count: AtomicU64,
    grow_active: AtomicBool,
    grow: Mutex<Option<Arc<GrowState>>>,
}

unsafe impl Send for MemHashIndex {}
unsafe impl Sync for MemHashIndex {}

impl MemHashIndex {
    pub fn new(table_size: u64) -> Self {
        MemHashIndex {
            tables: [
                UnsafeCell::new(Some(Box::new(HashTable::new(table_size)))),
                UnsafeCell::new(None),
            ],
            version: AtomicUsize::new(0),
            overflow: BucketArena::new(),
            entry_count: AtomicU64::new(0),
            grow_active: AtomicBool::new(false),
            grow: Mutex::new(None),
        }
    }

    fn table_at(&self, version: usize) -> &HashTable {
        // The slot for `version` is installed before any thread is routed to
        // it and only replaced after an epoch drain proves no reader remains.
        unsafe {
            (*self.tables[version].get())
                .as_ref()
                .expect("hash table slot not initialized")
        }
    }

    /// Bucket count of the live table.
    pub fn size(&self) -> u64 {
        self.table_at(self.version.load(Ordering::SeqCst)).size
    }

    /// Entries created through `find_or_create_entry`.
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// Whether the live load factor crossed the configured threshold.
    pub fn should_grow(&self, load_factor: f64) -> bool {
        let capacity = self.size() * hash_bucket::K_ENTRIES_PER_BUCKET as u64;
        self.entry_count() as f64 > capacity as f64 * load_factor
    }

    pub fn grow_in_progress(&self) -> bool {
        self.grow_active.load(Ordering::SeqCst)
    }

    /// Stamp identifying the current routing regime (live version plus
    /// grow-in-flight flag). An operation that found its bucket slot under
    /// one stamp must not install an entry under another: the slot may
    /// belong to a table that has since been split.
    pub fn route_stamp(&self) -> u64 {
        ((self.version.load(Ordering::SeqCst) as u64) << 1)
            | self.grow_active.load(Ordering::SeqCst) as u64
    }

    /// Picks the table and bucket for `hash`, splitting the source chunk
    /// first when a grow is in flight.
    fn route(&self, hash: KeyHash, resolver: HashResolver) -> (&HashTable, u64, u16) {
        if self.grow_active.load(Ordering::SeqCst) {
            let state = self.grow.lock().clone();
            if let Some(g) = state {
                let old_bucket = hash.table_index(g.old_size);
                self.ensure_rehashed(&g, old_bucket, resolver);
                let table = self.table_at(1 - g.old_version);
                return (table, hash.table_index(g.new_size), hash.tag());
            }
        }
        let table = self.table_at(self.version.load(Ordering::SeqCst));
        (table, hash.table_index(table.size), hash.tag())
    }

    /// Finds the entry for `hash`, if any.
    pub fn find_entry(
        &self,
        hash: KeyHash,
        resolver: HashResolver,
    ) -> Option<(HashBucketEntry, &AtomicHashBucketEntry)> {
        let (table, bucket_idx, tag) = self.route(hash, resolver);
        let mut bucket = &table.buckets[bucket_idx as usize];
        loop {
            for slot in bucket.entries.iter() {
                let entry = slot.load();
                if !entry.unused() && entry.tag() == tag && !entry.tentative() {
                    return Some((entry, slot));
                }
            }
            let overflow = bucket.overflow_entry.load();
            if overflow.unused() {
                return None;
            }
            bucket = self.overflow.get(overflow.slot());
        }
    }

    /// Finds the entry for `hash`, creating a (null-address) one when the
    /// key has never been indexed.
    pub fn find_or_create_entry(
        &self,
        hash: KeyHash,
        resolver: HashResolver,
    ) -> (HashBucketEntry, &AtomicHashBucketEntry) {
        loop {
            let (table, bucket_idx, tag) = self.route(hash, resolver);
            match self.search_bucket(table, bucket_idx, tag) {
                SlotSearch::Match(entry, slot) => return (entry, slot),
                SlotSearch::Free(slot) => {
                    let tentative = HashBucketEntry::new(Address::NULL, tag, true);
                    if slot
                        .compare_exchange(HashBucketEntry::default(), tentative)
                        .is_err()
                    {
                        continue;
                    }
                    // The tentative bit keeps racing inserts of the same tag
                    // from both finalizing: whoever still sees a twin backs
                    // off and rescans.
                    if self.has_conflicting_entry(table, bucket_idx, tag, slot) {
                        slot.store(HashBucketEntry::default());
                        continue;
                    }
                    let finalized = HashBucketEntry::new(Address::NULL, tag, false);
                    slot.store(finalized);
                    self.entry_count.fetch_add(1, Ordering::SeqCst);
                    return (finalized, slot);
                }
                SlotSearch::Retry => continue,
            }
        }
    }

    /// CAS the entry from its observed value to a finalized `{tag, address}`.
    pub fn try_update_entry(
        &self,
        slot: &AtomicHashBucketEntry,
        expected: HashBucketEntry,
        new_address: Address,
        tag: u16,
    ) -> bool {
        let desired = HashBucketEntry::new(new_address, tag, false);
        slot.compare_exchange(expected, desired).is_ok()
    }

    fn search_bucket<'a>(
        &'a self,
        table: &'a HashTable,
        bucket_idx: u64,
        tag: u16,
    ) -> SlotSearch<'a> {
        let mut bucket = &table.buckets[bucket_idx as usize];
        let mut free_slot: Option<&AtomicHashBucketEntry> = None;
        loop {
            for slot in bucket.entries.iter() {
                let entry = slot.load();
                if entry.unused() {
                    if free_slot.is_none() {
                        free_slot = Some(slot);
                    }
                    continue;
                }
                if entry.tag() == tag && !entry.tentative() {
                    return SlotSearch::Match(entry, slot);
                }
            }
            let overflow = bucket.overflow_entry.load();
            if overflow.unused() {
                if let Some(slot) = free_slot {
                    return SlotSearch::Free(slot);
                }
                // Chain exhausted: link a fresh overflow bucket.
                let new_slot = self.overflow.allocate();
                let link = HashBucketOverflowEntry::new(new_slot);
                if bucket
                    .overflow_entry
                    .compare_exchange(HashBucketOverflowEntry::default(), link)
                    .is_ok()
                {
                    return SlotSearch::Free(&self.overflow.get(new_slot).entries[0]);
                }
                self.overflow.recycle(new_slot);
                return SlotSearch::Retry;
            }
            bucket = self.overflow.get(overflow.slot());
        }
    }

    fn has_conflicting_entry(
        &self,
        table: &HashTable,
        bucket_idx: u64,
        tag: u16,
        claimed: &AtomicHashBucketEntry,
    ) -> bool {
        let claimed_ptr = claimed as *const AtomicHashBucketEntry;
        let mut bucket = &table.buckets[bucket_idx as usize];
        loop {
            for slot in bucket.entries.iter() {
                if std::ptr::eq(slot, claimed_ptr) {
                    continue;
                }
                let entry = slot.load();
                if !entry.unused() && entry.tag() == tag {
                    return true;
                }
            }
            let overflow = bucket.overflow_entry.load();
            if overflow.unused() {
                return false;
            }
            bucket = self.overflow.get(overflow.slot());
        }
    }

    // --- Grow ---

    /// Installs the doubled table and opens the cooperative split. Must run
    /// inside an epoch drain action so no operation is mid-flight against
    /// the slot being overwritten.
    pub fn start_grow(&self) {
        debug_assert!(!self.grow_in_progress());
        let old_version = self.version.load(Ordering::SeqCst);
        let old_size = self.table_at(old_version).size;
        let new_size = old_size * 2;
        unsafe {
            *self.tables[1 - old_version].get() = Some(Box::new(HashTable::new(new_size)));
        }
        let chunk_count = old_size.div_ceil(K_GROW_CHUNK_BUCKETS);
        let chunks = (0..chunk_count)
            .map(|_| AtomicU8::new(K_CHUNK_PENDING))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let state = Arc::new(GrowState {
            old_version,
            old_size,
            new_size,
            chunks,
            next_chunk: AtomicU64::new(0),
            remaining: AtomicU64::new(chunk_count),
        });
        *self.grow.lock() = Some(state);
        self.grow_active.store(true, Ordering::SeqCst);
        log::info!("index grow started: {} -> {} buckets", old_size, new_size);
    }

    /// Claims and splits one chunk. Returns true while the grow is still in
    /// flight afterwards.
    pub fn help_grow(&self, resolver: HashResolver) -> bool {
        let state = self.grow.lock().clone();
        let Some(g) = state else {
            return false;
        };
        loop {
            let chunk = g.next_chunk.fetch_add(1, Ordering::SeqCst);
            if chunk >= g.chunks.len() as u64 {
                return self.grow_in_progress();
            }
            if g.chunks[chunk as usize]
                .compare_exchange(
                    K_CHUNK_PENDING,
                    K_CHUNK_BUSY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.rehash_chunk(&g, chunk, resolver);
                return self.grow_in_progress();
            }
        }
    }

    fn ensure_rehashed(&self, g: &GrowState, old_bucket: u64, resolver: HashResolver) {
        let chunk = (old_bucket / K_GROW_CHUNK_BUCKETS) as usize;
        loop {
            match g.chunks[chunk].compare_exchange(
                K_CHUNK_PENDING,
                K_CHUNK_BUSY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.rehash_chunk(g, chunk as u64, resolver);
                    return;
                }
                Err(K_CHUNK_DONE) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    fn rehash_chunk(&self, g: &GrowState, chunk: u64, resolver: HashResolver) {
        let start = chunk * K_GROW_CHUNK_BUCKETS;
        let end = min(start + K_GROW_CHUNK_BUCKETS, g.old_size);
        for bucket_idx in start..end {
            self.rehash_bucket(g, bucket_idx, resolver);
        }
        g.chunks[chunk as usize].store(K_CHUNK_DONE, Ordering::SeqCst);
        if g.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish_grow(g);
        }
    }

    fn finish_grow(&self, g: &GrowState) {
        self.version.store(1 - g.old_version, Ordering::SeqCst);
        self.grow_active.store(false, Ordering::SeqCst);
        *self.grow.lock() = None;
        log::info!("index grow complete: {} buckets", g.new_size);
    }

    fn rehash_bucket(&self, g: &GrowState, bucket_idx: u64, resolver: HashResolver) {
        let old_table = self.table_at(g.old_version);
        let new_table = self.table_at(1 - g.old_version);
        let mut bucket = &old_table.buckets[bucket_idx as usize];
        loop {
            for slot in bucket.entries.iter() {
                let entry = slot.load();
                if entry.unused() || entry.tentative() {
                    continue;
                }
                self.split_entry(g, new_table, bucket_idx, entry, resolver);
            }
            let overflow = bucket.overflow_entry.load();
            if overflow.unused() {
                break;
            }
            bucket = self.overflow.get(overflow.slot());
        }
    }

    /// Splits one source entry into its two destination buckets. The new
    /// entry for each destination points at the first chain record hashing
    /// there; deeper records stay reachable through the previous-address
    /// chain, and lookups compare keys, so a chain carrying records of the
    /// sibling bucket is merely a longer walk.
    fn split_entry(
        &self,
        g: &GrowState,
        new_table: &HashTable,
        old_bucket: u64,
        entry: HashBucketEntry,
        resolver: HashResolver,
    ) {
        let lo = old_bucket;
        let hi = old_bucket + g.old_size;
        let mut lo_addr: Option<Address> = None;
        let mut hi_addr: Option<Address> = None;
        let mut addr = entry.address();
        while !addr.is_null() && (lo_addr.is_none() || hi_addr.is_none()) {
            match resolver(addr) {
                Some((hash, previous)) => {
                    let dest = KeyHash::new(hash).table_index(g.new_size);
                    if dest == lo {
                        if lo_addr.is_none() {
                            lo_addr = Some(addr);
                        }
                    } else if hi_addr.is_none() {
                        hi_addr = Some(addr);
                    }
                    addr = previous;
                }
                None => {
                    // The chain dips below the head address; keep the whole
                    // remainder reachable from both destinations.
                    if lo_addr.is_none() {
                        lo_addr = Some(addr);
                    }
                    if hi_addr.is_none() {
                        hi_addr = Some(addr);
                    }
                    break;
                }
            }
        }
        if let Some(address) = lo_addr {
            self.install_entry(new_table, lo, entry.tag(), address);
        }
        if let Some(address) = hi_addr {
            self.install_entry(new_table, hi, entry.tag(), address);
        }
    }

    /// Stores `{tag, address}` into the first free slot of `bucket_idx`.
    /// The caller has exclusive write access to the destination bucket
    /// (grow split or single-threaded recovery).
    fn install_entry(&self, table: &HashTable, bucket_idx: u64, tag: u16, address: Address) {
        let mut bucket = &table.buckets[bucket_idx as usize];
        loop {
            for slot in bucket.entries.iter() {
                if slot.load().unused() {
                    slot.store(HashBucketEntry::new(address, tag, false));
                    return;
                }
            }
            let overflow = bucket.overflow_entry.load();
            if overflow.unused() {
                let new_slot = self.overflow.allocate();
                let link = HashBucketOverflowEntry::new(new_slot);
                bucket
                    .overflow_entry
                    .compare_exchange(HashBucketOverflowEntry::default(), link)
                    .ok();
                bucket = self.overflow.get(bucket.overflow_entry.load().slot());
                continue;
            }
            bucket = self.overflow.get(overflow.slot());
        }
    }

    // --- Checkpoint image ---

    /// Snapshots the live table as `(bucket_index, entry_control)` pairs.
    /// `resolve` maps each entry address to the one the image should carry
    /// (dropping records that postdate the checkpoint cut); entries that
    /// resolve to null are omitted.
    pub fn collect_image(&self, resolve: impl Fn(Address) -> Option<Address>) -> Vec<(u64, u64)> {
        let table = self.table_at(self.version.load(Ordering::SeqCst));
        let mut image = Vec::new();
        for bucket_idx in 0..table.size {
            let mut bucket = &table.buckets[bucket_idx as usize];
            loop {
                for slot in bucket.entries.iter() {
                    let entry = slot.load();
                    if entry.unused() || entry.tentative() {
                        continue;
                    }
                    if let Some(address) = resolve(entry.address())
                        && !address.is_null()
                    {
                        let resolved = HashBucketEntry::new(address, entry.tag(), false);
                        image.push((bucket_idx, resolved.control()));
                    }
                }
                let overflow = bucket.overflow_entry.load();
                if overflow.unused() {
                    break;
                }
                bucket = self.overflow.get(overflow.slot());
            }
        }
        image
    }

    /// Replays an image produced by `collect_image`. Single-threaded, at
    /// recovery time.
    pub fn restore_image(&self, image: &[(u64, u64)]) {
        let table = self.table_at(self.version.load(Ordering::SeqCst));
        for &(bucket_idx, control) in image {
            let entry = HashBucketEntry::from_control(control);
            debug_assert!(bucket_idx < table.size);
            self.install_entry(table, bucket_idx % table.size, entry.tag(), entry.address());
            self.entry_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Points the entry for `hash` at `address` unless it already references
    /// a younger record. Single-threaded, at recovery time.
    pub fn recover_update_entry(&self, hash: KeyHash, address: Address) {
        let resolver: &dyn Fn(Address) -> Option<(u64, Address)> = &|_| None;
        let (_, slot) = self.find_or_create_entry(hash, resolver);
        loop {
            let current = slot.load();
            if current.address() >= address {
                return;
            }
            if slot
                .compare_exchange(current, HashBucketEntry::new(address, hash.tag(), false))
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_resolver() -> impl Fn(Address) -> Option<(u64, Address)> {
        |_| None
    }

    #[test]
    fn create_then_find() {
        let index = MemHashIndex::new(16);
        let hash = KeyHash::new(0xabcd_0000_0000_0007);
        let resolver = no_resolver();

        assert!(index.find_entry(hash, &resolver).is_none());
        let (entry, slot) = index.find_or_create_entry(hash, &resolver);
        assert!(entry.address().is_null());
        assert!(index.try_update_entry(slot, entry, Address::from_control(0x80), hash.tag()));

        let (found, _) = index.find_entry(hash, &resolver).unwrap();
        assert_eq!(found.address().control(), 0x80);
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn stale_cas_fails() {
        let index = MemHashIndex::new(16);
        let hash = KeyHash::new(42);
        let resolver = no_resolver();
        let (entry, slot) = index.find_or_create_entry(hash, &resolver);
        assert!(index.try_update_entry(slot, entry, Address::from_control(0x100), hash.tag()));
        // A second update against the stale snapshot must fail.
        assert!(!index.try_update_entry(slot, entry, Address::from_control(0x180), hash.tag()));
    }

    #[test]
    fn bucket_overflow_chains() {
        let index = MemHashIndex::new(1);
        let resolver = no_resolver();
        // A single bucket holds 7 entries; the rest spill into overflow
        // buckets. Distinct tags come from the hash high bits.
        for i in 0..40u64 {
            let hash = KeyHash::new(i << 48);
            let (entry, slot) = index.find_or_create_entry(hash, &resolver);
            assert!(index.try_update_entry(
                slot,
                entry,
                Address::from_control(0x80 + i * 8),
                hash.tag()
            ));
        }
        for i in 0..40u64 {
            let hash = KeyHash::new(i << 48);
            let (found, _) = index.find_entry(hash, &resolver).unwrap();
            assert_eq!(found.address().control(), 0x80 + i * 8);
        }
        assert_eq!(index.entry_count(), 40);
    }
}
