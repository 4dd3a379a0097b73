use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::address::Address;
use crate::index::key_hash::KeyHash;

/// Entry stored in a hash bucket, packed into 8 bytes:
/// `{ address: 48, tag: 14, tentative: 1, reserved: 1 }`.
///
/// A control word of zero marks a free slot; live record addresses start
/// past the reserved first bytes of page zero, so a used entry can never
/// collide with the free encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    pub const K_INVALID_ENTRY: u64 = 0;

    const K_ADDRESS_BITS: u32 = 48;
    const K_ADDRESS_MASK: u64 = (1 << Self::K_ADDRESS_BITS) - 1;
    const K_TAG_SHIFT: u32 = Self::K_ADDRESS_BITS;
    const K_TAG_MASK: u64 = (1 << KeyHash::K_TAG_BITS) - 1;
    const K_TENTATIVE_SHIFT: u32 = Self::K_TAG_SHIFT + KeyHash::K_TAG_BITS;

    pub fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::K_ADDRESS_MASK;
        control |= (tag as u64 & Self::K_TAG_MASK) << Self::K_TAG_SHIFT;
        if tentative {
            control |= 1 << Self::K_TENTATIVE_SHIFT;
        }
        HashBucketEntry(control)
    }

    #[inline]
    pub fn from_control(control: u64) -> Self {
        HashBucketEntry(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn unused(&self) -> bool {
        self.0 == Self::K_INVALID_ENTRY
    }

    #[inline]
    pub fn address(&self) -> Address {
        Address::from_control(self.0 & Self::K_ADDRESS_MASK)
    }

    #[inline]
    pub fn tag(&self) -> u16 {
        ((self.0 >> Self::K_TAG_SHIFT) & Self::K_TAG_MASK) as u16
    }

    #[inline]
    pub fn tentative(&self) -> bool {
        (self.0 >> Self::K_TENTATIVE_SHIFT) & 1 != 0
    }
}

/// Atomic hash-bucket entry.
#[derive(Default)]
#[repr(transparent)]
pub struct AtomicHashBucketEntry(AtomicU64);

impl AtomicHashBucketEntry {
    #[inline]
    pub fn load(&self) -> HashBucketEntry {
        HashBucketEntry(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, desired: HashBucketEntry) {
        self.0.store(desired.control(), Ordering::SeqCst)
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        match self.0.compare_exchange(
            current.control(),
            new.control(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(v) => Ok(HashBucketEntry(v)),
            Err(v) => Err(HashBucketEntry(v)),
        }
    }
}

/// Link to the next overflow bucket: a 1-based slot index into the bucket
/// arena, with zero meaning "end of chain".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct HashBucketOverflowEntry(u64);

impl HashBucketOverflowEntry {
    pub fn new(slot: u64) -> Self {
        debug_assert!(slot != 0);
        HashBucketOverflowEntry(slot)
    }

    #[inline]
    pub fn unused(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn slot(&self) -> u64 {
        self.0
    }
}

/// Atomic overflow link.
#[derive(Default)]
#[repr(transparent)]
pub struct AtomicHashBucketOverflowEntry(AtomicU64);

impl AtomicHashBucketOverflowEntry {
    #[inline]
    pub fn load(&self) -> HashBucketOverflowEntry {
        HashBucketOverflowEntry(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketOverflowEntry,
        new: HashBucketOverflowEntry,
    ) -> Result<HashBucketOverflowEntry, HashBucketOverflowEntry> {
        match self
            .0
            .compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(v) => Ok(HashBucketOverflowEntry(v)),
            Err(v) => Err(HashBucketOverflowEntry(v)),
        }
    }
}

/// A bucket of 7 entries plus the overflow link. Fits a cache line.
#[derive(Default)]
#[repr(align(64))]
pub struct HashBucket {
    pub entries: [AtomicHashBucketEntry; 7],
    pub overflow_entry: AtomicHashBucketOverflowEntry,
}

pub const K_ENTRIES_PER_BUCKET: usize = 7;

static_assertions::assert_eq_size!(HashBucket, [u8; 64]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bit_layout() {
        let entry = HashBucketEntry::new(Address::from_control(0xdead_beef), 0x2abc, true);
        assert_eq!(entry.address().control(), 0xdead_beef);
        assert_eq!(entry.tag(), 0x2abc);
        assert!(entry.tentative());
        assert!(!entry.unused());
    }

    #[test]
    fn free_encoding_is_all_zero() {
        let entry = HashBucketEntry::default();
        assert!(entry.unused());
        assert_eq!(entry.control(), HashBucketEntry::K_INVALID_ENTRY);
    }

    #[test]
    fn atomic_entry_cas() {
        let slot = AtomicHashBucketEntry::default();
        let desired = HashBucketEntry::new(Address::from_control(0x80), 7, false);
        assert!(slot.compare_exchange(HashBucketEntry::default(), desired).is_ok());
        assert_eq!(slot.load(), desired);
        assert!(slot.compare_exchange(HashBucketEntry::default(), desired).is_err());
    }
}
