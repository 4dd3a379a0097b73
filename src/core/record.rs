use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::address::Address;
use crate::core::gen_lock::AtomicGenLock;
use crate::core::utility::pad8;
use crate::index::key_hash::KeyHash;

/// Contract for key types stored in the log.
///
/// Keys must be trivially relocatable: a key is written into a record by
/// copying `size()` bytes starting at `&self`, so any trailing payload a
/// variable-length key describes must sit directly behind the fixed header
/// in memory and contain no pointers outside the record bytes. Key and
/// value types must not require alignment beyond 8 bytes; the log places
/// them on 8-byte boundaries.
pub trait KvKey: PartialEq + Sized + Send + Sync + 'static {
    /// Total bytes the key occupies inline in a record, including the fixed
    /// header. Plain fixed-layout keys use the default.
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }

    /// 64-bit hash of the key. Must be deterministic across process
    /// restarts, or recovered index images will not line up.
    fn key_hash(&self) -> KeyHash;
}

/// Contract for value types stored in the log.
///
/// Like keys, values are self-describing: `size()` is read back off the
/// record bytes, so a zero-initialized value (a tombstone's value region)
/// must report `size_of::<Self>()`. Types that opt into in-place mutation
/// reserve their first 8 bytes for the generation lock.
pub trait KvValue: Sized + Send + Sync + 'static {
    /// Whether the value supports in-place mutation under the embedded
    /// generation lock.
    const IN_PLACE: bool = false;

    /// Total bytes the value occupies inline in a record.
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

impl KvKey for u64 {
    fn key_hash(&self) -> KeyHash {
        KeyHash::of_bytes(&self.to_le_bytes())
    }
}

impl KvValue for u64 {}

/// Record header. Occupies the first 8 bytes of every record:
/// `{ previous_address: 48, version: 13, in_new_version: 1, tombstone: 1, invalid: 1 }`.
/// The version field carries the low bits of the engine's checkpoint version
/// at append time; recovery uses it to drop records that postdate a cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RecordHeader(u64);

impl RecordHeader {
    pub const K_PREVIOUS_ADDRESS_BITS: u32 = 48;
    pub const K_VERSION_BITS: u32 = 13;

    const K_PREVIOUS_ADDRESS_MASK: u64 = (1 << Self::K_PREVIOUS_ADDRESS_BITS) - 1;
    const K_VERSION_MASK: u64 = (1 << Self::K_VERSION_BITS) - 1;
    const K_VERSION_SHIFT: u32 = Self::K_PREVIOUS_ADDRESS_BITS;
    const K_IN_NEW_VERSION_SHIFT: u32 = Self::K_VERSION_SHIFT + Self::K_VERSION_BITS;
    const K_TOMBSTONE_SHIFT: u32 = Self::K_IN_NEW_VERSION_SHIFT + 1;
    const K_INVALID_SHIFT: u32 = Self::K_TOMBSTONE_SHIFT + 1;

    pub const K_INVALID_BIT: u64 = 1 << Self::K_INVALID_SHIFT;

    pub fn new(
        previous_address: Address,
        version: u16,
        in_new_version: bool,
        tombstone: bool,
    ) -> Self {
        let mut control = previous_address.control() & Self::K_PREVIOUS_ADDRESS_MASK;
        control |= (version as u64 & Self::K_VERSION_MASK) << Self::K_VERSION_SHIFT;
        if in_new_version {
            control |= 1 << Self::K_IN_NEW_VERSION_SHIFT;
        }
        if tombstone {
            control |= 1 << Self::K_TOMBSTONE_SHIFT;
        }
        RecordHeader(control)
    }

    #[inline]
    pub fn from_control(control: u64) -> Self {
        RecordHeader(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    /// An all-zero header marks the unwritten remainder of a page.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::from_control(self.0 & Self::K_PREVIOUS_ADDRESS_MASK)
    }

    #[inline]
    pub fn version(&self) -> u16 {
        ((self.0 >> Self::K_VERSION_SHIFT) & Self::K_VERSION_MASK) as u16
    }

    #[inline]
    pub fn in_new_version(&self) -> bool {
        (self.0 >> Self::K_IN_NEW_VERSION_SHIFT) & 1 != 0
    }

    #[inline]
    pub fn tombstone(&self) -> bool {
        (self.0 >> Self::K_TOMBSTONE_SHIFT) & 1 != 0
    }

    #[inline]
    pub fn invalid(&self) -> bool {
        (self.0 >> Self::K_INVALID_SHIFT) & 1 != 0
    }
}

/// Atomic view of a record's header word. Headers are mutated with CAS:
/// installing the previous-address chain link at append time and flipping
/// the invalid bit when a bucket CAS loses a race.
#[repr(transparent)]
pub struct AtomicRecordHeader(AtomicU64);

impl AtomicRecordHeader {
    /// # Safety
    /// `ptr` must point at the 8-byte-aligned first word of a record that
    /// stays live for `'a` (the caller holds an epoch entry).
    #[inline]
    pub unsafe fn from_raw<'a>(ptr: *const u8) -> &'a AtomicRecordHeader {
        debug_assert!(ptr as usize % 8 == 0);
        unsafe { &*(ptr as *const AtomicRecordHeader) }
    }

    #[inline]
    pub fn load(&self) -> RecordHeader {
        RecordHeader(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, header: RecordHeader) {
        self.0.store(header.control(), Ordering::Release)
    }

    /// Marks the record invalid so chain walkers skip it.
    #[inline]
    pub fn set_invalid(&self) {
        self.0.fetch_or(RecordHeader::K_INVALID_BIT, Ordering::AcqRel);
    }
}

/// Physical record layout over raw log bytes:
/// header (8 bytes) | key (8-byte aligned) | value (8-byte aligned).
///
/// Records are never moved once written; all accessors work on a raw pointer
/// to the record's first byte, which the caller obtained from the log while
/// holding an epoch entry.
pub struct Record<K, V> {
    _marker: PhantomData<(K, V)>,
}

impl<K: KvKey, V: KvValue> Record<K, V> {
    pub const K_HEADER_SIZE: u32 = 8;

    /// Bytes a record with the given key and value sizes occupies in the log.
    #[inline]
    pub fn required_size(key_size: u32, value_size: u32) -> u32 {
        Self::K_HEADER_SIZE + pad8(key_size) + pad8(value_size)
    }

    /// # Safety
    /// `record` must point at a live, fully written record of this shape.
    #[inline]
    pub unsafe fn header<'a>(record: *const u8) -> &'a AtomicRecordHeader {
        unsafe { AtomicRecordHeader::from_raw(record) }
    }

    /// # Safety
    /// `record` must point at a live, fully written record of this shape.
    #[inline]
    pub unsafe fn key<'a>(record: *const u8) -> &'a K {
        unsafe { &*(record.add(Self::K_HEADER_SIZE as usize) as *const K) }
    }

    #[inline]
    fn value_offset(key_size: u32) -> usize {
        (Self::K_HEADER_SIZE + pad8(key_size)) as usize
    }

    /// # Safety
    /// `record` must point at a live record of this shape.
    #[inline]
    pub unsafe fn value_ptr(record: *const u8) -> *const u8 {
        unsafe {
            let key = Self::key(record);
            record.add(Self::value_offset(key.size()))
        }
    }

    /// # Safety
    /// `record` must point at a live record of this shape.
    #[inline]
    pub unsafe fn value<'a>(record: *const u8) -> &'a V {
        unsafe { &*(Self::value_ptr(record) as *const V) }
    }

    /// # Safety
    /// `record` must point at a live record of this shape, and the caller
    /// must be entitled to mutate it (mutable region, generation lock held
    /// where the value carries one).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn value_mut<'a>(record: *mut u8) -> &'a mut V {
        unsafe { &mut *(Self::value_ptr(record) as *mut V) }
    }

    /// The value's embedded generation lock. Only meaningful when
    /// `V::IN_PLACE` is true.
    ///
    /// # Safety
    /// `record` must point at a live record of this shape.
    #[inline]
    pub unsafe fn gen_lock<'a>(record: *const u8) -> &'a AtomicGenLock {
        debug_assert!(V::IN_PLACE);
        unsafe { AtomicGenLock::from_raw(Self::value_ptr(record)) }
    }

    /// Total size of the record at `record`, parsed back off its bytes.
    ///
    /// # Safety
    /// `record` must point at a live, fully written record of this shape.
    #[inline]
    pub unsafe fn size_at(record: *const u8) -> u32 {
        unsafe {
            let key_size = Self::key(record).size();
            let value_size = Self::value(record).size();
            Self::required_size(key_size, value_size)
        }
    }
}
