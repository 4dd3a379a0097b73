use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

/// A logical address into the hybrid log: a 48-bit, monotonically increasing
/// byte offset. The log interprets an address as `(page, offset)` where the
/// page size is a configured power of two; the remaining 16 bits of the word
/// are reserved for use by the hash table (control bits and the tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    pub const K_ADDRESS_BITS: u64 = 48;
    pub const K_MAX_ADDRESS: u64 = (1 << Self::K_ADDRESS_BITS) - 1;

    /// Address 0 is the null sentinel: record chains terminate here and an
    /// entry carrying it points at nothing.
    pub const NULL: Address = Address(0);

    /// The first byte the allocator ever hands out. The first 64 bytes of
    /// page zero stay reserved so that no live record is stored at the null
    /// address.
    pub const K_FIRST_ADDRESS: u64 = 64;

    /// Creates an `Address` from a raw control value. The reserved high bits
    /// must be zero.
    #[inline]
    pub fn from_control(control: u64) -> Self {
        debug_assert!(
            control >> Self::K_ADDRESS_BITS == 0,
            "invalid address control value {:#x}: reserved bits set",
            control
        );
        Address(control)
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Page index under a log with pages of `1 << page_bits` bytes.
    #[inline]
    pub fn page(&self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    /// Offset within the page under a log with pages of `1 << page_bits` bytes.
    #[inline]
    pub fn offset(&self, page_bits: u32) -> u32 {
        (self.0 & ((1u64 << page_bits) - 1)) as u32
    }

    /// First address of the next page.
    #[inline]
    pub fn next_page_start(&self, page_bits: u32) -> Address {
        Address((self.page(page_bits) + 1) << page_bits)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(control: u64) -> Self {
        Address::from_control(control)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl Add<u64> for Address {
    type Output = Self;
    fn add(self, delta: u64) -> Self::Output {
        let new_control = self.0 + delta;
        debug_assert!(
            new_control >> Self::K_ADDRESS_BITS == 0,
            "address addition overflowed: {:#x} + {:#x}",
            self.0,
            delta
        );
        Address(new_control)
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, delta: u64) {
        *self = *self + delta;
    }
}

impl Sub for Address {
    type Output = u64;
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

/// Atomic logical address. Anchor advances are monotonic, so the only write
/// primitives offered are `store` (initialization/recovery) and `fetch_max`.
#[derive(Default)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    pub fn new(address: Address) -> Self {
        AtomicAddress(AtomicU64::new(address.control()))
    }

    #[inline]
    pub fn load(&self) -> Address {
        Address(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, value: Address) {
        self.0.store(value.control(), Ordering::SeqCst)
    }

    /// Monotonic advance; returns the previous value.
    #[inline]
    pub fn fetch_max(&self, value: Address) -> Address {
        Address(self.0.fetch_max(value.control(), Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_offset_round_trip() {
        let page_bits = 20; // 1 MiB pages
        let a = Address::from_control((7 << page_bits) | 4096);
        assert_eq!(a.page(page_bits), 7);
        assert_eq!(a.offset(page_bits), 4096);
        assert_eq!(a.next_page_start(page_bits).control(), 8 << page_bits);
    }

    #[test]
    fn atomic_address_is_monotonic() {
        let a = AtomicAddress::new(Address::from_control(100));
        a.fetch_max(Address::from_control(50));
        assert_eq!(a.load().control(), 100);
        a.fetch_max(Address::from_control(200));
        assert_eq!(a.load().control(), 200);
    }
}
