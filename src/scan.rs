//! In-memory scan iterator: walks live records between two addresses in
//! the resident portion of the log.
//!
//! The iterator owns an epoch entry for its whole lifetime, so the head
//! address cannot advance past its cursor and every record it yields stays
//! mapped until the next `get_next` call (or drop). It does not coordinate
//! with writers: a yielded record may have been logically superseded, but
//! never reclaimed.

use std::sync::Arc;

use crate::core::address::Address;
use crate::core::record::{KvKey, KvValue, Record};
use crate::common::{KvError, Result};
use crate::device::StorageDevice;
use crate::store::HlKv;

pub struct ScanIterator<K: KvKey, V: KvValue, D: StorageDevice> {
    store: Arc<HlKv<K, V, D>>,
    slot: usize,
    cursor: Address,
    end: Address,
}

impl<K: KvKey, V: KvValue, D: StorageDevice> ScanIterator<K, V, D> {
    pub(crate) fn new(
        store: Arc<HlKv<K, V, D>>,
        begin_scan: Address,
        end_scan: Address,
    ) -> Result<Self> {
        let head = store.head_address();
        assert!(
            begin_scan >= head && end_scan >= head,
            "scan bounds [{}, {}) fall below the head address {}",
            begin_scan,
            end_scan,
            head
        );
        let slot = store
            .epoch
            .acquire_entry()
            .ok_or(KvError::SessionLimit {
                limit: crate::epoch::K_MAX_SESSIONS,
            })?;
        store.epoch.protect(slot);
        Ok(ScanIterator {
            store,
            slot,
            cursor: begin_scan,
            end: end_scan,
        })
    }

    /// Advances to the next live record and returns borrowed views of its
    /// key and value. The borrow is valid until the next call. Returns
    /// `None` once the cursor reaches the end of the scan range.
    ///
    /// Panics if the cursor has fallen below the head address; per the
    /// engine contract that is a programmer error (`Status::Aborted`-class,
    /// fatal) rather than a recoverable condition.
    #[allow(clippy::should_implement_trait)]
    pub fn get_next(&mut self) -> Option<(&K, &V)> {
        let page_size = self.store.hlog.page_size();
        let page_bits = page_size.trailing_zeros();
        loop {
            if self.cursor >= self.end {
                return None;
            }
            assert!(
                self.cursor >= self.store.head_address(),
                "scan cursor {} fell below the head address",
                self.cursor
            );
            // Too close to the page edge to hold a header: skip ahead.
            if page_size - self.cursor.offset(page_bits) < Record::<K, V>::K_HEADER_SIZE {
                self.cursor = self.cursor.next_page_start(page_bits);
                continue;
            }
            let Some(ptr) = self.store.hlog.get(self.cursor) else {
                self.cursor = self.cursor.next_page_start(page_bits);
                continue;
            };
            let header = unsafe { Record::<K, V>::header(ptr) }.load();
            if header.is_null() {
                // Unwritten remainder of a page (allocation straddle).
                self.cursor = self.cursor.next_page_start(page_bits);
                continue;
            }
            let size = unsafe { Record::<K, V>::size_at(ptr) };
            self.cursor += size as u64;
            if header.invalid() || header.tombstone() {
                continue;
            }
            unsafe {
                return Some((Record::<K, V>::key(ptr), Record::<K, V>::value(ptr)));
            }
        }
    }

    /// Address the cursor will examine next.
    pub fn cursor(&self) -> Address {
        self.cursor
    }
}

impl<K: KvKey, V: KvValue, D: StorageDevice> Drop for ScanIterator<K, V, D> {
    fn drop(&mut self) {
        self.store.epoch.unprotect(self.slot);
        self.store.epoch.release_entry(self.slot);
    }
}
