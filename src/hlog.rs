//! The hybrid log: an append-only byte log partitioned into fixed-size
//! pages, with a circular buffer of resident page frames.
//!
//! Five monotonic anchors partition the address space:
//!
//! - `[0, begin)` — truncated, gone.
//! - `[begin, head)` — on the device only.
//! - `[head, safe_read_only)` — resident, immutable, fully flushed.
//! - `[safe_read_only, read_only)` — resident, immutable, flush in flight.
//! - `[read_only, tail)` — resident and mutable in place.
//!
//! Anchor advances ride the epoch manager: the read-only boundary moves
//! eagerly, while the safe-read-only and head boundaries move inside drain
//! actions, after every session has observed the transition.

use std::alloc::Layout;
use std::cmp::min;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{Config, KvError, Result};
use crate::core::address::{Address, AtomicAddress};
use crate::core::status::Status;
use crate::core::utility::pad8;
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;

/// Tail allocation cursor packing `{ page: 32, offset: 32 }`. The offset
/// half gets headroom beyond the page size so racing reservations can
/// overshoot harmlessly until the crossing thread seals the page.
struct AtomicPageOffset(AtomicU64);

impl AtomicPageOffset {
    fn new(page: u64, offset: u64) -> Self {
        AtomicPageOffset(AtomicU64::new((page << 32) | offset))
    }

    #[inline]
    fn load(&self) -> (u64, u64) {
        let control = self.0.load(Ordering::SeqCst);
        (control >> 32, control & 0xffff_ffff)
    }

    fn store(&self, page: u64, offset: u64) {
        self.0.store((page << 32) | offset, Ordering::SeqCst);
    }

    /// Reserves `size` bytes; returns the pre-reservation cursor.
    #[inline]
    fn reserve(&self, size: u64) -> (u64, u64) {
        let control = self.0.fetch_add(size, Ordering::SeqCst);
        (control >> 32, control & 0xffff_ffff)
    }

    /// Moves the cursor to the start of the page after `old_page`. Discards
    /// every overshooting reservation made against `old_page`.
    fn seal_to_next_page(&self, old_page: u64) {
        let mut current = self.0.load(Ordering::SeqCst);
        while current >> 32 == old_page {
            match self.0.compare_exchange(
                current,
                (old_page + 1) << 32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// One slot of the circular resident-page buffer.
struct Frame {
    /// Page number currently held, or `u64::MAX` when empty.
    page: AtomicU64,
    data: AtomicPtr<u8>,
}

impl Frame {
    fn empty() -> Self {
        Frame {
            page: AtomicU64::new(u64::MAX),
            data: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

fn page_layout(page_size: u32) -> Layout {
    Layout::from_size_align(page_size as usize, 64).expect("page layout")
}

fn alloc_page_buffer(page_size: u32) -> Option<*mut u8> {
    let ptr = unsafe { std::alloc::alloc_zeroed(page_layout(page_size)) };
    if ptr.is_null() { None } else { Some(ptr) }
}

unsafe fn free_page_buffer(ptr: *mut u8, page_size: u32) {
    unsafe { std::alloc::dealloc(ptr, page_layout(page_size)) }
}

pub struct HybridLog<D: StorageDevice> {
    myself: Weak<HybridLog<D>>,
    page_size: u32,
    page_bits: u32,
    num_frames: u32,
    mutable_pages: u32,
    frames: Box<[Frame]>,

    begin: AtomicAddress,
    head: AtomicAddress,
    safe_read_only: AtomicAddress,
    read_only: AtomicAddress,
    flushed_until: AtomicAddress,
    tail: AtomicPageOffset,

    /// Checkpoint version stamped into record headers (low 13 bits).
    version: AtomicU32,
    /// While set, appended records carry the in-new-version mark.
    new_version_mode: AtomicBool,

    device: D,
    flush_lock: Mutex<()>,
    epoch: Arc<LightEpoch>,
}

unsafe impl<D: StorageDevice> Send for HybridLog<D> {}
unsafe impl<D: StorageDevice> Sync for HybridLog<D> {}

impl<D: StorageDevice> HybridLog<D> {
    pub fn new(config: &Config, device: D, epoch: Arc<LightEpoch>) -> Result<Arc<Self>> {
        config.validate()?;
        let page_size = config.page_size;
        let page_bits = page_size.trailing_zeros();
        let num_frames = config.frame_count();
        let mutable_pages =
            ((num_frames as f64 * config.mutable_fraction) as u32).clamp(1, num_frames);

        let frames: Box<[Frame]> = (0..num_frames).map(|_| Frame::empty()).collect();
        let first = alloc_page_buffer(page_size).ok_or_else(|| KvError::OutOfMemory {
            message: "initial log page allocation failed".to_string(),
        })?;
        frames[0].data.store(first, Ordering::Release);
        frames[0].page.store(0, Ordering::Release);

        let start = Address::from_control(Address::K_FIRST_ADDRESS);
        Ok(Arc::new_cyclic(|weak| HybridLog {
            myself: weak.clone(),
            page_size,
            page_bits,
            num_frames,
            mutable_pages,
            frames,
            begin: AtomicAddress::new(start),
            head: AtomicAddress::new(start),
            safe_read_only: AtomicAddress::new(start),
            read_only: AtomicAddress::new(start),
            flushed_until: AtomicAddress::new(start),
            tail: AtomicPageOffset::new(0, Address::K_FIRST_ADDRESS),
            version: AtomicU32::new(1),
            new_version_mode: AtomicBool::new(false),
            device,
            flush_lock: Mutex::new(()),
            epoch,
        }))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn begin_address(&self) -> Address {
        self.begin.load()
    }

    pub fn head_address(&self) -> Address {
        self.head.load()
    }

    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only.load()
    }

    pub fn read_only_address(&self) -> Address {
        self.read_only.load()
    }

    pub fn tail_address(&self) -> Address {
        let (page, offset) = self.tail.load();
        Address::from_control((page << self.page_bits) + min(offset, self.page_size as u64))
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Version stamped into records appended right now.
    pub fn current_version(&self) -> u16 {
        (self.version.load(Ordering::SeqCst) & 0x1fff) as u16
    }

    /// Full 32-bit checkpoint version word.
    pub(crate) fn version_word(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_version(&self) -> u16 {
        ((self.version.fetch_add(1, Ordering::SeqCst) + 1) & 0x1fff) as u16
    }

    pub(crate) fn set_new_version_mode(&self, on: bool) {
        self.new_version_mode.store(on, Ordering::SeqCst);
    }

    pub(crate) fn in_new_version_mode(&self) -> bool {
        self.new_version_mode.load(Ordering::SeqCst)
    }

    /// Reserves `size` bytes (rounded to the 8-byte record granularity) and
    /// returns the record's address. A reservation that would straddle a
    /// page boundary is discarded; the straddling thread opens the next
    /// page and every racer retries there.
    pub fn allocate(&self, size: u32, slot: usize) -> std::result::Result<Address, Status> {
        let size = pad8(size) as u64;
        if size == 0 || size > self.page_size as u64 {
            return Err(Status::OutOfMemory);
        }
        loop {
            let (page, offset) = self.tail.reserve(size);
            if offset + size <= self.page_size as u64 {
                return Ok(Address::from_control((page << self.page_bits) + offset));
            }
            if offset <= self.page_size as u64 {
                // This reservation was the one that crossed the boundary.
                self.open_next_page(page, slot)?;
            } else {
                while self.tail.load().0 == page {
                    self.epoch.refresh(slot);
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn open_next_page(&self, old_page: u64, slot: usize) -> std::result::Result<(), Status> {
        let new_page = old_page + 1;

        // Keep at most `mutable_pages` pages writable in place.
        if new_page + 1 > self.mutable_pages as u64 {
            let ro_page = new_page + 1 - self.mutable_pages as u64;
            self.shift_read_only(Address::from_control(ro_page << self.page_bits));
        }

        // The frame about to be reused must be fully evicted first.
        if new_page >= self.num_frames as u64 {
            let required_head =
                Address::from_control((new_page - self.num_frames as u64 + 1) << self.page_bits);
            if self.head_address() < required_head {
                self.shift_read_only(required_head);
                while self.safe_read_only_address() < required_head {
                    self.epoch.refresh(slot);
                    std::hint::spin_loop();
                }
                self.shift_head(required_head);
                while self.head_address() < required_head {
                    self.epoch.refresh(slot);
                    std::hint::spin_loop();
                }
            }
        }

        let frame = &self.frames[(new_page % self.num_frames as u64) as usize];
        let fresh = alloc_page_buffer(self.page_size).ok_or(Status::OutOfMemory)?;
        let old = frame.data.swap(fresh, Ordering::AcqRel);
        frame.page.store(new_page, Ordering::Release);
        if !old.is_null() {
            // Safe: head moved past the old page inside a drain action, so
            // no session can still dereference into it.
            unsafe { free_page_buffer(old, self.page_size) };
        }
        log::debug!("hybrid log opened page {}", new_page);

        self.tail.seal_to_next_page(old_page);
        Ok(())
    }

    /// Pointer to the byte at `address`, while it is resident. Callers must
    /// hold an epoch entry and have checked `address >= head`.
    #[inline]
    pub fn get(&self, address: Address) -> Option<*mut u8> {
        let page = address.page(self.page_bits);
        let frame = &self.frames[(page % self.num_frames as u64) as usize];
        if frame.page.load(Ordering::Acquire) != page {
            return None;
        }
        let data = frame.data.load(Ordering::Acquire);
        if data.is_null() {
            return None;
        }
        Some(unsafe { data.add(address.offset(self.page_bits) as usize) })
    }

    /// Advances the read-only boundary and schedules the flush plus
    /// safe-read-only advance behind an epoch bump.
    pub fn shift_read_only(&self, target: Address) {
        let target = min(target, self.tail_address());
        let prev = self.read_only.fetch_max(target);
        if prev >= target {
            return;
        }
        log::debug!("read-only boundary advanced to {}", target);
        let weak = self.myself.clone();
        self.epoch.bump_epoch(Box::new(move || {
            if let Some(log) = weak.upgrade() {
                if let Err(e) = log.flush_until(target) {
                    log::error!("flush up to {} failed: {}", target, e);
                    return;
                }
                log.safe_read_only.fetch_max(target);
            }
        }));
    }

    /// Advances the read-only boundary to the current tail.
    pub fn shift_read_only_to_tail(&self) -> Address {
        let tail = self.tail_address();
        self.shift_read_only(tail);
        tail
    }

    fn shift_head(&self, target: Address) {
        debug_assert!(target <= self.safe_read_only_address());
        let weak = self.myself.clone();
        self.epoch.bump_epoch(Box::new(move || {
            if let Some(log) = weak.upgrade() {
                log.head.fetch_max(target);
                log::debug!("head advanced to {}", target);
            }
        }));
    }

    /// Writes `[flushed_until, target)` out through the device.
    pub(crate) fn flush_until(&self, target: Address) -> Result<()> {
        let _guard = self.flush_lock.lock();
        let mut cursor = self.flushed_until.load();
        if cursor >= target {
            return Ok(());
        }
        while cursor < target {
            let end = min(cursor.next_page_start(self.page_bits), target);
            let ptr = self.get(cursor).ok_or_else(|| KvError::Corruption {
                message: format!("flush source page for {} not resident", cursor),
            })?;
            let len = (end - cursor) as usize;
            let data = unsafe { std::slice::from_raw_parts(ptr, len) };
            self.device.write(cursor.control(), data)?;
            cursor = end;
        }
        self.device.flush()?;
        self.flushed_until.fetch_max(target);
        Ok(())
    }

    /// Rebuilds in-memory state from a recovered checkpoint: anchors are
    /// reset and the pages of `[head, tail)` are read back off the device.
    pub(crate) fn restore(
        &self,
        begin: Address,
        head: Address,
        tail: Address,
        version: u32,
    ) -> Result<()> {
        let head_page = head.page(self.page_bits);
        let tail_page = tail.page(self.page_bits);
        if tail_page - head_page >= self.num_frames as u64 {
            return Err(KvError::RecoveryFailed {
                message: format!(
                    "recovered span of {} pages exceeds the {} resident frames",
                    tail_page - head_page + 1,
                    self.num_frames
                ),
            });
        }

        self.begin.store(begin);
        self.head.store(head);
        self.read_only.store(tail);
        self.safe_read_only.store(tail);
        self.flushed_until.store(tail);
        self.tail
            .store(tail_page, tail.offset(self.page_bits) as u64);
        self.version.store(version, Ordering::SeqCst);

        for page in head_page..=tail_page {
            let frame = &self.frames[(page % self.num_frames as u64) as usize];
            let buf = alloc_page_buffer(self.page_size).ok_or_else(|| KvError::OutOfMemory {
                message: "recovery page allocation failed".to_string(),
            })?;
            let page_start = Address::from_control(page << self.page_bits);
            let end = min(page_start.next_page_start(self.page_bits), tail);
            if end > page_start {
                let len = (end - page_start) as usize;
                let data = unsafe { std::slice::from_raw_parts_mut(buf, len) };
                let n = self.device.read(page_start.control(), data)?;
                if n < len {
                    unsafe { free_page_buffer(buf, self.page_size) };
                    return Err(KvError::Corruption {
                        message: format!(
                            "log page {} truncated on device: {} of {} bytes",
                            page, n, len
                        ),
                    });
                }
            }
            let old = frame.data.swap(buf, Ordering::AcqRel);
            frame.page.store(page, Ordering::Release);
            if !old.is_null() {
                unsafe { free_page_buffer(old, self.page_size) };
            }
        }
        log::info!(
            "hybrid log restored: begin {} head {} tail {}",
            begin,
            head,
            tail
        );
        Ok(())
    }

    /// Bytes the log has ever allocated, beginning at truncation.
    pub fn size(&self) -> u64 {
        self.tail_address() - self.begin_address()
    }
}

impl<D: StorageDevice> Drop for HybridLog<D> {
    fn drop(&mut self) {
        for frame in self.frames.iter() {
            let ptr = frame.data.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                unsafe { free_page_buffer(ptr, self.page_size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FileDevice, NullDevice};

    fn test_config() -> Config {
        Config {
            table_size: 64,
            log_capacity: 4 * 64 * 1024,
            page_size: 64 * 1024,
            ..Config::default()
        }
    }

    fn open_log<D: StorageDevice>(device: D) -> (Arc<LightEpoch>, Arc<HybridLog<D>>, usize) {
        let epoch = Arc::new(LightEpoch::new());
        let log = HybridLog::new(&test_config(), device, epoch.clone()).unwrap();
        let slot = epoch.acquire_entry().unwrap();
        epoch.protect(slot);
        (epoch, log, slot)
    }

    #[test]
    fn allocations_are_aligned_and_monotonic() {
        let (epoch, log, slot) = open_log(NullDevice::new());
        let a = log.allocate(24, slot).unwrap();
        let b = log.allocate(17, slot).unwrap();
        assert_eq!(a.control(), Address::K_FIRST_ADDRESS);
        assert_eq!(b.control(), a.control() + 24);
        assert_eq!(log.allocate(8, slot).unwrap().control() % 8, 0);
        epoch.release_entry(slot);
    }

    #[test]
    fn page_boundary_allocation_skips_to_next_page() {
        let (epoch, log, slot) = open_log(NullDevice::new());
        // Nearly fill page zero.
        let page_size = log.page_size() as u64;
        let chunk = 4096u32;
        let mut last = Address::NULL;
        while log.tail_address().control() + chunk as u64 * 2 < page_size {
            last = log.allocate(chunk, slot).unwrap();
        }
        // The next big allocation cannot fit in page zero.
        let a = log.allocate(8192, slot).unwrap();
        assert!(a > last);
        assert!(a.page(16) >= 1 || a.offset(16) as u64 + 8192 <= page_size);
        epoch.release_entry(slot);
    }

    #[test]
    fn anchors_stay_ordered_and_monotonic() {
        let (epoch, log, slot) = open_log(NullDevice::new());
        for _ in 0..64 {
            log.allocate(1024, slot).unwrap();
        }
        let before = log.read_only_address();
        log.shift_read_only_to_tail();
        epoch.refresh(slot);
        let after = log.read_only_address();
        assert!(after >= before);
        assert!(log.begin_address() <= log.head_address());
        assert!(log.head_address() <= log.safe_read_only_address());
        assert!(log.safe_read_only_address() <= log.read_only_address());
        assert!(log.read_only_address() <= log.tail_address());
        epoch.release_entry(slot);
    }

    #[test]
    fn eviction_flushes_pages_to_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::new(dir.path()).unwrap();
        let (epoch, log, slot) = open_log(device);
        // Fill enough pages to force frame turnover (capacity is 4 frames).
        for _ in 0..((4 * 64 * 1024) / 1024 + 64) {
            log.allocate(1024 - 8, slot).unwrap();
        }
        assert!(log.head_address() > Address::from_control(Address::K_FIRST_ADDRESS));
        assert!(log.device().size() > 0);
        epoch.release_entry(slot);
    }
}
