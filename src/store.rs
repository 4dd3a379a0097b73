//! The operation engine: threads Upsert/Read/RMW/Delete through the hash
//! index and the hybrid log, decides between in-place update and
//! copy-on-write, and drives checkpoint, recovery, and index growth.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::checkpoint::{
    IndexMetadata, K_INFO_FILE, K_TABLE_FILE, LogMetadata, Phase, RecoveryResult, SessionSerial,
    SystemState, read_artifact, write_artifact,
};
use crate::common::{Config, KvError, Result};
use crate::contexts::{DeleteContext, ReadContext, RmwContext, UpsertContext};
use crate::core::address::Address;
use crate::core::gen_lock::{TryLock, read_consistent};
use crate::core::record::{KvKey, KvValue, Record, RecordHeader};
use crate::core::status::Status;
use crate::core::token::Guid;
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::hlog::HybridLog;
use crate::index::hash_bucket::{AtomicHashBucketEntry, HashBucketEntry};
use crate::index::{HashResolver, MemHashIndex};
use crate::scan::ScanIterator;
use crate::session::Session;

/// Per-session bookkeeping shared with the engine. Lives in the session
/// registry so checkpoints can snapshot serials without touching the
/// session objects themselves.
pub struct SessionState {
    pub(crate) serial: AtomicU64,
    pub(crate) persisted_serial: AtomicU64,
    pub(crate) active: AtomicBool,
}

impl SessionState {
    fn new(serial: u64) -> Arc<Self> {
        Arc::new(SessionState {
            serial: AtomicU64::new(serial),
            persisted_serial: AtomicU64::new(0),
            active: AtomicBool::new(true),
        })
    }
}

/// Where a resident chain walk for a key ended up.
enum Trace {
    Found {
        addr: Address,
        ptr: *mut u8,
        header: RecordHeader,
    },
    BelowHead(Address),
    NotFound,
}

enum AppendOutcome {
    Done,
    /// The bucket CAS lost; the orphaned record was invalidated.
    Lost,
    Fail(Status),
}

/// The engine handle. One per store; shared across sessions behind an `Arc`.
pub struct HlKv<K: KvKey, V: KvValue, D: StorageDevice> {
    myself: Weak<HlKv<K, V, D>>,
    pub(crate) config: Config,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) hlog: Arc<HybridLog<D>>,
    pub(crate) index: MemHashIndex,
    pub(crate) state: SystemState,
    pub(crate) sessions: DashMap<Guid, Arc<SessionState>>,
    pub(crate) recovered_sessions: DashMap<Guid, u64>,
    _marker: PhantomData<fn(K, V)>,
}

impl<K: KvKey, V: KvValue, D: StorageDevice> HlKv<K, V, D> {
    /// Opens a fresh store over `device`.
    pub fn open(config: Config, device: D) -> Result<Arc<Self>> {
        config.validate()?;
        let epoch = Arc::new(LightEpoch::new());
        let hlog = HybridLog::new(&config, device, epoch.clone())?;
        let index = MemHashIndex::new(config.table_size);
        Ok(Arc::new_cyclic(|weak| HlKv {
            myself: weak.clone(),
            config,
            epoch,
            hlog,
            index,
            state: SystemState::new(),
            sessions: DashMap::new(),
            recovered_sessions: DashMap::new(),
            _marker: PhantomData,
        }))
    }

    /// Opens a store from a checkpoint: replays the index image, then scans
    /// the log suffix to reconstruct entries written after the image.
    pub fn recover(
        config: Config,
        device: D,
        index_token: Guid,
        log_token: Guid,
    ) -> Result<(Arc<Self>, RecoveryResult)> {
        config.validate()?;
        let index_dir =
            device
                .index_checkpoint_dir(&index_token)
                .ok_or_else(|| KvError::RecoveryFailed {
                    message: "device cannot hold checkpoints".to_string(),
                })?;
        let log_dir = device
            .log_checkpoint_dir(&log_token)
            .ok_or_else(|| KvError::RecoveryFailed {
                message: "device cannot hold checkpoints".to_string(),
            })?;
        let index_meta: IndexMetadata = read_artifact(&index_dir, K_INFO_FILE)?;
        let image: Vec<(u64, u64)> = read_artifact(&index_dir, K_TABLE_FILE)?;
        let log_meta: LogMetadata = read_artifact(&log_dir, K_INFO_FILE)?;
        if index_meta.version != log_meta.version {
            log::warn!(
                "recovering from mixed checkpoint versions: index {} log {}",
                index_meta.version,
                log_meta.version
            );
        }

        let config = Config {
            table_size: index_meta.table_size,
            ..config
        };
        let store = Self::open(config, device)?;
        let begin = Address::from_control(log_meta.begin_address);
        let head = Address::from_control(log_meta.head_address);
        let tail_cut = Address::from_control(log_meta.tail_at_checkpoint);
        if begin > head || head > tail_cut {
            return Err(KvError::Corruption {
                message: "checkpoint anchors out of order".to_string(),
            });
        }
        store.hlog.restore(begin, head, tail_cut, log_meta.version + 1)?;
        store.index.restore_image(&image);
        store.replay_log(head, tail_cut, log_meta.version)?;
        for session in &log_meta.sessions {
            store
                .recovered_sessions
                .insert(session.guid, session.serial);
        }
        log::info!(
            "recovered version {} with {} sessions, log [{}, {})",
            log_meta.version,
            log_meta.sessions.len(),
            head,
            tail_cut
        );
        Ok((
            store,
            RecoveryResult {
                version: log_meta.version,
                sessions: log_meta.sessions,
            },
        ))
    }

    // --- Sessions ---

    fn strong(&self) -> Arc<Self> {
        self.myself.upgrade().expect("store handle still alive")
    }

    /// Opens a session. Each worker thread owns exactly one.
    pub fn start_session(&self) -> Result<Session<K, V, D>> {
        let guid = Guid::generate();
        let state = SessionState::new(0);
        self.sessions.insert(guid, state.clone());
        Session::open(self.strong(), guid, state, 0)
    }

    /// Resumes a session recovered from a checkpoint; returns it together
    /// with the last serial the checkpoint made durable.
    pub fn continue_session(&self, guid: Guid) -> Result<(Session<K, V, D>, u64)> {
        let last_serial = self
            .recovered_sessions
            .get(&guid)
            .map(|entry| *entry.value())
            .ok_or(KvError::UnknownSession { guid })?;
        let state = SessionState::new(last_serial);
        state.persisted_serial.store(last_serial, Ordering::SeqCst);
        self.sessions.insert(guid, state.clone());
        let session = Session::open(self.strong(), guid, state, last_serial)?;
        Ok((session, last_serial))
    }

    // --- Introspection ---

    /// Bytes the log has allocated since truncation.
    pub fn size(&self) -> u64 {
        self.hlog.size()
    }

    /// Bucket count of the live hash table.
    pub fn index_size(&self) -> u64 {
        self.index.size()
    }

    pub fn begin_address(&self) -> Address {
        self.hlog.begin_address()
    }

    pub fn head_address(&self) -> Address {
        self.hlog.head_address()
    }

    pub fn safe_read_only_address(&self) -> Address {
        self.hlog.safe_read_only_address()
    }

    pub fn read_only_address(&self) -> Address {
        self.hlog.read_only_address()
    }

    pub fn tail_address(&self) -> Address {
        self.hlog.tail_address()
    }

    /// Advances the read-only boundary to the current tail. The
    /// safe-read-only advance and flush ride the next epoch drain.
    pub fn shift_read_only_to_tail(&self) -> Address {
        self.hlog.shift_read_only_to_tail()
    }

    /// Current log address of the newest record for `key`, if resident.
    /// Diagnostic aid for tests and tooling.
    pub fn address_of(&self, key: &K) -> Option<Address> {
        let slot = self.epoch.acquire_entry()?;
        self.epoch.protect(slot);
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        let result = self
            .index
            .find_entry(key.key_hash(), resolver)
            .and_then(|(entry, _)| {
                match self.trace_key(key, entry.address(), self.hlog.head_address()) {
                    Trace::Found { addr, .. } => Some(addr),
                    _ => None,
                }
            });
        self.epoch.unprotect(slot);
        self.epoch.release_entry(slot);
        result
    }

    // --- Index growth ---

    /// Doubles the hash table, driving the cooperative split to completion.
    /// Returns false when a grow is already running or no epoch slot is
    /// free.
    pub fn grow_index(&self) -> bool {
        self.grow_index_with(None)
    }

    pub(crate) fn grow_index_with(&self, extra: Option<usize>) -> bool {
        if self.index.grow_in_progress() {
            return false;
        }
        let Some(slot) = self.epoch.acquire_entry() else {
            return false;
        };
        self.epoch.protect(slot);

        // Install the doubled table behind an epoch bump so no operation is
        // mid-flight against the slot being replaced.
        let started = Arc::new(AtomicBool::new(false));
        {
            let weak = self.myself.clone();
            let started = started.clone();
            self.epoch.bump_epoch(Box::new(move || {
                if let Some(store) = weak.upgrade()
                    && !store.index.grow_in_progress()
                {
                    store.index.start_grow();
                }
                started.store(true, Ordering::SeqCst);
            }));
        }
        self.wait_for(slot, extra, || started.load(Ordering::SeqCst));

        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        while self.index.help_grow(resolver) {}
        self.wait_for(slot, extra, || !self.index.grow_in_progress());

        self.epoch.unprotect(slot);
        self.epoch.release_entry(slot);
        true
    }

    // --- Scans ---

    /// Iterates the live records currently resident in memory.
    pub fn scan_in_memory(&self) -> Result<ScanIterator<K, V, D>> {
        let begin = self.hlog.head_address();
        let end = self.hlog.tail_address();
        self.scan_range(begin, end)
    }

    /// Iterates live records in `[begin_scan, end_scan)`. Both bounds must
    /// be at or above the head address; scanning aged-out records is a
    /// contract violation.
    pub fn scan_range(
        &self,
        begin_scan: Address,
        end_scan: Address,
    ) -> Result<ScanIterator<K, V, D>> {
        ScanIterator::new(self.strong(), begin_scan, end_scan)
    }

    // --- Checkpoint ---

    /// Takes a full checkpoint (index image plus log) under a fresh token.
    pub fn checkpoint(&self) -> Result<Guid> {
        self.checkpoint_with(None, true, true)
    }

    /// Index-only checkpoint.
    pub fn checkpoint_index(&self) -> Result<Guid> {
        self.checkpoint_with(None, true, false)
    }

    /// Log-only checkpoint.
    pub fn checkpoint_log(&self) -> Result<Guid> {
        self.checkpoint_with(None, false, true)
    }

    pub(crate) fn checkpoint_with(
        &self,
        extra: Option<usize>,
        do_index: bool,
        do_log: bool,
    ) -> Result<Guid> {
        if self.index.grow_in_progress() {
            return Err(KvError::CheckpointFailed {
                message: "index grow in progress".to_string(),
            });
        }
        if !self.state.transition(Phase::Rest, Phase::Prepare) {
            return Err(KvError::CheckpointFailed {
                message: "checkpoint already in progress".to_string(),
            });
        }
        let token = Guid::generate();
        let slot = match self.epoch.acquire_entry() {
            Some(slot) => slot,
            None => {
                self.state.force_rest();
                return Err(KvError::SessionLimit {
                    limit: crate::epoch::K_MAX_SESSIONS,
                });
            }
        };
        self.epoch.protect(slot);
        let outcome = self.drive_checkpoint(token, slot, extra, do_index, do_log);
        self.epoch.unprotect(slot);
        self.epoch.release_entry(slot);
        if outcome.is_err() {
            self.hlog.set_new_version_mode(false);
            self.state.force_rest();
        }
        outcome.map(|_| token)
    }

    fn drive_checkpoint(
        &self,
        token: Guid,
        slot: usize,
        extra: Option<usize>,
        do_index: bool,
        do_log: bool,
    ) -> Result<()> {
        log::info!("checkpoint {} started", token);
        // Prepare: freeze the session set and snapshot their serials.
        let sessions: Vec<SessionSerial> = self
            .sessions
            .iter()
            .map(|entry| SessionSerial {
                guid: *entry.key(),
                serial: entry.value().serial.load(Ordering::SeqCst),
            })
            .collect();
        let snapshot_version = self.hlog.version_word();
        let active = self
            .sessions
            .iter()
            .filter(|entry| entry.value().active.load(Ordering::SeqCst))
            .count();
        log::debug!(
            "checkpoint froze {} sessions ({} active)",
            sessions.len(),
            active
        );

        // Prepare -> InProgress: capture the cut behind an epoch bump; from
        // then on appends are stamped with the next version and marked.
        let cut_cell = Arc::new(AtomicU64::new(0));
        {
            let hlog = self.hlog.clone();
            let cell = cut_cell.clone();
            self.epoch.bump_epoch(Box::new(move || {
                let tail = hlog.tail_address();
                hlog.bump_version();
                hlog.set_new_version_mode(true);
                cell.store(tail.control(), Ordering::SeqCst);
            }));
        }
        self.wait_for(slot, extra, || cut_cell.load(Ordering::SeqCst) != 0);
        let tail_cut = Address::from_control(cut_cell.load(Ordering::SeqCst));
        self.state.transition(Phase::Prepare, Phase::InProgress);
        let begin = self.hlog.begin_address();
        let head = self.hlog.head_address();

        if do_index {
            let dir = self
                .hlog
                .device()
                .index_checkpoint_dir(&token)
                .ok_or_else(|| KvError::CheckpointFailed {
                    message: "device cannot hold checkpoints".to_string(),
                })?;
            let image_tail = self.hlog.tail_address();
            let image = self
                .index
                .collect_image(|addr| self.resolve_below(addr, tail_cut, snapshot_version));
            write_artifact(&dir, K_TABLE_FILE, &image)?;
            write_artifact(
                &dir,
                K_INFO_FILE,
                &IndexMetadata {
                    version: snapshot_version,
                    table_size: self.index.size(),
                    num_entries: image.len() as u64,
                    image_tail: image_tail.control(),
                },
            )?;
        }

        // WaitPending: let every in-flight operation settle.
        self.state.transition(Phase::InProgress, Phase::WaitPending);
        self.epoch_barrier(slot, extra);

        // WaitFlush: make the log prefix durable and persist its metadata.
        self.state.transition(Phase::WaitPending, Phase::WaitFlush);
        if do_log {
            let dir = self
                .hlog
                .device()
                .log_checkpoint_dir(&token)
                .ok_or_else(|| KvError::CheckpointFailed {
                    message: "device cannot hold checkpoints".to_string(),
                })?;
            self.hlog.flush_until(tail_cut)?;
            write_artifact(
                &dir,
                K_INFO_FILE,
                &LogMetadata {
                    version: snapshot_version,
                    begin_address: begin.control(),
                    head_address: head.control(),
                    tail_at_checkpoint: tail_cut.control(),
                    sessions: sessions.clone(),
                },
            )?;
        }

        // PersistenceCallback: publish per-session persistent serials.
        self.state
            .transition(Phase::WaitFlush, Phase::PersistenceCallback);
        for session in &sessions {
            if let Some(state) = self.sessions.get(&session.guid) {
                state
                    .persisted_serial
                    .fetch_max(session.serial, Ordering::SeqCst);
            }
        }
        self.hlog.set_new_version_mode(false);
        self.state.transition(Phase::PersistenceCallback, Phase::Rest);
        log::info!(
            "checkpoint {} complete: version {} cut {}",
            token,
            snapshot_version,
            tail_cut
        );
        Ok(())
    }

    /// Resolves an index entry's address down its chain until it lands on a
    /// record the checkpoint at `cut`/`version` covers.
    fn resolve_below(&self, addr: Address, cut: Address, version: u32) -> Option<Address> {
        let head = self.hlog.head_address();
        let version13 = (version & 0x1fff) as u16;
        let mut current = addr;
        while !current.is_null() {
            if current < head {
                // Aged out to the device; anything below the head predates
                // the cut.
                return Some(current);
            }
            let Some(ptr) = self.hlog.get(current) else {
                return Some(current);
            };
            let header = unsafe { Record::<K, V>::header(ptr) }.load();
            if current < cut && !header.invalid() && header.version() <= version13 {
                return Some(current);
            }
            current = header.previous_address();
        }
        None
    }

    /// Scans `[from, to)` and points index entries at the newest covered
    /// record per key. Single-threaded, at recovery time.
    fn replay_log(&self, from: Address, to: Address, version: u32) -> Result<()> {
        let page_bits = self.hlog.page_size().trailing_zeros();
        let page_size = self.hlog.page_size();
        let version13 = (version & 0x1fff) as u16;
        let mut cursor = from;
        let mut replayed = 0u64;
        while cursor < to {
            if page_size - cursor.offset(page_bits) < Record::<K, V>::K_HEADER_SIZE {
                cursor = cursor.next_page_start(page_bits);
                continue;
            }
            let Some(ptr) = self.hlog.get(cursor) else {
                return Err(KvError::Corruption {
                    message: format!("recovered page for {} not resident", cursor),
                });
            };
            let header = unsafe { Record::<K, V>::header(ptr) }.load();
            if header.is_null() {
                // Unwritten remainder of the page.
                cursor = cursor.next_page_start(page_bits);
                continue;
            }
            let size = unsafe { Record::<K, V>::size_at(ptr) };
            let this = cursor;
            cursor = this + size as u64;
            if header.invalid() || header.version() > version13 {
                continue;
            }
            let key = unsafe { Record::<K, V>::key(ptr) };
            self.index.recover_update_entry(key.key_hash(), this);
            replayed += 1;
        }
        log::info!("log replay visited {} records", replayed);
        Ok(())
    }

    // --- Operation internals (called from sessions) ---

    fn resolver(&self) -> impl Fn(Address) -> Option<(u64, Address)> + '_ {
        move |addr| {
            if addr < self.hlog.head_address() {
                return None;
            }
            let ptr = self.hlog.get(addr)?;
            unsafe {
                let header = Record::<K, V>::header(ptr).load();
                let key = Record::<K, V>::key(ptr);
                Some((key.key_hash().control(), header.previous_address()))
            }
        }
    }

    fn trace_key(&self, key: &K, start: Address, head: Address) -> Trace {
        let mut addr = start;
        while !addr.is_null() && addr >= head {
            let Some(ptr) = self.hlog.get(addr) else {
                return Trace::BelowHead(addr);
            };
            let header = unsafe { Record::<K, V>::header(ptr) }.load();
            if !header.invalid() && unsafe { Record::<K, V>::key(ptr) } == key {
                return Trace::Found { addr, ptr, header };
            }
            addr = header.previous_address();
        }
        if addr.is_null() {
            Trace::NotFound
        } else {
            Trace::BelowHead(addr)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_record(
        &self,
        key: &K,
        entry: HashBucketEntry,
        slot_ref: &AtomicHashBucketEntry,
        tag: u16,
        slot: usize,
        stamp: u64,
        tombstone: bool,
        value_size: u32,
        fill: impl FnOnce(&mut V),
    ) -> AppendOutcome {
        let key_size = key.size();
        let total = Record::<K, V>::required_size(key_size, value_size);
        let address = match self.hlog.allocate(total, slot) {
            Ok(address) => address,
            Err(status) => return AppendOutcome::Fail(status),
        };
        let Some(ptr) = self.hlog.get(address) else {
            return AppendOutcome::Fail(Status::Corruption);
        };
        unsafe {
            ptr::copy_nonoverlapping(
                key as *const K as *const u8,
                ptr.add(Record::<K, V>::K_HEADER_SIZE as usize),
                key_size as usize,
            );
            fill(Record::<K, V>::value_mut(ptr));
            let header = RecordHeader::new(
                entry.address(),
                self.hlog.current_version(),
                self.hlog.in_new_version_mode(),
                tombstone,
            );
            Record::<K, V>::header(ptr).store(header);
        }
        // The allocation above may have refreshed the epoch and let an index
        // grow begin; a slot found under the old routing no longer receives
        // updates, so retire the record and retry from the lookup.
        if self.index.route_stamp() != stamp {
            unsafe { Record::<K, V>::header(ptr) }.set_invalid();
            return AppendOutcome::Lost;
        }
        if self.index.try_update_entry(slot_ref, entry, address, tag) {
            AppendOutcome::Done
        } else {
            // Lost the bucket race: retire the orphaned record and retry
            // from the lookup.
            unsafe { Record::<K, V>::header(ptr) }.set_invalid();
            AppendOutcome::Lost
        }
    }

    pub(crate) fn internal_upsert<C>(&self, ctx: &C, slot: usize) -> Status
    where
        C: UpsertContext<Key = K, Value = V> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        'retry: loop {
            let (entry, slot_ref) = self.index.find_or_create_entry(hash, resolver);
            let stamp = self.index.route_stamp();
            let head = self.hlog.head_address();
            let read_only = self.hlog.read_only_address();
            let safe_read_only = self.hlog.safe_read_only_address();

            match self.trace_key(ctx.key(), entry.address(), head) {
                Trace::BelowHead(_) => return Status::Pending,
                Trace::Found { addr, ptr, header } => {
                    if !header.tombstone() && V::IN_PLACE {
                        if addr >= read_only {
                            let lock = unsafe { Record::<K, V>::gen_lock(ptr) };
                            loop {
                                match lock.try_lock() {
                                    TryLock::Acquired => {
                                        let ok = ctx
                                            .put_atomic(unsafe { Record::<K, V>::value_mut(ptr) });
                                        lock.unlock(!ok);
                                        if ok {
                                            return Status::Ok;
                                        }
                                        // The value outgrew its slot; the
                                        // replaced mark is set, append a copy.
                                        break;
                                    }
                                    TryLock::Replaced => continue 'retry,
                                    TryLock::Busy => std::thread::yield_now(),
                                }
                            }
                        } else if addr >= safe_read_only {
                            // Fuzzy region: an in-place writer may still be
                            // mutating this record. Wait out the boundary.
                            self.epoch.refresh(slot);
                            std::hint::spin_loop();
                            continue 'retry;
                        }
                    }
                }
                Trace::NotFound => {}
            }

            match self.append_record(
                ctx.key(),
                entry,
                slot_ref,
                hash.tag(),
                slot,
                stamp,
                false,
                ctx.value_size(),
                |value| ctx.put(value),
            ) {
                AppendOutcome::Done => return Status::Ok,
                AppendOutcome::Lost => continue 'retry,
                AppendOutcome::Fail(status) => return status,
            }
        }
    }

    pub(crate) fn internal_read<C>(&self, ctx: &mut C, _slot: usize) -> Status
    where
        C: ReadContext<Key = K, Value = V> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        let Some((entry, _)) = self.index.find_entry(hash, resolver) else {
            return Status::NotFound;
        };
        let head = self.hlog.head_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        match self.trace_key(ctx.key(), entry.address(), head) {
            Trace::Found { addr, ptr, header } => {
                if header.tombstone() {
                    return Status::NotFound;
                }
                unsafe {
                    if addr >= safe_read_only && V::IN_PLACE {
                        let lock = Record::<K, V>::gen_lock(ptr);
                        let value = Record::<K, V>::value(ptr);
                        read_consistent(lock, || ctx.get_atomic(value));
                    } else if addr >= safe_read_only {
                        ctx.get_atomic(Record::<K, V>::value(ptr));
                    } else {
                        ctx.get(Record::<K, V>::value(ptr));
                    }
                }
                Status::Ok
            }
            Trace::BelowHead(_) => Status::Pending,
            Trace::NotFound => Status::NotFound,
        }
    }

    pub(crate) fn internal_rmw<C>(&self, ctx: &C, slot: usize) -> Status
    where
        C: RmwContext<Key = K, Value = V> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        'retry: loop {
            let (entry, slot_ref) = self.index.find_or_create_entry(hash, resolver);
            let stamp = self.index.route_stamp();
            let head = self.hlog.head_address();
            let read_only = self.hlog.read_only_address();
            let safe_read_only = self.hlog.safe_read_only_address();

            let trace = self.trace_key(ctx.key(), entry.address(), head);
            let outcome = match trace {
                Trace::BelowHead(_) => return Status::Pending,
                Trace::Found { addr, ptr, header } if !header.tombstone() => {
                    if V::IN_PLACE {
                        if addr >= read_only {
                            let lock = unsafe { Record::<K, V>::gen_lock(ptr) };
                            let mut fall_through = false;
                            loop {
                                match lock.try_lock() {
                                    TryLock::Acquired => {
                                        let ok = ctx
                                            .rmw_atomic(unsafe { Record::<K, V>::value_mut(ptr) });
                                        lock.unlock(!ok);
                                        if ok {
                                            return Status::Ok;
                                        }
                                        fall_through = true;
                                        break;
                                    }
                                    TryLock::Replaced => break,
                                    TryLock::Busy => std::thread::yield_now(),
                                }
                            }
                            if !fall_through {
                                continue 'retry;
                            }
                        } else if addr >= safe_read_only {
                            self.epoch.refresh(slot);
                            std::hint::spin_loop();
                            continue 'retry;
                        }
                    }
                    // Copy-on-write from the old value. The copy is taken
                    // before allocating so page turnover cannot evict the
                    // source from under us.
                    let old_bytes = self.copy_value_bytes(ptr);
                    let old: &V = unsafe { &*(old_bytes.as_ptr() as *const V) };
                    let new_size = ctx.updated_value_size(old);
                    self.append_record(
                        ctx.key(),
                        entry,
                        slot_ref,
                        hash.tag(),
                        slot,
                        stamp,
                        false,
                        new_size,
                        |value| ctx.rmw_copy(old, value),
                    )
                }
                _ => {
                    // No live record (miss or tombstone): write the initial
                    // value.
                    self.append_record(
                        ctx.key(),
                        entry,
                        slot_ref,
                        hash.tag(),
                        slot,
                        stamp,
                        false,
                        ctx.value_size(),
                        |value| ctx.rmw_initial(value),
                    )
                }
            };
            match outcome {
                AppendOutcome::Done => return Status::Ok,
                AppendOutcome::Lost => continue 'retry,
                AppendOutcome::Fail(status) => return status,
            }
        }
    }

    pub(crate) fn internal_delete<C>(&self, ctx: &C, slot: usize) -> Status
    where
        C: DeleteContext<Key = K> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        loop {
            let (entry, slot_ref) = self.index.find_or_create_entry(hash, resolver);
            let stamp = self.index.route_stamp();
            // A tombstone is appended unconditionally; the hash slot stays
            // occupied so a later upsert chains past it.
            match self.append_record(
                ctx.key(),
                entry,
                slot_ref,
                hash.tag(),
                slot,
                stamp,
                true,
                mem::size_of::<V>() as u32,
                |_| {},
            ) {
                AppendOutcome::Done => return Status::Ok,
                AppendOutcome::Lost => continue,
                AppendOutcome::Fail(status) => return status,
            }
        }
    }

    /// Copies the value bytes of the record at `ptr` into an owned,
    /// 8-byte-aligned buffer, torn-read-safe for in-place-mutable values.
    fn copy_value_bytes(&self, ptr: *mut u8) -> Vec<u64> {
        unsafe {
            let copy_once = || {
                let value = Record::<K, V>::value(ptr as *const u8);
                let size = crate::core::utility::pad8(value.size()) as usize;
                let mut buf = vec![0u64; size / 8];
                ptr::copy_nonoverlapping(
                    Record::<K, V>::value_ptr(ptr as *const u8),
                    buf.as_mut_ptr() as *mut u8,
                    size,
                );
                buf
            };
            if V::IN_PLACE {
                let lock = Record::<K, V>::gen_lock(ptr as *const u8);
                read_consistent(lock, copy_once)
            } else {
                copy_once()
            }
        }
    }

    // --- Pending resolution (called from `complete_pending`) ---

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<(), Status> {
        match self.hlog.device().read(offset, buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) => Err(Status::Corruption),
            Err(_) => Err(Status::IoError),
        }
    }

    /// Reads the full record at `addr` off the device into an owned,
    /// 8-byte-aligned buffer, discovering its size from the key and value
    /// headers as they stream in.
    fn read_record_from_device(&self, addr: Address) -> std::result::Result<Vec<u64>, Status> {
        let header_and_key = Record::<K, V>::K_HEADER_SIZE as usize + mem::size_of::<K>();
        let mut len = crate::core::utility::pad8(header_and_key as u32) as usize;
        let mut buf: Vec<u64> = vec![0u64; len / 8];
        {
            let bytes =
                unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, len) };
            self.read_exact_at(addr.control(), bytes)?;
        }
        let grow_to = |buf: &mut Vec<u64>, old_len: usize, new_len: usize,
                       this: &Self|
         -> std::result::Result<(), Status> {
            buf.resize(new_len / 8, 0);
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(
                    (buf.as_mut_ptr() as *mut u8).add(old_len),
                    new_len - old_len,
                )
            };
            this.read_exact_at(addr.control() + old_len as u64, bytes)?;
            Ok(())
        };

        let key_size = unsafe { Record::<K, V>::key(buf.as_ptr() as *const u8).size() };
        let value_header_end = Record::<K, V>::K_HEADER_SIZE as usize
            + crate::core::utility::pad8(key_size) as usize
            + mem::size_of::<V>();
        let needed = crate::core::utility::pad8(value_header_end as u32) as usize;
        if needed > len {
            grow_to(&mut buf, len, needed, self)?;
            len = needed;
        }
        let total = unsafe { Record::<K, V>::size_at(buf.as_ptr() as *const u8) } as usize;
        if total > len {
            grow_to(&mut buf, len, total, self)?;
        }
        Ok(buf)
    }

    /// Walks the on-device chain starting at `addr` for `key`. Returns the
    /// record bytes when a live match is found, `Ok(None)` on a tombstone
    /// or chain end.
    fn disk_find(
        &self,
        key: &K,
        addr: Address,
    ) -> std::result::Result<Option<Vec<u64>>, Status> {
        let mut cursor = addr;
        loop {
            if cursor.is_null() {
                return Ok(None);
            }
            let buf = self.read_record_from_device(cursor)?;
            let ptr = buf.as_ptr() as *const u8;
            let header = unsafe { Record::<K, V>::header(ptr) }.load();
            if !header.invalid() && unsafe { Record::<K, V>::key(ptr) } == key {
                if header.tombstone() {
                    return Ok(None);
                }
                return Ok(Some(buf));
            }
            cursor = header.previous_address();
        }
    }

    /// Faulting address for `key`, when its chain still dips below the head.
    fn pending_address(&self, key: &K) -> Option<Address> {
        let hash = key.key_hash();
        let resolver_impl = self.resolver();
        let resolver: HashResolver = &resolver_impl;
        let (entry, _) = self.index.find_entry(hash, resolver)?;
        match self.trace_key(key, entry.address(), self.hlog.head_address()) {
            Trace::BelowHead(addr) => Some(addr),
            _ => None,
        }
    }

    pub(crate) fn pending_read<C>(&self, ctx: &mut C, slot: usize) -> Status
    where
        C: ReadContext<Key = K, Value = V> + ?Sized,
    {
        loop {
            let status = self.internal_read(ctx, slot);
            if status != Status::Pending {
                return status;
            }
            let Some(addr) = self.pending_address(ctx.key()) else {
                continue;
            };
            return match self.disk_find(ctx.key(), addr) {
                Ok(Some(buf)) => {
                    let value = unsafe { Record::<K, V>::value(buf.as_ptr() as *const u8) };
                    ctx.get(value);
                    Status::Ok
                }
                Ok(None) => Status::NotFound,
                Err(status) => status,
            };
        }
    }

    pub(crate) fn pending_upsert<C>(&self, ctx: &mut C, slot: usize) -> Status
    where
        C: UpsertContext<Key = K, Value = V> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        loop {
            let status = self.internal_upsert(ctx, slot);
            if status != Status::Pending {
                return status;
            }
            let Some(addr) = self.pending_address(ctx.key()) else {
                continue;
            };
            // The old value is superseded wholesale, but the disk round
            // trip still gates the copy-on-write resolution: an unreadable
            // device surfaces here instead of silently dropping the fault.
            if let Err(status) = self.read_record_from_device(addr) {
                return status;
            }
            let resolver_impl = self.resolver();
            let resolver: HashResolver = &resolver_impl;
            let (entry, slot_ref) = self.index.find_or_create_entry(hash, resolver);
            let stamp = self.index.route_stamp();
            match self.append_record(
                ctx.key(),
                entry,
                slot_ref,
                hash.tag(),
                slot,
                stamp,
                false,
                ctx.value_size(),
                |value| ctx.put(value),
            ) {
                AppendOutcome::Done => return Status::Ok,
                AppendOutcome::Lost => continue,
                AppendOutcome::Fail(status) => return status,
            }
        }
    }

    pub(crate) fn pending_rmw<C>(&self, ctx: &mut C, slot: usize) -> Status
    where
        C: RmwContext<Key = K, Value = V> + ?Sized,
    {
        let hash = ctx.key().key_hash();
        loop {
            let status = self.internal_rmw(ctx, slot);
            if status != Status::Pending {
                return status;
            }
            let Some(addr) = self.pending_address(ctx.key()) else {
                continue;
            };
            let old_buf = match self.disk_find(ctx.key(), addr) {
                Ok(found) => found,
                Err(status) => return status,
            };
            let resolver_impl = self.resolver();
            let resolver: HashResolver = &resolver_impl;
            let (entry, slot_ref) = self.index.find_or_create_entry(hash, resolver);
            let stamp = self.index.route_stamp();
            let outcome = match &old_buf {
                Some(buf) => {
                    let old =
                        unsafe { Record::<K, V>::value(buf.as_ptr() as *const u8) };
                    self.append_record(
                        ctx.key(),
                        entry,
                        slot_ref,
                        hash.tag(),
                        slot,
                        stamp,
                        false,
                        ctx.updated_value_size(old),
                        |value| ctx.rmw_copy(old, value),
                    )
                }
                None => self.append_record(
                    ctx.key(),
                    entry,
                    slot_ref,
                    hash.tag(),
                    slot,
                    stamp,
                    false,
                    ctx.value_size(),
                    |value| ctx.rmw_initial(value),
                ),
            };
            match outcome {
                AppendOutcome::Done => return Status::Ok,
                AppendOutcome::Lost => continue,
                AppendOutcome::Fail(status) => return status,
            }
        }
    }

    // --- Epoch helpers ---

    fn wait_for(&self, slot: usize, extra: Option<usize>, cond: impl Fn() -> bool) {
        while !cond() {
            self.epoch.refresh(slot);
            if let Some(extra_slot) = extra {
                self.epoch.refresh(extra_slot);
            }
            std::hint::spin_loop();
        }
    }

    fn epoch_barrier(&self, slot: usize, extra: Option<usize>) {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        self.epoch.bump_epoch(Box::new(move || {
            flag2.store(true, Ordering::SeqCst);
        }));
        self.wait_for(slot, extra, || flag.load(Ordering::SeqCst));
    }

    pub(crate) fn maybe_auto_grow(&self, session_slot: usize) {
        if let Some(factor) = self.config.grow_load_factor
            && self.index.should_grow(factor)
            && !self.index.grow_in_progress()
        {
            self.grow_index_with(Some(session_slot));
        }
    }
}

impl<K: KvKey, V: KvValue, D: StorageDevice> std::fmt::Debug for HlKv<K, V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlKv")
            .field("tail", &self.tail_address())
            .field("buckets", &self.index_size())
            .field("phase", &self.state.phase().as_str())
            .finish()
    }
}
