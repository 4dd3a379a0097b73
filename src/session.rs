//! Sessions: the per-thread cursor into the store.
//!
//! A session owns an epoch-table entry, a strictly increasing serial
//! number, and a queue of pending operations whose records aged out below
//! the head address. Operations are synchronous; when one cannot complete
//! without device I/O its context is deep-copied onto the pending queue and
//! the caller sees `Pending`. `complete_pending` resolves the queue and
//! fires each copy's completion callback.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::contexts::{DeleteContext, ReadContext, RmwContext, UpsertContext};
use crate::core::record::{KvKey, KvValue};
use crate::core::status::Status;
use crate::core::token::Guid;
use crate::device::StorageDevice;
use crate::epoch::K_MAX_SESSIONS;
use crate::store::{HlKv, SessionState};
use crate::common::{KvError, Result};

enum PendingOp<K: KvKey, V: KvValue> {
    Read(Box<dyn ReadContext<Key = K, Value = V>>),
    Upsert(Box<dyn UpsertContext<Key = K, Value = V>>),
    Rmw(Box<dyn RmwContext<Key = K, Value = V>>),
}

struct PendingRequest<K: KvKey, V: KvValue> {
    op: PendingOp<K, V>,
    serial: u64,
}

pub struct Session<K: KvKey, V: KvValue, D: StorageDevice> {
    store: Arc<HlKv<K, V, D>>,
    guid: Guid,
    state: Arc<SessionState>,
    slot: usize,
    serial: u64,
    pending: VecDeque<PendingRequest<K, V>>,
    ops_since_refresh: u32,
    closed: bool,
}

impl<K: KvKey, V: KvValue, D: StorageDevice> Session<K, V, D> {
    pub(crate) fn open(
        store: Arc<HlKv<K, V, D>>,
        guid: Guid,
        state: Arc<SessionState>,
        serial: u64,
    ) -> Result<Self> {
        let slot = store
            .epoch
            .acquire_entry()
            .ok_or(KvError::SessionLimit {
                limit: K_MAX_SESSIONS,
            })?;
        store.epoch.protect(slot);
        Ok(Session {
            store,
            guid,
            state,
            slot,
            serial,
            pending: VecDeque::new(),
            ops_since_refresh: 0,
            closed: false,
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Serial of the last operation issued on this session.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Serial the most recent checkpoint made durable for this session.
    pub fn persisted_serial(&self) -> u64 {
        self.state.persisted_serial.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<HlKv<K, V, D>> {
        &self.store
    }

    fn begin_op(&mut self, serial: u64) {
        assert!(!self.closed, "operation issued on a closed session");
        assert!(
            serial > self.serial,
            "serial numbers must be strictly increasing: {} after {}",
            serial,
            self.serial
        );
        self.serial = serial;
        self.ops_since_refresh += 1;
        if self.ops_since_refresh >= self.store.config.refresh_interval {
            self.refresh();
        }
    }

    fn publish_serial(&self, serial: u64) {
        self.state.serial.fetch_max(serial, Ordering::SeqCst);
    }

    pub fn upsert<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: UpsertContext<Key = K, Value = V>,
    {
        self.begin_op(serial);
        let status = self.store.internal_upsert(ctx, self.slot);
        match status {
            Status::Pending => self.pending.push_back(PendingRequest {
                op: PendingOp::Upsert(ctx.deep_copy()),
                serial,
            }),
            _ => self.publish_serial(serial),
        }
        status
    }

    pub fn read<C>(&mut self, ctx: &mut C, serial: u64) -> Status
    where
        C: ReadContext<Key = K, Value = V>,
    {
        self.begin_op(serial);
        let status = self.store.internal_read(ctx, self.slot);
        match status {
            Status::Pending => self.pending.push_back(PendingRequest {
                op: PendingOp::Read(ctx.deep_copy()),
                serial,
            }),
            _ => self.publish_serial(serial),
        }
        status
    }

    pub fn rmw<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: RmwContext<Key = K, Value = V>,
    {
        self.begin_op(serial);
        let status = self.store.internal_rmw(ctx, self.slot);
        match status {
            Status::Pending => self.pending.push_back(PendingRequest {
                op: PendingOp::Rmw(ctx.deep_copy()),
                serial,
            }),
            _ => self.publish_serial(serial),
        }
        status
    }

    pub fn delete<C>(&mut self, ctx: &C, serial: u64) -> Status
    where
        C: DeleteContext<Key = K>,
    {
        self.begin_op(serial);
        let status = self.store.internal_delete(ctx, self.slot);
        if status != Status::Pending {
            self.publish_serial(serial);
        }
        status
    }

    /// Re-publishes this session's epoch, runs any drain work that became
    /// safe, lends a hand to an in-flight index grow, and retries the head
    /// of the pending queue.
    pub fn refresh(&mut self) {
        self.ops_since_refresh = 0;
        self.store.epoch.refresh(self.slot);
        self.store.maybe_auto_grow(self.slot);
        if !self.pending.is_empty() {
            self.resolve_one();
        }
    }

    /// Drains the pending queue. With `wait = false` this is a single pass;
    /// with `wait = true` it loops until the queue is empty. Resolution is
    /// synchronous through the device either way.
    pub fn complete_pending(&mut self, wait: bool) {
        loop {
            let before = self.pending.len();
            while !self.pending.is_empty() {
                self.resolve_one();
            }
            if !wait || self.pending.is_empty() || self.pending.len() < before {
                break;
            }
        }
    }

    fn resolve_one(&mut self) {
        let Some(mut request) = self.pending.pop_front() else {
            return;
        };
        let status = match &mut request.op {
            PendingOp::Read(ctx) => self.store.pending_read(ctx.as_mut(), self.slot),
            PendingOp::Upsert(ctx) => self.store.pending_upsert(ctx.as_mut(), self.slot),
            PendingOp::Rmw(ctx) => self.store.pending_rmw(ctx.as_mut(), self.slot),
        };
        self.publish_serial(request.serial);
        match &mut request.op {
            PendingOp::Read(ctx) => ctx.on_complete(status),
            PendingOp::Upsert(ctx) => ctx.on_complete(status),
            PendingOp::Rmw(ctx) => ctx.on_complete(status),
        }
    }

    /// Takes a full checkpoint while keeping this session's epoch entry
    /// moving, so a single-threaded caller cannot stall the phase machine.
    pub fn checkpoint(&mut self) -> Result<Guid> {
        self.store.checkpoint_with(Some(self.slot), true, true)
    }

    /// Doubles the hash table, participating in the split from this
    /// session's thread.
    pub fn grow_index(&mut self) -> bool {
        self.store.grow_index_with(Some(self.slot))
    }

    /// Drains pending work and releases the session's epoch entry. Called
    /// automatically on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.complete_pending(true);
        self.state.active.store(false, Ordering::SeqCst);
        self.store.epoch.unprotect(self.slot);
        self.store.epoch.release_entry(self.slot);
        self.closed = true;
    }
}

impl<K: KvKey, V: KvValue, D: StorageDevice> Drop for Session<K, V, D> {
    fn drop(&mut self) {
        self.close();
    }
}
