//! Per-operation context contracts.
//!
//! Every point operation takes a caller-supplied context exposing the key
//! plus operation-specific callbacks. A context that survives a `Pending`
//! return is deep-copied onto the session's pending queue; the copy — not
//! the original — receives `on_complete` when the operation resolves, so
//! contexts that need to hand results back share state (for example through
//! an `Arc`).

use crate::core::record::{KvKey, KvValue};
use crate::core::status::Status;

/// Context for `upsert`.
pub trait UpsertContext: Send {
    type Key: KvKey;
    type Value: KvValue;

    fn key(&self) -> &Self::Key;

    /// Size of the value a fresh record for this upsert needs.
    fn value_size(&self) -> u32;

    /// Fills the value of a freshly allocated record.
    fn put(&self, value: &mut Self::Value);

    /// Overwrites the live value in place, under the generation lock.
    /// Returning false (the new value does not fit) falls back to a
    /// copy-on-write append.
    fn put_atomic(&self, value: &mut Self::Value) -> bool;

    /// Deep copy for the pending queue.
    fn deep_copy(&self) -> Box<dyn UpsertContext<Key = Self::Key, Value = Self::Value>>;

    /// Completion callback for an operation that went pending.
    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for `read`.
pub trait ReadContext: Send {
    type Key: KvKey;
    type Value: KvValue;

    fn key(&self) -> &Self::Key;

    /// Observes a stable (immutable-region) value.
    fn get(&mut self, value: &Self::Value);

    /// Observes a possibly concurrently mutated value. Runs under the
    /// torn-read detection protocol and may be invoked more than once.
    fn get_atomic(&mut self, value: &Self::Value) {
        self.get(value);
    }

    fn deep_copy(&self) -> Box<dyn ReadContext<Key = Self::Key, Value = Self::Value>>;

    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for `rmw` (read-modify-write).
pub trait RmwContext: Send {
    type Key: KvKey;
    type Value: KvValue;

    fn key(&self) -> &Self::Key;

    /// Size of the value when the key does not exist yet.
    fn value_size(&self) -> u32;

    /// Size of the updated value derived from `old`.
    fn updated_value_size(&self, old: &Self::Value) -> u32;

    /// Initializes the value when the key has no live record.
    fn rmw_initial(&self, value: &mut Self::Value);

    /// Produces the updated value from `old` into a fresh record.
    fn rmw_copy(&self, old: &Self::Value, new: &mut Self::Value);

    /// Updates the live value in place, under the generation lock.
    /// Returning false falls back to copy-on-write.
    fn rmw_atomic(&self, value: &mut Self::Value) -> bool;

    fn deep_copy(&self) -> Box<dyn RmwContext<Key = Self::Key, Value = Self::Value>>;

    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for `delete`. Deletes append a tombstone blindly and never go
/// pending, so no copy hook is needed.
pub trait DeleteContext: Send {
    type Key: KvKey;

    fn key(&self) -> &Self::Key;
}
