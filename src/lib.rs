//! # hlkv: an embedded, concurrent, log-structured key-value store
//!
//! `hlkv` stores records in a hybrid log: an append-only, page-structured
//! byte log whose tail region is mutable in place while the body below the
//! read-only boundary is immutable and flushable. A lock-free hash index
//! maps key hashes to log addresses, an epoch manager makes boundary
//! changes safe without blocking readers, and a two-artefact checkpoint
//! protocol provides crash-consistent recovery.
//!
//! ## Core pieces
//!
//! - **Hybrid log** (`hlog`): concurrent bump-pointer allocation over
//!   fixed-size pages, with begin/head/safe-read-only/read-only/tail
//!   anchors and epoch-safe page eviction.
//! - **Hash index** (`index`): cache-line buckets of tagged entries with
//!   overflow chains, CAS-only mutation, and cooperative doubling.
//! - **Operation engine** (`store`): Upsert/Read/RMW/Delete state machines
//!   with in-place updates under a record generation lock and
//!   copy-on-write everywhere else.
//! - **Sessions** (`session`): one per worker thread, carrying monotonic
//!   serial numbers and the pending queue for operations that fell below
//!   the head address.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hlkv::{Config, HlKv, NullDevice};
//!
//! let kv = HlKv::<u64, u64, _>::open(Config::default(), NullDevice::new())?;
//! let mut session = kv.start_session()?;
//! session.upsert(&my_upsert_ctx, 1);
//! session.read(&mut my_read_ctx, 2);
//! ```

pub mod checkpoint;
pub mod common;
pub mod contexts;
pub mod core;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod scan;
pub mod session;
pub mod store;

#[cfg(test)]
mod store_tests;

pub use crate::checkpoint::{IndexMetadata, LogMetadata, Phase, RecoveryResult, SessionSerial};
pub use crate::common::{Config, KvError, Result};
pub use crate::contexts::{DeleteContext, ReadContext, RmwContext, UpsertContext};
pub use crate::core::address::Address;
pub use crate::core::gen_lock::{AtomicGenLock, GenLock, TryLock};
pub use crate::core::record::{KvKey, KvValue};
pub use crate::core::status::Status;
pub use crate::core::token::Guid;
pub use crate::device::{FileDevice, NullDevice, StorageDevice};
pub use crate::index::key_hash::KeyHash;
pub use crate::scan::ScanIterator;
pub use crate::session::Session;
pub use crate::store::HlKv;
