//! Configuration and error definitions shared across the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::token::Guid;
use crate::core::utility::is_power_of_two;

/// Errors surfaced by engine-level operations (open, checkpoint, recover,
/// session management). Point operations report `core::status::Status`
/// instead.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("checkpoint failed: {message}")]
    CheckpointFailed { message: String },

    #[error("recovery failed: {message}")]
    RecoveryFailed { message: String },

    #[error("data corruption detected: {message}")]
    Corruption { message: String },

    #[error("session table is full ({limit} sessions)")]
    SessionLimit { limit: usize },

    #[error("unknown session: {guid}")]
    UnknownSession { guid: Guid },

    #[error("out of memory: {message}")]
    OutOfMemory { message: String },
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of main hash buckets. Must be a power of two.
    pub table_size: u64,
    /// Total in-memory log capacity in bytes. Must be a multiple of the
    /// page size and at least two pages.
    pub log_capacity: u64,
    /// Log page size in bytes. Must be a power of two.
    pub page_size: u32,
    /// Fraction of resident pages kept mutable (above the read-only
    /// boundary).
    pub mutable_fraction: f64,
    /// Load factor (entries per bucket slot) beyond which the index
    /// schedules an automatic doubling. `None` leaves growth to explicit
    /// `grow_index` calls.
    pub grow_load_factor: Option<f64>,
    /// Number of operations a session runs between implicit epoch
    /// refreshes.
    pub refresh_interval: u32,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !is_power_of_two(self.table_size) {
            return Err(KvError::InvalidConfig {
                message: format!("table size {} is not a power of two", self.table_size),
            });
        }
        if !is_power_of_two(self.page_size as u64) || self.page_size < 4096 {
            return Err(KvError::InvalidConfig {
                message: format!("page size {} must be a power of two >= 4 KiB", self.page_size),
            });
        }
        if self.log_capacity % self.page_size as u64 != 0 {
            return Err(KvError::InvalidConfig {
                message: "log capacity must be a multiple of the page size".to_string(),
            });
        }
        if self.log_capacity < 2 * self.page_size as u64 {
            return Err(KvError::InvalidConfig {
                message: "log capacity must cover at least two pages".to_string(),
            });
        }
        if !(self.mutable_fraction > 0.0 && self.mutable_fraction <= 1.0) {
            return Err(KvError::InvalidConfig {
                message: format!("mutable fraction {} out of (0, 1]", self.mutable_fraction),
            });
        }
        if let Some(factor) = self.grow_load_factor
            && factor <= 0.0
        {
            return Err(KvError::InvalidConfig {
                message: "grow load factor must be positive".to_string(),
            });
        }
        if self.refresh_interval == 0 {
            return Err(KvError::InvalidConfig {
                message: "refresh interval must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Number of resident page frames the capacity buys.
    pub fn frame_count(&self) -> u32 {
        (self.log_capacity / self.page_size as u64) as u32
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            log_capacity: 16 * 32 * 1024 * 1024, // 16 resident pages
            page_size: 32 * 1024 * 1024,
            mutable_fraction: 0.9,
            grow_load_factor: None,
            refresh_interval: 64,
        }
    }
}
