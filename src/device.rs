//! Storage-device seam for the hybrid log.
//!
//! The engine is generic over a device: evicted and checkpointed log pages
//! are written through it at their natural byte offsets, and pending
//! operations read records back through it. The concrete choice (file-backed
//! or null) is a collaborator decision, not an engine one.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::common::{KvError, Result};
use crate::core::token::Guid;

pub trait StorageDevice: Send + Sync + 'static {
    /// Writes `data` at byte `offset` of the log image.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Reads into `buf` from byte `offset`; returns the bytes read.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Makes previously written data durable.
    fn flush(&self) -> Result<()>;

    /// Current size of the log image in bytes.
    fn size(&self) -> u64;

    /// Directory for an index-checkpoint artefact, or `None` when the
    /// device cannot persist checkpoints.
    fn index_checkpoint_dir(&self, token: &Guid) -> Option<PathBuf>;

    /// Directory for a log-checkpoint artefact, or `None` when the device
    /// cannot persist checkpoints.
    fn log_checkpoint_dir(&self, token: &Guid) -> Option<PathBuf>;
}

/// File-backed device rooted at a directory. The log image lives in
/// `hlog.log`; checkpoint artefacts live under `index-checkpoints/<token>/`
/// and `log-checkpoints/<token>/`.
pub struct FileDevice {
    root: PathBuf,
    log: File,
}

impl FileDevice {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join("hlog.log"))?;
        Ok(FileDevice { root, log })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageDevice for FileDevice {
    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.log.write_all_at(data, offset)?;
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.log.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn flush(&self) -> Result<()> {
        self.log.sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.log.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn index_checkpoint_dir(&self, token: &Guid) -> Option<PathBuf> {
        Some(self.root.join("index-checkpoints").join(token.to_string()))
    }

    fn log_checkpoint_dir(&self, token: &Guid) -> Option<PathBuf> {
        Some(self.root.join("log-checkpoints").join(token.to_string()))
    }
}

/// Device that discards writes and fails reads. Useful for benchmarks and
/// purely in-memory workloads; anything that ages below the head address is
/// gone, and pending operations resolve with `IoError`.
#[derive(Default)]
pub struct NullDevice;

impl NullDevice {
    pub fn new() -> Self {
        NullDevice
    }
}

impl StorageDevice for NullDevice {
    fn write(&self, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(KvError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "null device holds no data",
        )))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        0
    }

    fn index_checkpoint_dir(&self, _token: &Guid) -> Option<PathBuf> {
        None
    }

    fn log_checkpoint_dir(&self, _token: &Guid) -> Option<PathBuf> {
        None
    }
}
