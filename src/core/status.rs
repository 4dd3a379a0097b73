/// Result of a point operation against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// The operation was deep-copied onto the session's pending queue and
    /// will be resolved by `complete_pending`.
    Pending = 1,
    NotFound = 2,
    OutOfMemory = 3,
    IoError = 4,
    Corruption = 5,
    Aborted = 6,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
        }
    }

    /// True for anything other than a completed or deferred operation.
    pub fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
