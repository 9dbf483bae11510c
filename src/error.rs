use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Outcome of an MVCC read. `Abort` is returned when a read-write query
/// observes another transaction's uncommitted tail version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStat<T> {
    Success(T),
    NotFound,
    Abort,
}

impl<T> ReadStat<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadStat<U> {
        match self {
            ReadStat::Success(v) => ReadStat::Success(f(v)),
            ReadStat::NotFound => ReadStat::NotFound,
            ReadStat::Abort => ReadStat::Abort,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, ReadStat::Abort)
    }
}

/// Outcome of an MVCC write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStat {
    Success,
    /// The tail version is owned by another live transaction.
    Conflict,
    NotFound,
}

impl WriteStat {
    pub fn ok(self) -> bool {
        matches!(self, WriteStat::Success)
    }
}
