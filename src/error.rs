use std::fmt;

use crate::storage::StorageError;

/// Errors surfaced by the replication core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// A fan-out could not assemble a majority of successful replies
    /// before its deadline.
    NoQuorum,
    NoSuchPartition,
    NoSuchReplica,
    NoSuchNode,
    NoSuchToken,
    NoSuchBucket,
    NoSuchSite,
    /// The underlying KV engine reported an I/O or corruption error.
    Storage(String),
    /// A sync peer sent an unexpected or malformed message. Local to the
    /// session; the session ends with SYNC_ABORT.
    ProtocolViolation(String),
    /// Deadline elapsed or the operation was explicitly cancelled.
    Cancelled,
    /// Empty key, empty key list, or an unknown bucket name.
    InvalidInput,
    /// The partition is write-locked for an ownership transfer.
    PartitionLocked,
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::NoQuorum => write!(f, "no quorum"),
            DbError::NoSuchPartition => write!(f, "the specified partition does not exist"),
            DbError::NoSuchReplica => write!(f, "the specified partition replica does not exist"),
            DbError::NoSuchNode => write!(f, "the specified node does not exist"),
            DbError::NoSuchToken => write!(f, "the specified token does not exist"),
            DbError::NoSuchBucket => write!(f, "the specified bucket does not exist"),
            DbError::NoSuchSite => write!(f, "the specified site does not exist"),
            DbError::Storage(e) => write!(f, "storage failure: {e}"),
            DbError::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            DbError::Cancelled => write!(f, "cancelled"),
            DbError::InvalidInput => write!(f, "invalid input"),
            DbError::PartitionLocked => write!(f, "partition is locked"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<StorageError> for DbError {
    fn from(e: StorageError) -> Self {
        DbError::Storage(e.to_string())
    }
}
