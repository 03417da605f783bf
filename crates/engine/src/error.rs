use applog::{LogError, LogRef};
use config::ConfigError;
use thiserror::Error;

/// Errors returned by [`Tree`](crate::Tree) and [`Snapshot`](crate::Snapshot).
#[derive(Debug, Error)]
pub enum TreeError {
    /// Invalid options; the tree never opened.
    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("key must not be empty")]
    EmptyKey,

    #[error("key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    /// Key plus value do not fit in half a node.
    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },

    /// The same key appears twice in one batch.
    #[error("duplicate key in batch")]
    DuplicateKey,

    /// The normal not-found signal of `get` and `history`.
    #[error("key not found")]
    KeyNotFound,

    #[error("too many active snapshots (max {max})")]
    CapacityExceeded { max: usize },

    /// A snapshot was requested at a version the tree has not reached.
    #[error("version {requested} is ahead of the tree (latest {latest})")]
    VersionAhead { requested: u64, latest: u64 },

    #[error("tree is read-only")]
    ReadOnly,

    #[error("tree is closed")]
    Closed,

    #[error("corrupt node at {at}: {reason}")]
    CorruptNode { at: LogRef, reason: String },

    #[error("corrupt history record at {at}: {reason}")]
    CorruptHistory { at: LogRef, reason: String },

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid META file: {0}")]
    Meta(String),

    /// An earlier write or sync failed; the tree must be reopened.
    #[error("writer poisoned by an earlier failure; reopen the tree")]
    Poisoned,

    #[error("version counter overflow")]
    VersionOverflow,

    #[error("compaction already in progress")]
    CompactionInProgress,

    #[error("compaction threshold not reached")]
    CompactionThresholdNotReached,
}

impl TreeError {
    /// True for [`TreeError::KeyNotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, TreeError::KeyNotFound)
    }

    /// Argument errors reject a call without touching any state.
    #[must_use]
    pub fn is_argument(&self) -> bool {
        matches!(
            self,
            TreeError::EmptyKey
                | TreeError::KeyTooLong { .. }
                | TreeError::EntryTooLarge { .. }
                | TreeError::DuplicateKey
                | TreeError::VersionAhead { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
