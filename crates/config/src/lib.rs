//! # Config - LedgerTree Tree Options
//!
//! Every tunable of the tree lives in [`Options`]. Values are validated once,
//! when the tree is opened; a tree never becomes usable with an invalid
//! combination.
//!
//! ## Example
//!
//! ```rust
//! use config::Options;
//!
//! let opts = Options::default()
//!     .with_flush_thld(2)
//!     .with_sync_thld(4)
//!     .with_cache_size(64);
//! opts.validate().unwrap();
//! ```
//!
//! ## Environment
//!
//! [`Options::from_env`] overlays `LEDGERTREE_*` variables on top of the
//! defaults:
//!
//! ```text
//! LEDGERTREE_MAX_NODE_SIZE         LEDGERTREE_FLUSH_THLD
//! LEDGERTREE_SYNC_THLD             LEDGERTREE_FLUSH_BUFFER_SIZE
//! LEDGERTREE_CLEANUP_PERCENTAGE    LEDGERTREE_MAX_ACTIVE_SNAPSHOTS
//! LEDGERTREE_RENEW_SNAP_ROOT_MS    LEDGERTREE_CACHE_SIZE
//! LEDGERTREE_READ_ONLY             LEDGERTREE_FILE_MODE (octal)
//! LEDGERTREE_FILE_SIZE             LEDGERTREE_MAX_KEY_LEN
//! LEDGERTREE_COMPACTION_THLD       LEDGERTREE_COMPACTION_DELAY_MS
//! LEDGERTREE_NODES_LOG_MAX_OPENED_FILES
//! LEDGERTREE_HISTORY_LOG_MAX_OPENED_FILES
//! LEDGERTREE_COMMIT_LOG_MAX_OPENED_FILES
//! ```

use std::time::Duration;

use thiserror::Error;

/// Default serialized node size ceiling in bytes.
pub const DEFAULT_MAX_NODE_SIZE: usize = 4096;
/// Default number of inserted entries that triggers a flush.
pub const DEFAULT_FLUSH_THLD: usize = 100_000;
/// Default number of inserted entries that triggers a durable sync.
pub const DEFAULT_SYNC_THLD: usize = 1_000_000;
/// Default write buffer capacity of each log, in bytes.
pub const DEFAULT_FLUSH_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_CLEANUP_PERCENTAGE: f32 = 0.0;
pub const DEFAULT_MAX_ACTIVE_SNAPSHOTS: usize = 100;
pub const DEFAULT_RENEW_SNAP_ROOT_AFTER: Duration = Duration::from_millis(1000);
pub const DEFAULT_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_FILE_MODE: u32 = 0o755;
/// Default segment rotation size (64 MiB).
pub const DEFAULT_FILE_SIZE: u64 = 1 << 26;
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;
pub const DEFAULT_COMPACTION_THLD: usize = 2;
pub const DEFAULT_DELAY_DURING_COMPACTION: Duration = Duration::from_millis(10);

pub const DEFAULT_NODES_LOG_MAX_OPENED_FILES: usize = 10;
pub const DEFAULT_HISTORY_LOG_MAX_OPENED_FILES: usize = 1;
pub const DEFAULT_COMMIT_LOG_MAX_OPENED_FILES: usize = 1;

/// Smallest accepted `max_node_size`.
pub const MIN_NODE_SIZE: usize = 128;
/// Smallest accepted `cache_size`.
pub const MIN_CACHE_SIZE: usize = 1;

/// Bytes a node spends on its own header (kind byte + entry count).
pub const NODE_HEADER_SIZE: usize = 1 + 4;

/// Fixed bytes a leaf entry spends besides key and value:
/// key_len (u32) + value_len (u32) + version (u64) + history ref flag (u8)
/// + history ref (u32 + u64) + history_len (u64).
pub const LEAF_ENTRY_OVERHEAD: usize = 4 + 4 + 8 + 1 + 12 + 8;

/// Errors produced by [`Options::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_node_size {0} is below the minimum of {MIN_NODE_SIZE}")]
    NodeSizeTooSmall(usize),

    #[error("flush_thld must be greater than zero")]
    ZeroFlushThld,

    #[error("flush_thld {flush} exceeds sync_thld {sync}")]
    FlushAboveSync { flush: usize, sync: usize },

    #[error("flush_buffer_size must be greater than zero")]
    ZeroFlushBuffer,

    #[error("cleanup_percentage {0} is outside 0..=100")]
    CleanupPercentageOutOfRange(f32),

    #[error("{0} must be greater than zero")]
    ZeroOpenedFiles(&'static str),

    #[error("max_active_snapshots must be greater than zero")]
    ZeroMaxActiveSnapshots,

    #[error("cache_size {0} is below the minimum of {MIN_CACHE_SIZE}")]
    CacheTooSmall(usize),

    #[error("max_key_len must be greater than zero")]
    ZeroMaxKeyLen,

    #[error("max_key_len {key_len} cannot fit in a node of {node_size} bytes")]
    KeyLenExceedsNode { key_len: usize, node_size: usize },

    #[error("compaction_thld must be greater than zero")]
    ZeroCompactionThld,

    #[error("file_size must be greater than zero")]
    ZeroFileSize,

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Tree configuration.
///
/// `max_node_size` and `file_size` only take effect when a tree is created;
/// an existing tree keeps the values it was created with.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub max_node_size: usize,
    pub flush_thld: usize,
    pub sync_thld: usize,
    pub flush_buffer_size: usize,
    /// Percentage (0..=100) of stale nodes tolerated before compaction is
    /// considered at all.
    pub cleanup_percentage: f32,
    pub max_active_snapshots: usize,
    /// Zero disables time-based renewal of the snapshot root.
    pub renew_snap_root_after: Duration,
    pub cache_size: usize,
    pub read_only: bool,
    /// Unix permission bits for created files and directories.
    pub file_mode: u32,
    pub file_size: u64,
    pub nodes_log_max_opened_files: usize,
    pub history_log_max_opened_files: usize,
    pub commit_log_max_opened_files: usize,
    pub max_key_len: usize,
    /// Stale-to-live node ratio that makes compaction due.
    pub compaction_thld: usize,
    pub delay_during_compaction: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            flush_thld: DEFAULT_FLUSH_THLD,
            sync_thld: DEFAULT_SYNC_THLD,
            flush_buffer_size: DEFAULT_FLUSH_BUFFER_SIZE,
            cleanup_percentage: DEFAULT_CLEANUP_PERCENTAGE,
            max_active_snapshots: DEFAULT_MAX_ACTIVE_SNAPSHOTS,
            renew_snap_root_after: DEFAULT_RENEW_SNAP_ROOT_AFTER,
            cache_size: DEFAULT_CACHE_SIZE,
            read_only: false,
            file_mode: DEFAULT_FILE_MODE,
            file_size: DEFAULT_FILE_SIZE,
            nodes_log_max_opened_files: DEFAULT_NODES_LOG_MAX_OPENED_FILES,
            history_log_max_opened_files: DEFAULT_HISTORY_LOG_MAX_OPENED_FILES,
            commit_log_max_opened_files: DEFAULT_COMMIT_LOG_MAX_OPENED_FILES,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            compaction_thld: DEFAULT_COMPACTION_THLD,
            delay_during_compaction: DEFAULT_DELAY_DURING_COMPACTION,
        }
    }
}

macro_rules! with_option {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty) => {
        $(#[$doc])*
        #[must_use]
        pub fn $name(mut self, $field: $ty) -> Self {
            self.$field = $field;
            self
        }
    };
}

impl Options {
    with_option!(with_max_node_size, max_node_size: usize);
    with_option!(with_flush_thld, flush_thld: usize);
    with_option!(with_sync_thld, sync_thld: usize);
    with_option!(with_flush_buffer_size, flush_buffer_size: usize);
    with_option!(with_cleanup_percentage, cleanup_percentage: f32);
    with_option!(with_max_active_snapshots, max_active_snapshots: usize);
    with_option!(
        /// Zero disables time-based renewal.
        with_renew_snap_root_after, renew_snap_root_after: Duration
    );
    with_option!(with_cache_size, cache_size: usize);
    with_option!(with_read_only, read_only: bool);
    with_option!(with_file_mode, file_mode: u32);
    with_option!(with_file_size, file_size: u64);
    with_option!(with_nodes_log_max_opened_files, nodes_log_max_opened_files: usize);
    with_option!(with_history_log_max_opened_files, history_log_max_opened_files: usize);
    with_option!(with_commit_log_max_opened_files, commit_log_max_opened_files: usize);
    with_option!(with_max_key_len, max_key_len: usize);
    with_option!(with_compaction_thld, compaction_thld: usize);
    with_option!(with_delay_during_compaction, delay_during_compaction: Duration);

    /// Largest encoded leaf entry (key + value + overhead) a node accepts.
    ///
    /// Half a node, so that any overflowing node splits into chunks that each
    /// respect `max_node_size`.
    #[must_use]
    pub fn max_entry_size(&self) -> usize {
        (self.max_node_size - NODE_HEADER_SIZE) / 2
    }

    /// Checks every option and every cross-option rule.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_node_size < MIN_NODE_SIZE {
            return Err(ConfigError::NodeSizeTooSmall(self.max_node_size));
        }
        if self.flush_thld == 0 {
            return Err(ConfigError::ZeroFlushThld);
        }
        if self.flush_thld > self.sync_thld {
            return Err(ConfigError::FlushAboveSync {
                flush: self.flush_thld,
                sync: self.sync_thld,
            });
        }
        if self.flush_buffer_size == 0 {
            return Err(ConfigError::ZeroFlushBuffer);
        }
        if !(0.0..=100.0).contains(&self.cleanup_percentage) {
            return Err(ConfigError::CleanupPercentageOutOfRange(
                self.cleanup_percentage,
            ));
        }
        if self.nodes_log_max_opened_files == 0 {
            return Err(ConfigError::ZeroOpenedFiles("nodes_log_max_opened_files"));
        }
        if self.history_log_max_opened_files == 0 {
            return Err(ConfigError::ZeroOpenedFiles("history_log_max_opened_files"));
        }
        if self.commit_log_max_opened_files == 0 {
            return Err(ConfigError::ZeroOpenedFiles("commit_log_max_opened_files"));
        }
        if self.max_active_snapshots == 0 {
            return Err(ConfigError::ZeroMaxActiveSnapshots);
        }
        if self.cache_size < MIN_CACHE_SIZE {
            return Err(ConfigError::CacheTooSmall(self.cache_size));
        }
        if self.max_key_len == 0 {
            return Err(ConfigError::ZeroMaxKeyLen);
        }
        if self.max_key_len + LEAF_ENTRY_OVERHEAD > self.max_entry_size() {
            return Err(ConfigError::KeyLenExceedsNode {
                key_len: self.max_key_len,
                node_size: self.max_node_size,
            });
        }
        if self.compaction_thld == 0 {
            return Err(ConfigError::ZeroCompactionThld);
        }
        if self.file_size == 0 {
            return Err(ConfigError::ZeroFileSize);
        }
        Ok(())
    }

    /// Builds options from `LEDGERTREE_*` environment variables, using the
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] when a variable is set but cannot
    /// be parsed. The result is not validated; call [`Options::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Options::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv { var, value }),
            }
        }

        let d = Self::default();
        let l: &dyn Fn(&str) -> Option<String> = &lookup;

        let file_mode = match l("LEDGERTREE_FILE_MODE") {
            None => d.file_mode,
            Some(value) => u32::from_str_radix(value.trim().trim_start_matches("0o"), 8)
                .map_err(|_| ConfigError::InvalidEnv {
                    var: "LEDGERTREE_FILE_MODE",
                    value,
                })?,
        };

        Ok(Self {
            max_node_size: parse(l, "LEDGERTREE_MAX_NODE_SIZE", d.max_node_size)?,
            flush_thld: parse(l, "LEDGERTREE_FLUSH_THLD", d.flush_thld)?,
            sync_thld: parse(l, "LEDGERTREE_SYNC_THLD", d.sync_thld)?,
            flush_buffer_size: parse(l, "LEDGERTREE_FLUSH_BUFFER_SIZE", d.flush_buffer_size)?,
            cleanup_percentage: parse(l, "LEDGERTREE_CLEANUP_PERCENTAGE", d.cleanup_percentage)?,
            max_active_snapshots: parse(
                l,
                "LEDGERTREE_MAX_ACTIVE_SNAPSHOTS",
                d.max_active_snapshots,
            )?,
            renew_snap_root_after: Duration::from_millis(parse(
                l,
                "LEDGERTREE_RENEW_SNAP_ROOT_MS",
                d.renew_snap_root_after.as_millis() as u64,
            )?),
            cache_size: parse(l, "LEDGERTREE_CACHE_SIZE", d.cache_size)?,
            read_only: parse(l, "LEDGERTREE_READ_ONLY", d.read_only)?,
            file_mode,
            file_size: parse(l, "LEDGERTREE_FILE_SIZE", d.file_size)?,
            nodes_log_max_opened_files: parse(
                l,
                "LEDGERTREE_NODES_LOG_MAX_OPENED_FILES",
                d.nodes_log_max_opened_files,
            )?,
            history_log_max_opened_files: parse(
                l,
                "LEDGERTREE_HISTORY_LOG_MAX_OPENED_FILES",
                d.history_log_max_opened_files,
            )?,
            commit_log_max_opened_files: parse(
                l,
                "LEDGERTREE_COMMIT_LOG_MAX_OPENED_FILES",
                d.commit_log_max_opened_files,
            )?,
            max_key_len: parse(l, "LEDGERTREE_MAX_KEY_LEN", d.max_key_len)?,
            compaction_thld: parse(l, "LEDGERTREE_COMPACTION_THLD", d.compaction_thld)?,
            delay_during_compaction: Duration::from_millis(parse(
                l,
                "LEDGERTREE_COMPACTION_DELAY_MS",
                d.delay_during_compaction.as_millis() as u64,
            )?),
        })
    }
}

#[cfg(test)]
mod tests;
