//! # Engine - LedgerTree Storage Engine
//!
//! A persistent, multi-version B-tree over three append-only logs. Every
//! mutation writes new nodes (copy-on-write); nothing on disk is edited in
//! place. Old states stay readable through snapshots until compaction
//! moves the live tree into fresh segments.
//!
//! ## Architecture
//!
//! ```text
//!            insert / insert_batch                 snapshot / get / range
//!                    |                                       |
//!                    v                                       v
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ WRITER (single, locked)      │ publish  │ SNAPSHOT REGISTRY            │
//! │ copy-on-write descent        │ ───────> │ current root + live set      │
//! │ stage -> node log buffer     │  (sync)  │ renewed by maintenance thread│
//! │ flush / sync thresholds      │          └──────────────────────────────┘
//! └──────────────────────────────┘                         |
//!        |            |            |                      v
//!        v            v            v               ┌────────────┐
//!   nodes/*.n    history/*.h   commit/*.c  <────── │ NODE CACHE │
//!                                                  └────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                               |
//! |-----------------|-------------------------------------------------------|
//! | `lib.rs`        | `Tree`, open/close, accessors, `Debug`, `Drop`         |
//! | [`node`]        | node types, encoding, balanced splitting               |
//! | `write`         | insert path, staging, flush, sync, commit records      |
//! | `read`          | point lookup and range iteration                       |
//! | [`history`]     | history records and the lazy history walk              |
//! | `snapshot`      | snapshot registry and the `Snapshot` handle            |
//! | `compaction`    | background-safe rewrite into fresh segments            |
//! | `recovery`      | picking the last usable commit on open                 |
//! | `maintenance`   | the background renewal / compaction thread             |
//! | `meta`          | persisted creation-time parameters                     |
//!
//! ## On-Disk Layout
//!
//! ```text
//! <dir>/META            creation-time parameters
//! <dir>/nodes/*.n       encoded nodes
//! <dir>/history/*.h     superseded values
//! <dir>/commit/*.c      commit records
//! ```
//!
//! ## Crash Safety
//!
//! A commit is appended only after the nodes and history records it
//! reaches were handed to the OS, and on sync only after they were
//! fsynced, so a durable commit never points at non-durable bytes. On open
//! the last commit whose root decodes wins.
mod buffer;
mod commit;
mod compaction;
mod error;
pub mod history;
mod maintenance;
mod meta;
pub mod node;
mod read;
mod recovery;
mod snapshot;
mod write;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use applog::{AppLog, LogOptions, PoolStats};
use nodecache::{CacheStats, NodeCache};
use parking_lot::Mutex;
use tracing::{info, warn};

pub use buffer::DurabilityStats;
pub use commit::Commit;
pub use compaction::CompactionReport;
pub use config::Options;
pub use error::{Result, TreeError};
pub use history::{HistoryIter, VersionedValue};
pub use node::{ChildRef, LeafEntry, Node, NodeRef};
pub use read::RangeIter;
pub use snapshot::Snapshot;

use maintenance::{Maintenance, Shutdown};
use meta::Meta;
use snapshot::{SnapRoot, SnapshotRegistry};
use write::Writer;

pub const NODES_DIR: &str = "nodes";
pub const HISTORY_DIR: &str = "history";
pub const COMMIT_DIR: &str = "commit";

/// Point-in-time counters of an open tree.
#[derive(Debug, Clone)]
pub struct TreeStats {
    /// Last version handed out by the writer.
    pub version: u64,
    pub entries: u64,
    pub commit_seq: u64,
    pub live_nodes: u64,
    pub stale_nodes: u64,
    /// Version visible to a snapshot opened without renewal.
    pub snapshot_version: u64,
    pub active_snapshots: usize,
    pub compactions: u64,
    /// Compacted-away segment ranges still held back by old snapshots.
    pub pending_retirements: usize,
    pub staged_nodes: usize,
    pub staged_history: usize,
    /// Encoded size of the staged nodes and history records.
    pub staged_bytes: usize,
    pub first_node_segment: u32,
    pub last_node_segment: u32,
    pub durability: DurabilityStats,
    pub cache: CacheStats,
    pub nodes_pool: PoolStats,
}

/// State shared by the tree handle, its snapshots and the maintenance
/// thread.
pub(crate) struct TreeInner {
    pub(crate) dir: PathBuf,
    pub(crate) opts: Options,
    pub(crate) nodes: AppLog,
    pub(crate) history: AppLog,
    pub(crate) commits: AppLog,
    pub(crate) cache: NodeCache<NodeRef, Node>,
    pub(crate) writer: Mutex<Writer>,
    pub(crate) snapshots: SnapshotRegistry,
    /// Held for the whole of a compaction round.
    pub(crate) compacting: Mutex<()>,
    pub(crate) compactions: AtomicU64,
    pub(crate) shutdown: Shutdown,
    pub(crate) closed: AtomicBool,
}

/// A persistent multi-version B-tree.
///
/// # Write Path
///
/// 1. Validate the key and the encoded entry size.
/// 2. Assign the next version.
/// 3. Copy the root-to-leaf path with the change applied, splitting nodes
///    that outgrow `max_node_size`. Each new node is appended to the node
///    log buffer right away; an overwritten value goes to the history log.
/// 4. Every `flush_thld` entries, flush the logs and append a commit; every
///    `sync_thld` entries, also fsync all three logs.
///
/// # Read Path
///
/// [`Tree::get`] and [`Tree::history`] read the writer's own view, which
/// includes unflushed inserts. Snapshots read synced commits only and
/// never block the writer.
///
/// # Concurrency
///
/// `Tree` is `Send + Sync`; share it by reference. Writers serialize on an
/// internal lock.
pub struct Tree {
    inner: Arc<TreeInner>,
    maintenance: Option<Maintenance>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.inner.writer.lock();
        f.debug_struct("Tree")
            .field("dir", &self.inner.dir)
            .field("version", &w.ts)
            .field("entries", &w.entries)
            .field("commit_seq", &w.seq)
            .field("live_nodes", &w.live_nodes)
            .field("stale_nodes", &w.stale_nodes)
            .field("staged_nodes", &w.buffer.node_count())
            .field("active_snapshots", &self.inner.snapshots.active())
            .field("read_only", &self.inner.opts.read_only)
            .finish()
    }
}

impl Tree {
    /// Opens the tree in `dir`, creating it when missing (unless
    /// read-only).
    ///
    /// # Steps
    ///
    /// 1. Validate `opts`; an invalid combination never opens.
    /// 2. Load `META`, or write it for a new tree. Persisted `max_node_size`
    ///    and `file_size` override `opts`.
    /// 3. Open the node, history and commit logs.
    /// 4. Recover the last commit whose root decodes.
    /// 5. Retire node segments below that commit's lowest live segment.
    /// 6. Start the maintenance thread (writable trees only).
    pub fn open<P: AsRef<Path>>(dir: P, opts: Options) -> Result<Self> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let mut opts = opts;

        if !opts.read_only {
            applog::create_dir(&dir, opts.file_mode)?;
        }
        match Meta::load(&dir)? {
            Some(meta) => {
                opts.max_node_size = meta.max_node_size;
                opts.file_size = meta.file_size;
                opts.validate()?;
            }
            None if opts.read_only => {
                return Err(TreeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no tree at {}", dir.display()),
                )));
            }
            None => Meta::new(&dir, opts.max_node_size, opts.file_size).save()?,
        }

        let log_opts = |ext: &'static str, max_opened_files: usize| {
            LogOptions::new(ext)
                .with_file_size(opts.file_size)
                .with_file_mode(opts.file_mode)
                .with_max_opened_files(max_opened_files)
                .with_buffer_size(opts.flush_buffer_size)
                .with_read_only(opts.read_only)
        };
        let nodes = AppLog::open(
            dir.join(NODES_DIR),
            log_opts("n", opts.nodes_log_max_opened_files),
        )?;
        let history = AppLog::open(
            dir.join(HISTORY_DIR),
            log_opts("h", opts.history_log_max_opened_files),
        )?;
        let commits = AppLog::open(
            dir.join(COMMIT_DIR),
            log_opts("c", opts.commit_log_max_opened_files),
        )?;

        let recovered = recovery::last_usable_commit(&nodes, &commits)?;
        let commit = recovered.commit.unwrap_or_default();
        if !opts.read_only {
            if commit.min_segment > nodes.first_segment() {
                if let Err(e) = nodes.retire_before(commit.min_segment) {
                    warn!(dir = %dir.display(), error = %e, "failed to retire node segments");
                }
            }
            // skipped commits point past the recovered tail; keep new
            // records away from those offsets
            if recovered.skipped > 0 {
                nodes.rotate()?;
                history.rotate()?;
            }
        }
        let mut writer = Writer::from_commit(&commit);
        writer.seq = recovered.last_seq;

        let snapshots = SnapshotRegistry::new(
            SnapRoot {
                root: commit.root,
                ts: commit.ts,
                seq: commit.seq,
                epoch: 0,
            },
            opts.max_active_snapshots,
            opts.renew_snap_root_after,
        );

        let inner = Arc::new(TreeInner {
            cache: NodeCache::new(opts.cache_size),
            writer: Mutex::new(writer),
            snapshots,
            compacting: Mutex::new(()),
            compactions: AtomicU64::new(0),
            shutdown: Shutdown::new(),
            closed: AtomicBool::new(false),
            nodes,
            history,
            commits,
            dir,
            opts,
        });

        let maintenance = if inner.opts.read_only {
            None
        } else {
            Some(Maintenance::spawn(Arc::clone(&inner))?)
        };

        info!(
            dir = %inner.dir.display(),
            commit = commit.seq,
            version = commit.ts,
            entries = commit.entries,
            read_only = inner.opts.read_only,
            "tree opened"
        );
        Ok(Self { inner, maintenance })
    }

    /// Latest value of `key` as seen by the writer, unflushed inserts
    /// included.
    pub fn get(&self, key: &[u8]) -> Result<VersionedValue> {
        self.inner.get(key)
    }

    /// Every value `key` ever had as seen by the writer, newest first.
    pub fn history(&self, key: &[u8]) -> Result<HistoryIter<'_>> {
        self.inner.writer_history(key)
    }

    /// Inserts or overwrites `key`, returning the version assigned.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.inner
            .insert_entries(vec![(key.to_vec(), value.to_vec())])
    }

    /// Inserts several entries under one version. Keys must be distinct.
    pub fn insert_batch<K, V>(&self, entries: &[(K, V)]) -> Result<u64>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.inner.insert_entries(
            entries
                .iter()
                .map(|(k, v)| (k.as_ref().to_vec(), v.as_ref().to_vec()))
                .collect(),
        )
    }

    /// Opens a snapshot of the current snap root, renewing it first when
    /// `renew_snap_root_after` has elapsed.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.open_snapshot(None)
    }

    /// Opens a snapshot that sees at least everything up to `version`.
    pub fn snapshot_must_include(&self, version: u64) -> Result<Snapshot> {
        self.inner.open_snapshot(Some(version))
    }

    /// Range scan against `snapshot`; see [`Snapshot::range`].
    pub fn iterate<'s>(
        &self,
        start: &[u8],
        end: &[u8],
        snapshot: &'s Snapshot,
    ) -> Result<RangeIter<'s>> {
        snapshot.range(start, end)
    }

    /// Hands every insert so far to the OS and commits it. Snapshots only
    /// see it after the next sync.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_writable()?;
        self.inner.with_writer(|w| self.inner.flush_locked(w))
    }

    /// Forces every insert so far to stable storage and makes it visible
    /// to new snapshots.
    pub fn sync(&self) -> Result<()> {
        self.inner.check_writable()?;
        self.inner.with_writer(|w| self.inner.sync_locked(w))
    }

    /// Stops the maintenance thread and syncs outstanding writes.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Last version handed out.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.writer.lock().ts
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.writer.lock().entries
    }

    #[must_use]
    pub fn durability_stats(&self) -> DurabilityStats {
        let w = self.inner.writer.lock();
        DurabilityStats {
            unflushed: w.unflushed,
            unsynced: w.unsynced,
            ..w.stats
        }
    }

    #[must_use]
    pub fn active_snapshots(&self) -> usize {
        self.inner.snapshots.active()
    }

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let durability = self.durability_stats();
        let w = self.inner.writer.lock();
        TreeStats {
            version: w.ts,
            entries: w.entries,
            commit_seq: w.seq,
            live_nodes: w.live_nodes,
            stale_nodes: w.stale_nodes,
            snapshot_version: self.inner.snapshots.current().ts,
            active_snapshots: self.inner.snapshots.active(),
            compactions: self.inner.compactions.load(Ordering::Relaxed),
            pending_retirements: self.inner.snapshots.pending_retirements(),
            staged_nodes: w.buffer.node_count(),
            staged_history: w.buffer.history_count(),
            staged_bytes: w.buffer.staged_bytes(),
            first_node_segment: self.inner.nodes.first_segment(),
            last_node_segment: self.inner.nodes.last_segment(),
            durability,
            cache: self.inner.cache.stats(),
            nodes_pool: self.inner.nodes.pool_stats(),
        }
    }

    /// Effective options (persisted creation-time values applied).
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.trigger();
        if let Some(m) = self.maintenance.take() {
            m.join();
        }

        let result = if self.inner.opts.read_only {
            Ok(())
        } else {
            let mut w = self.inner.writer.lock();
            if w.poisoned {
                Err(TreeError::Poisoned)
            } else {
                self.inner.sync_locked(&mut w)
            }
        };
        info!(dir = %self.inner.dir.display(), ok = result.is_ok(), "tree closed");
        result
    }
}

/// Best-effort close on drop.
///
/// Errors are logged and otherwise dropped: whatever was not synced is
/// lost the same way a crash would lose it.
impl Drop for Tree {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(dir = %self.inner.dir.display(), error = %e, "close on drop failed");
        }
    }
}

impl TreeInner {
    pub(crate) fn load_node(&self, at: NodeRef) -> Result<Arc<Node>> {
        self.cache.get_or_load(&at, || {
            let bytes = self.nodes.read(at)?;
            Node::decode(&bytes).map_err(|reason| TreeError::CorruptNode { at, reason })
        })
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TreeError::Closed);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.opts.read_only {
            return Err(TreeError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        if key.len() > self.opts.max_key_len {
            return Err(TreeError::KeyTooLong {
                len: key.len(),
                max: self.opts.max_key_len,
            });
        }
        Ok(())
    }

    /// Payload bytes a node may hold besides its header.
    pub(crate) fn max_payload(&self) -> usize {
        self.opts.max_node_size - config::NODE_HEADER_SIZE
    }

    pub(crate) fn retire_segments_logged(&self) {
        if self.closed.load(Ordering::SeqCst) || self.opts.read_only {
            return;
        }
        if let Err(e) = self.retire_segments() {
            warn!(error = %e, "failed to retire node segments");
        }
    }
}

#[cfg(test)]
mod tests;
