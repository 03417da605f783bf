//! Snapshots: read-only views pinned to one committed root.
//!
//! The registry tracks three things under one lock: the *current* snap
//! root handed to new snapshots, the latest *published* (synced) root it
//! is renewed from, and the set of live snapshots. The lock is only held
//! for pointer swaps and counter updates.
//!
//! Every root carries the compaction epoch it was published in. A
//! compaction round that moves the tree into fresh node segments bumps the
//! epoch; the old segments are retired once no live snapshot belongs to an
//! earlier epoch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, TreeError};
use crate::history::{HistoryIter, VersionedValue};
use crate::node::NodeRef;
use crate::read::{lookup, RangeIter};
use crate::TreeInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SnapRoot {
    pub root: Option<NodeRef>,
    pub ts: u64,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug)]
struct SnapState {
    current: SnapRoot,
    published: SnapRoot,
    renewed_at: Instant,
    /// Live snapshot id -> epoch of its root.
    live: HashMap<u64, u64>,
    next_id: u64,
    epoch: u64,
    /// `(epoch, segment)`: segments below `segment` may go once every live
    /// snapshot is at `epoch` or later.
    retire_queue: Vec<(u64, u32)>,
}

#[derive(Debug)]
pub(crate) struct SnapshotRegistry {
    state: Mutex<SnapState>,
    max_active: usize,
    renew_after: Duration,
}

impl SnapshotRegistry {
    pub fn new(root: SnapRoot, max_active: usize, renew_after: Duration) -> Self {
        Self {
            state: Mutex::new(SnapState {
                current: root,
                published: root,
                renewed_at: Instant::now(),
                live: HashMap::new(),
                next_id: 1,
                epoch: root.epoch,
                retire_queue: Vec::new(),
            }),
            max_active,
            renew_after,
        }
    }

    /// Records a freshly synced root. New snapshots see it after the next
    /// renewal.
    pub fn publish(&self, root: Option<NodeRef>, ts: u64, seq: u64) {
        let mut st = self.state.lock();
        st.published = SnapRoot {
            root,
            ts,
            seq,
            epoch: st.epoch,
        };
    }

    /// Checks capacity and reports whether the current root has to be
    /// renewed before a snapshot can be handed out.
    pub fn needs_renewal(&self, must_include: Option<u64>) -> Result<bool> {
        let st = self.state.lock();
        self.check_capacity(&st)?;
        let expired = !self.renew_after.is_zero() && st.renewed_at.elapsed() >= self.renew_after;
        let behind = must_include.is_some_and(|ts| st.current.ts < ts);
        Ok(expired || behind)
    }

    pub fn renew(&self) {
        let mut st = self.state.lock();
        st.current = st.published;
        st.renewed_at = Instant::now();
    }

    /// Time-based pointer swap; a no-op when renewal is disabled or not due.
    pub fn renew_if_due(&self) -> bool {
        if self.renew_after.is_zero() {
            return false;
        }
        let mut st = self.state.lock();
        if st.renewed_at.elapsed() < self.renew_after {
            return false;
        }
        st.current = st.published;
        st.renewed_at = Instant::now();
        true
    }

    pub fn register(&self) -> Result<(u64, SnapRoot)> {
        let mut st = self.state.lock();
        self.check_capacity(&st)?;
        let id = st.next_id;
        st.next_id += 1;
        let root = st.current;
        st.live.insert(id, root.epoch);
        Ok((id, root))
    }

    pub fn release(&self, id: u64) -> bool {
        self.state.lock().live.remove(&id).is_some()
    }

    pub fn active(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn current(&self) -> SnapRoot {
        self.state.lock().current
    }

    /// Enters a new compaction epoch whose roots only reach segments at or
    /// above `fresh_segment`, and points new snapshots at the latest root.
    pub fn advance_epoch(&self, fresh_segment: u32) -> u64 {
        let mut st = self.state.lock();
        st.epoch += 1;
        let epoch = st.epoch;
        st.published.epoch = epoch;
        st.current = st.published;
        st.renewed_at = Instant::now();
        st.retire_queue.push((epoch, fresh_segment));
        epoch
    }

    /// Pops every retirement no live snapshot blocks any more and returns
    /// the highest segment bound among them.
    pub fn take_retirable(&self) -> Option<u32> {
        let mut st = self.state.lock();
        let oldest = st.live.values().copied().min();
        let mut bound: Option<u32> = None;
        st.retire_queue.retain(|&(epoch, segment)| {
            let free = oldest.map_or(true, |o| o >= epoch);
            if free {
                bound = Some(bound.map_or(segment, |b| b.max(segment)));
            }
            !free
        });
        bound
    }

    /// Puts back a bound whose segments could not be deleted. No snapshot
    /// blocked it, so it is free again right away.
    pub fn requeue_retirement(&self, segment: u32) {
        self.state.lock().retire_queue.push((0, segment));
    }

    pub fn pending_retirements(&self) -> usize {
        self.state.lock().retire_queue.len()
    }

    fn check_capacity(&self, st: &SnapState) -> Result<()> {
        if st.live.len() >= self.max_active {
            return Err(TreeError::CapacityExceeded {
                max: self.max_active,
            });
        }
        Ok(())
    }
}

impl TreeInner {
    /// Capacity is checked before a possible renewal and again when the
    /// snapshot is registered. The registry lock is never held while the
    /// writer flushes.
    pub(crate) fn open_snapshot(self: &Arc<Self>, must_include: Option<u64>) -> Result<Snapshot> {
        self.check_open()?;
        if let Some(requested) = must_include {
            let latest = self.writer.lock().ts;
            if requested > latest {
                return Err(TreeError::VersionAhead { requested, latest });
            }
        }

        if self.snapshots.needs_renewal(must_include)? {
            if !self.opts.read_only {
                self.with_writer(|w| self.sync_locked(w))?;
            }
            self.snapshots.renew();
        }

        let (id, root) = self.snapshots.register()?;
        debug!(snapshot = id, version = root.ts, commit = root.seq, "snapshot opened");
        Ok(Snapshot::new(Arc::clone(self), id, root))
    }
}

/// A fixed point-in-time view of the tree.
///
/// Reads never block the writer. Closing (or dropping) the snapshot frees
/// its slot and may let retired node segments go.
pub struct Snapshot {
    inner: Arc<TreeInner>,
    id: u64,
    root: SnapRoot,
    released: bool,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("version", &self.root.ts)
            .field("commit", &self.root.seq)
            .field("epoch", &self.root.epoch)
            .finish()
    }
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<TreeInner>, id: u64, root: SnapRoot) -> Self {
        Self {
            inner,
            id,
            root,
            released: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Version of the newest entry this snapshot can see.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.root.ts
    }

    /// Sequence number of the commit this snapshot is bound to.
    #[must_use]
    pub fn commit_seq(&self) -> u64 {
        self.root.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<VersionedValue> {
        self.inner.check_open()?;
        self.inner.check_key(key)?;
        let entry = lookup(&*self.inner, self.root.root, key)?;
        Ok(VersionedValue {
            value: entry.value,
            version: entry.version,
        })
    }

    /// Entries with `start <= key < end` in ascending key order. An empty
    /// bound is unbounded.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<RangeIter<'_>> {
        self.inner.check_open()?;
        Ok(RangeIter::new(&self.inner, self.root.root, start, end))
    }

    /// Values of `key` as of this snapshot, newest first.
    pub fn history(&self, key: &[u8]) -> Result<HistoryIter<'_>> {
        self.inner.check_open()?;
        self.inner.check_key(key)?;
        let entry = lookup(&*self.inner, self.root.root, key)?;
        let current = VersionedValue {
            value: entry.value,
            version: entry.version,
        };
        Ok(HistoryIter::new(
            &self.inner.history,
            VecDeque::from([current]),
            entry.history,
            entry.history_len + 1,
        ))
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.inner.snapshots.release(self.id) {
            debug!(snapshot = self.id, "snapshot released");
            self.inner.retire_segments_logged();
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.release();
    }
}
