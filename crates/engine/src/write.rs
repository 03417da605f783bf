/// Write path: inserts, node staging, flush, sync and commit records.
///
/// A single writer owns [`Writer`] behind the tree's lock. Inserts copy
/// the root-to-leaf path; every node they produce is appended to the node
/// log buffer immediately and kept in the write buffer until the next
/// flush makes it readable from disk.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error};

use crate::buffer::{DurabilityStats, WriteBuffer};
use crate::commit::{unix_ms, Commit};
use crate::error::{Result, TreeError};
use crate::history::{HistoryIter, HistoryRecord, VersionedValue};
use crate::node::{child_index, split_to_fit, ChildRef, LeafEntry, Node, NodeRef};
use crate::read::{lookup, NodeSource, WriterView};
use crate::TreeInner;
use config::LEAF_ENTRY_OVERHEAD;

/// Mutable state of the single writer.
#[derive(Debug)]
pub(crate) struct Writer {
    pub root: Option<NodeRef>,
    /// Last version handed out.
    pub ts: u64,
    pub entries: u64,
    /// Sequence number of the last commit written.
    pub seq: u64,
    pub live_nodes: u64,
    pub stale_nodes: u64,
    /// Nodes appended by this writer since open; compaction measures its
    /// delta with it.
    pub created_nodes: u64,
    pub min_segment: u32,
    pub buffer: WriteBuffer,
    pub unflushed: usize,
    pub unsynced: usize,
    /// Root changed since the last commit.
    pub dirty: bool,
    pub poisoned: bool,
    pub stats: DurabilityStats,
}

impl Writer {
    pub fn from_commit(c: &Commit) -> Self {
        Self {
            root: c.root,
            ts: c.ts,
            entries: c.entries,
            seq: c.seq,
            live_nodes: c.live_nodes,
            stale_nodes: c.stale_nodes,
            created_nodes: 0,
            min_segment: c.min_segment,
            buffer: WriteBuffer::default(),
            unflushed: 0,
            unsynced: 0,
            dirty: false,
            poisoned: false,
            stats: DurabilityStats::default(),
        }
    }

    /// `at` is no longer reachable from the writer's root.
    fn retire_node(&mut self, at: NodeRef) {
        self.buffer.forget(&at);
        self.live_nodes = self.live_nodes.saturating_sub(1);
        self.stale_nodes += 1;
    }
}

impl TreeInner {
    /// Runs `f` with the writer locked. An I/O or corruption failure
    /// poisons the writer for good.
    pub(crate) fn with_writer<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Writer) -> Result<T>,
    {
        let mut w = self.writer.lock();
        if w.poisoned {
            return Err(TreeError::Poisoned);
        }
        let result = f(&mut w);
        if let Err(e) = &result {
            if matches!(
                e,
                TreeError::Log(_)
                    | TreeError::Io(_)
                    | TreeError::CorruptNode { .. }
                    | TreeError::CorruptHistory { .. }
            ) {
                error!(dir = %self.dir.display(), error = %e, "writer poisoned");
                w.poisoned = true;
            }
        }
        result
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<VersionedValue> {
        self.check_open()?;
        self.check_key(key)?;
        let w = self.writer.lock();
        if w.poisoned {
            return Err(TreeError::Poisoned);
        }
        let view = WriterView {
            inner: self,
            buffer: &w.buffer,
        };
        let entry = lookup(&view, w.root, key)?;
        Ok(VersionedValue {
            value: entry.value,
            version: entry.version,
        })
    }

    /// History as seen by the writer. Records not flushed yet are the
    /// newest part of the chain; they are copied out so the walk can
    /// continue on disk without the lock.
    pub(crate) fn writer_history(&self, key: &[u8]) -> Result<HistoryIter<'_>> {
        self.check_open()?;
        self.check_key(key)?;
        let w = self.writer.lock();
        if w.poisoned {
            return Err(TreeError::Poisoned);
        }
        let view = WriterView {
            inner: self,
            buffer: &w.buffer,
        };
        let entry = lookup(&view, w.root, key)?;

        let mut pending = VecDeque::from([VersionedValue {
            value: entry.value,
            version: entry.version,
        }]);
        let mut next = entry.history;
        while let Some(rec) = next.and_then(|at| w.buffer.history(&at)) {
            pending.push_back(VersionedValue {
                value: rec.value.clone(),
                version: rec.version,
            });
            next = rec.prev;
        }
        Ok(HistoryIter::new(
            &self.history,
            pending,
            next,
            entry.history_len + 1,
        ))
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let size = key.len() + value.len() + LEAF_ENTRY_OVERHEAD;
        let max = self.opts.max_entry_size();
        if size > max {
            return Err(TreeError::EntryTooLarge { size, max });
        }
        Ok(())
    }

    pub(crate) fn insert_entries(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<u64> {
        self.check_writable()?;
        for (k, v) in &entries {
            self.check_entry(k, v)?;
        }
        if entries.len() > 1 {
            let mut seen = HashSet::with_capacity(entries.len());
            if !entries.iter().all(|(k, _)| seen.insert(k.as_slice())) {
                return Err(TreeError::DuplicateKey);
            }
        }

        self.with_writer(|w| {
            let ts = w.ts.checked_add(1).ok_or(TreeError::VersionOverflow)?;
            if entries.is_empty() {
                return Ok(w.ts);
            }
            let count = entries.len();
            for (key, value) in entries {
                let children = match w.root {
                    None => {
                        w.entries += 1;
                        self.stage_leaf(w, vec![LeafEntry::new(key, value, ts)])?
                    }
                    Some(root) => self.insert_at(w, root, key, value, ts)?,
                };
                let root = self.grow_root(w, children)?;
                w.root = Some(root);
                if w.buffer.staged_bytes() >= self.opts.flush_buffer_size {
                    self.spill_locked(w)?;
                }
            }
            w.ts = ts;
            w.dirty = true;
            w.unflushed += count;
            w.unsynced += count;

            if w.unsynced >= self.opts.sync_thld {
                self.sync_locked(w)?;
            } else if w.unflushed >= self.opts.flush_thld {
                self.flush_locked(w)?;
            }
            Ok(ts)
        })
    }

    /// Copy-on-write insert below `at`. Returns the nodes replacing `at`
    /// (more than one when it split).
    fn insert_at(
        &self,
        w: &mut Writer,
        at: NodeRef,
        key: Vec<u8>,
        value: Vec<u8>,
        ts: u64,
    ) -> Result<Vec<ChildRef>> {
        let node = WriterView {
            inner: self,
            buffer: &w.buffer,
        }
        .node(at)?;
        w.retire_node(at);

        match &*node {
            Node::Leaf(entries) => {
                let mut entries = entries.clone();
                match entries.binary_search_by(|e| e.key.as_slice().cmp(&key)) {
                    Ok(i) => {
                        let old = &entries[i];
                        let rec = HistoryRecord {
                            value: old.value.clone(),
                            version: old.version,
                            prev: old.history,
                        };
                        let history_len = old.history_len + 1;
                        let history = self.stage_history(w, rec)?;
                        entries[i] = LeafEntry {
                            key,
                            value,
                            version: ts,
                            history: Some(history),
                            history_len,
                        };
                    }
                    Err(i) => {
                        w.entries += 1;
                        entries.insert(i, LeafEntry::new(key, value, ts));
                    }
                }
                self.stage_leaf(w, entries)
            }
            Node::Inner(children) => {
                let idx = child_index(children, &key);
                let replaced = self.insert_at(w, children[idx].node, key, value, ts)?;
                let mut children = children.clone();
                children.splice(idx..=idx, replaced);
                self.stage_inner(w, children)
            }
        }
    }

    /// Stacks inner levels on top of `children` until one root remains.
    fn grow_root(&self, w: &mut Writer, mut children: Vec<ChildRef>) -> Result<NodeRef> {
        while children.len() > 1 {
            children = self.stage_inner(w, children)?;
        }
        match children.pop() {
            Some(root) => Ok(root.node),
            None => unreachable!("insert produced no nodes"),
        }
    }

    fn stage_leaf(&self, w: &mut Writer, entries: Vec<LeafEntry>) -> Result<Vec<ChildRef>> {
        split_to_fit(entries, LeafEntry::encoded_len, self.max_payload())
            .into_iter()
            .map(|chunk| self.stage(w, Node::Leaf(chunk)))
            .collect()
    }

    fn stage_inner(&self, w: &mut Writer, children: Vec<ChildRef>) -> Result<Vec<ChildRef>> {
        split_to_fit(children, ChildRef::encoded_len, self.max_payload())
            .into_iter()
            .map(|chunk| self.stage(w, Node::Inner(chunk)))
            .collect()
    }

    /// Appends `node` to the node log buffer and keeps it resolvable by the
    /// writer until the next flush.
    pub(crate) fn stage(&self, w: &mut Writer, node: Node) -> Result<ChildRef> {
        let bytes = node.encode()?;
        let at = self.nodes.append(&bytes)?;
        let child = ChildRef {
            min_key: node.min_key().to_vec(),
            node: at,
            version: node.max_version(),
        };
        w.buffer.stage_node(at, Arc::new(node), bytes.len());
        w.live_nodes += 1;
        w.created_nodes += 1;
        Ok(child)
    }

    /// Replaces `at` with `node`, keeping the node counters balanced.
    pub(crate) fn restage(&self, w: &mut Writer, at: NodeRef, node: Node) -> Result<NodeRef> {
        w.retire_node(at);
        Ok(self.stage(w, node)?.node)
    }

    fn stage_history(&self, w: &mut Writer, rec: HistoryRecord) -> Result<applog::LogRef> {
        let bytes = rec.encode()?;
        let at = self.history.append(&bytes)?;
        w.buffer.stage_history(at, rec, bytes.len());
        Ok(at)
    }

    /// Makes staged work readable from the logs and appends a commit the
    /// writer can recover from. A no-op when nothing changed since the last
    /// commit.
    pub(crate) fn flush_locked(&self, w: &mut Writer) -> Result<()> {
        if !w.dirty {
            return Ok(());
        }
        self.commit_locked(w, false)?;
        w.stats.flushes += 1;
        w.stats.last_flush_version = Some(w.ts);
        w.unflushed = 0;
        debug!(commit = w.seq, version = w.ts, "flushed");
        Ok(())
    }

    /// Writes the staged nodes and history out to the logs and hands the
    /// nodes to the cache, without a commit. Keeps the write buffer within
    /// `flush_buffer_size` between checkpoints.
    fn spill_locked(&self, w: &mut Writer) -> Result<()> {
        self.nodes.flush()?;
        self.history.flush()?;
        let bytes = w.buffer.staged_bytes();
        for (at, node) in w.buffer.drain() {
            self.cache.put(at, node);
        }
        w.stats.spills += 1;
        debug!(bytes, version = w.ts, "write buffer spilled");
        Ok(())
    }

    /// Flush plus fsync of nodes, history and commits, in that order.
    pub(crate) fn sync_locked(&self, w: &mut Writer) -> Result<()> {
        if !w.dirty && w.unsynced == 0 {
            return Ok(());
        }
        if w.dirty {
            self.commit_locked(w, true)?;
        } else {
            self.nodes.sync()?;
            self.history.sync()?;
            self.commits.sync()?;
            // the last flushed commit just became durable
            self.snapshots.publish(w.root, w.ts, w.seq);
        }
        w.stats.syncs += 1;
        w.stats.last_sync_version = Some(w.ts);
        w.unflushed = 0;
        w.unsynced = 0;
        debug!(commit = w.seq, version = w.ts, "synced");
        Ok(())
    }

    /// Appends a commit for the writer's root after the bytes it reaches.
    /// Only a durable commit is handed to the snapshot registry.
    pub(crate) fn commit_locked(&self, w: &mut Writer, durable: bool) -> Result<()> {
        if durable {
            self.nodes.sync()?;
            self.history.sync()?;
        } else {
            self.nodes.flush()?;
            self.history.flush()?;
        }

        let commit = Commit {
            seq: w.seq + 1,
            root: w.root,
            ts: w.ts,
            entries: w.entries,
            unix_ms: unix_ms(),
            live_nodes: w.live_nodes,
            stale_nodes: w.stale_nodes,
            min_segment: w.min_segment,
        };
        self.commits.append(&commit.encode()?)?;
        if durable {
            self.commits.sync()?;
        } else {
            self.commits.flush()?;
        }

        w.seq = commit.seq;
        w.dirty = false;
        for (at, node) in w.buffer.drain() {
            self.cache.put(at, node);
        }
        if durable {
            self.snapshots.publish(w.root, w.ts, w.seq);
        }
        Ok(())
    }
}
