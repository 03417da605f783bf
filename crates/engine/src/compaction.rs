/// Compaction: moves the live tree into fresh node segments so the old
/// ones, full of superseded nodes, can be deleted.
///
/// The writer keeps running during a round. Only the last phase takes the
/// writer lock, and readers are never blocked at all: old segments stay on
/// disk until no snapshot from an earlier epoch is left.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::{Result, TreeError};
use crate::node::{ChildRef, Node, NodeRef};
use crate::read::{NodeSource, WriterView};
use crate::write::Writer;
use crate::{Tree, TreeInner};

/// Nodes copied between two pauses.
pub const COMPACTION_BATCH: usize = 64;

/// Attempts per copy step before the round is abandoned.
const MAX_ATTEMPTS: u32 = 3;

/// Outcome of one compaction round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Nodes reachable from the base root, rewritten densely.
    pub copied_nodes: u64,
    /// Writer nodes created during the round that had to be rewritten.
    pub relocated_nodes: u64,
    /// First segment of the compacted tree.
    pub fresh_segment: u32,
    /// Segments deleted right away (zero while older snapshots are open).
    pub retired_segments: usize,
}

impl Tree {
    /// Runs one compaction round if it is due.
    ///
    /// # Errors
    ///
    /// [`TreeError::CompactionThresholdNotReached`] when the stale ratio is
    /// below `compaction_thld` or `cleanup_percentage`, and
    /// [`TreeError::CompactionInProgress`] while another round runs.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.inner.compact(false)
    }

    /// Runs one compaction round regardless of the thresholds.
    pub fn compact_force(&self) -> Result<CompactionReport> {
        self.inner.compact(true)
    }

    #[must_use]
    pub fn compaction_due(&self) -> bool {
        self.inner.compaction_due()
    }
}

impl TreeInner {
    pub(crate) fn compaction_due(&self) -> bool {
        let w = self.writer.lock();
        !w.poisoned && self.due_locked(&w)
    }

    fn due_locked(&self, w: &Writer) -> bool {
        let (live, stale) = (w.live_nodes, w.stale_nodes);
        if stale == 0 {
            return false;
        }
        let ratio = stale >= (self.opts.compaction_thld as u64).saturating_mul(live);
        let percentage = stale as f64 * 100.0 / (stale + live) as f64;
        ratio && percentage >= f64::from(self.opts.cleanup_percentage)
    }

    /// # Steps
    ///
    /// 1. Under the writer lock: flush, rotate the node log so everything
    ///    from now on lands in segments `>= S`, capture the base root.
    /// 2. Without the lock: copy every node reachable from the base root,
    ///    children first, into the fresh segments. Pause between batches.
    /// 3. Under the writer lock: rewrite the writer's newer inner nodes that
    ///    still point below `S`, durably commit, enter a new epoch.
    /// 4. Retire segments below `S` unless older snapshots are open.
    pub(crate) fn compact(&self, force: bool) -> Result<CompactionReport> {
        self.check_writable()?;
        let Some(_round) = self.compacting.try_lock() else {
            return Err(TreeError::CompactionInProgress);
        };
        let started = Instant::now();

        let (base, fresh, created_before) = self.with_writer(|w| {
            if !force && !self.due_locked(w) {
                return Err(TreeError::CompactionThresholdNotReached);
            }
            self.flush_locked(w)?;
            let fresh = self.nodes.rotate()?;
            Ok((w.root, fresh, w.created_nodes))
        })?;

        let mut mapping = HashMap::new();
        let copied = match base {
            Some(root) => self.copy_reachable(root, &mut mapping)?,
            None => 0,
        };
        let copies: HashSet<NodeRef> = mapping.values().copied().collect();

        let relocated = self.with_writer(|w| {
            let before = w.created_nodes;
            if let Some(root) = w.root {
                w.root = Some(self.relocate(w, root, fresh, &mapping, &copies)?);
            }
            let relocated = w.created_nodes - before;

            let written = copied + (w.created_nodes - created_before);
            w.stale_nodes = written.saturating_sub(w.live_nodes);
            w.min_segment = fresh;
            w.dirty = true;
            // old segments go away next; the new root must be durable first
            self.commit_locked(w, true)?;
            w.stats.syncs += 1;
            w.stats.last_sync_version = Some(w.ts);
            w.unflushed = 0;
            w.unsynced = 0;
            self.snapshots.advance_epoch(fresh);
            Ok(relocated)
        })?;

        // the round itself is committed; a failed delete is retried later
        let retired = self.retire_segments().unwrap_or_else(|e| {
            warn!(error = %e, "failed to retire node segments");
            0
        });
        self.compactions.fetch_add(1, Ordering::Relaxed);
        info!(
            copied,
            relocated,
            fresh_segment = fresh,
            retired,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(CompactionReport {
            copied_nodes: copied,
            relocated_nodes: relocated,
            fresh_segment: fresh,
            retired_segments: retired,
        })
    }

    /// Post-order copy of the subtree at `root`. Fills `mapping` with
    /// old -> new location and returns the number of nodes written.
    fn copy_reachable(
        &self,
        root: NodeRef,
        mapping: &mut HashMap<NodeRef, NodeRef>,
    ) -> Result<u64> {
        struct Frame {
            at: NodeRef,
            node: Arc<Node>,
            next_child: usize,
        }

        let mut stack = vec![Frame {
            at: root,
            node: self.with_retries(|| self.load_node(root))?,
            next_child: 0,
        }];
        let mut copied = 0u64;
        let mut in_batch = 0usize;

        while let Some(top) = stack.last_mut() {
            if let Node::Inner(children) = &*top.node {
                if let Some(child) = children.get(top.next_child).map(|c| c.node) {
                    top.next_child += 1;
                    let node = self.with_retries(|| self.load_node(child))?;
                    stack.push(Frame {
                        at: child,
                        node,
                        next_child: 0,
                    });
                    continue;
                }
            }

            let Some(frame) = stack.pop() else { break };
            let moved = remap(frame.at, &frame.node, mapping)?;
            let new_at = self.with_retries(|| Ok(self.nodes.append(&moved.encode()?)?))?;
            mapping.insert(frame.at, new_at);
            copied += 1;
            in_batch += 1;
            if in_batch == COMPACTION_BATCH {
                in_batch = 0;
                self.pause()?;
            }
        }
        Ok(copied)
    }

    /// Returns where the subtree at `at` lives after compaction, rewriting
    /// writer nodes that still point into the old segments.
    fn relocate(
        &self,
        w: &mut Writer,
        at: NodeRef,
        fresh: u32,
        mapping: &HashMap<NodeRef, NodeRef>,
        copies: &HashSet<NodeRef>,
    ) -> Result<NodeRef> {
        if at.segment < fresh {
            return mapping.get(&at).copied().ok_or_else(|| TreeError::CorruptNode {
                at,
                reason: "reachable node missing from compacted copy".to_string(),
            });
        }
        if copies.contains(&at) {
            return Ok(at);
        }

        let node = WriterView {
            inner: self,
            buffer: &w.buffer,
        }
        .node(at)?;
        let Node::Inner(children) = &*node else {
            return Ok(at);
        };

        let mut changed = false;
        let mut moved = Vec::with_capacity(children.len());
        for c in children {
            let node = self.relocate(w, c.node, fresh, mapping, copies)?;
            changed |= node != c.node;
            moved.push(ChildRef { node, ..c.clone() });
        }
        if !changed {
            return Ok(at);
        }
        self.restage(w, at, Node::Inner(moved))
    }

    fn with_retries<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    error!(attempt, error = %e, "compaction step failed, retrying");
                    attempt += 1;
                    self.pause()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits `delay_during_compaction`; fails with `Closed` on shutdown.
    fn pause(&self) -> Result<()> {
        if self.shutdown.wait(self.opts.delay_during_compaction) {
            return Err(TreeError::Closed);
        }
        Ok(())
    }

    /// Deletes node segments no live snapshot can reach any more.
    pub(crate) fn retire_segments(&self) -> Result<usize> {
        let Some(below) = self.snapshots.take_retirable() else {
            return Ok(0);
        };
        self.nodes.retire_before(below).map_err(|e| {
            self.snapshots.requeue_retirement(below);
            TreeError::from(e)
        })
    }
}

/// Copy of `node` with child pointers moved to their new locations.
fn remap(at: NodeRef, node: &Node, mapping: &HashMap<NodeRef, NodeRef>) -> Result<Node> {
    match node {
        Node::Leaf(entries) => Ok(Node::Leaf(entries.clone())),
        Node::Inner(children) => children
            .iter()
            .map(|c| match mapping.get(&c.node) {
                Some(&node) => Ok(ChildRef { node, ..c.clone() }),
                None => Err(TreeError::CorruptNode {
                    at,
                    reason: format!("child {} not copied before parent", c.node),
                }),
            })
            .collect::<Result<Vec<_>>>()
            .map(Node::Inner),
    }
}
