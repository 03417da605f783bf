//! Writer-side staging of nodes and history records between flushes.

use std::collections::HashMap;
use std::sync::Arc;

use applog::LogRef;

use crate::history::HistoryRecord;
use crate::node::{Node, NodeRef};

/// Everything appended to the node and history logs since the last flush
/// or spill.
///
/// Appended bytes sit in the logs' write buffers and cannot be read back
/// from disk yet, so the writer resolves its own recent work from here.
/// Nodes replaced before they were ever committed are dropped right away;
/// no commit can reach them.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    nodes: HashMap<NodeRef, (Arc<Node>, usize)>,
    history: HashMap<LogRef, HistoryRecord>,
    /// Encoded bytes of everything staged.
    bytes: usize,
}

impl WriteBuffer {
    pub fn stage_node(&mut self, at: NodeRef, node: Arc<Node>, len: usize) {
        self.bytes += len;
        if let Some((_, old)) = self.nodes.insert(at, (node, len)) {
            self.bytes -= old;
        }
    }

    /// Drops a staged node that was just replaced. Returns `false` when
    /// `at` was not staged (it is already part of a commit).
    pub fn forget(&mut self, at: &NodeRef) -> bool {
        match self.nodes.remove(at) {
            Some((_, len)) => {
                self.bytes -= len;
                true
            }
            None => false,
        }
    }

    pub fn node(&self, at: &NodeRef) -> Option<Arc<Node>> {
        self.nodes.get(at).map(|(node, _)| Arc::clone(node))
    }

    pub fn stage_history(&mut self, at: LogRef, rec: HistoryRecord, len: usize) {
        self.bytes += len;
        self.history.insert(at, rec);
    }

    pub fn history(&self, at: &LogRef) -> Option<&HistoryRecord> {
        self.history.get(at)
    }

    /// Hands out the staged nodes and forgets everything.
    pub fn drain(&mut self) -> impl Iterator<Item = (NodeRef, Arc<Node>)> + '_ {
        self.history.clear();
        self.bytes = 0;
        self.nodes.drain().map(|(at, (node, _))| (at, node))
    }

    pub fn staged_bytes(&self) -> usize {
        self.bytes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn history_count(&self) -> usize {
        self.history.len()
    }
}

/// Flush and sync checkpoint markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurabilityStats {
    /// Flushes that were not part of a sync.
    pub flushes: u64,
    pub syncs: u64,
    /// Tree version at the last flush, if any.
    pub last_flush_version: Option<u64>,
    pub last_sync_version: Option<u64>,
    /// Times the staged set outgrew `flush_buffer_size` and was written out
    /// without a commit.
    pub spills: u64,
    /// Entries inserted since the last flush or sync.
    pub unflushed: usize,
    /// Entries inserted since the last sync.
    pub unsynced: usize,
}
