/// Read path: point lookups and ordered range scans.
///
/// Lookups descend from a root, picking at each inner node the last child
/// whose minimum key does not exceed the search key. Where the nodes come
/// from depends on the caller: snapshots resolve flushed nodes through the
/// cache, the writer additionally sees what it staged since the last flush.
use std::sync::Arc;

use crate::buffer::WriteBuffer;
use crate::error::{Result, TreeError};
use crate::history::VersionedValue;
use crate::node::{child_index, LeafEntry, Node, NodeRef};
use crate::TreeInner;

/// Resolves node references to decoded nodes.
pub(crate) trait NodeSource {
    fn node(&self, at: NodeRef) -> Result<Arc<Node>>;
}

impl NodeSource for TreeInner {
    fn node(&self, at: NodeRef) -> Result<Arc<Node>> {
        self.load_node(at)
    }
}

/// The writer's view: staged nodes first, then cache and log.
pub(crate) struct WriterView<'a> {
    pub inner: &'a TreeInner,
    pub buffer: &'a WriteBuffer,
}

impl NodeSource for WriterView<'_> {
    fn node(&self, at: NodeRef) -> Result<Arc<Node>> {
        match self.buffer.node(&at) {
            Some(node) => Ok(node),
            None => self.inner.load_node(at),
        }
    }
}

/// Finds the leaf entry for `key` below `root`.
pub(crate) fn lookup<S: NodeSource + ?Sized>(
    src: &S,
    root: Option<NodeRef>,
    key: &[u8],
) -> Result<LeafEntry> {
    let mut at = root.ok_or(TreeError::KeyNotFound)?;
    loop {
        let node = src.node(at)?;
        match &*node {
            Node::Inner(children) => at = children[child_index(children, key)].node,
            Node::Leaf(entries) => {
                return entries
                    .binary_search_by(|e| e.key.as_slice().cmp(key))
                    .map(|i| entries[i].clone())
                    .map_err(|_| TreeError::KeyNotFound);
            }
        }
    }
}

enum Step {
    Yield(Vec<u8>, VersionedValue),
    Descend(NodeRef),
    Pop,
    Done,
}

/// Lazy in-order walk over `start <= key < end`.
///
/// Holds the path from the root to the current leaf; every node on it is
/// an `Arc` the cache cannot take away.
pub struct RangeIter<'a> {
    inner: &'a TreeInner,
    root: Option<NodeRef>,
    start: Vec<u8>,
    end: Vec<u8>,
    stack: Vec<(Arc<Node>, usize)>,
    started: bool,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(
        inner: &'a TreeInner,
        root: Option<NodeRef>,
        start: &[u8],
        end: &[u8],
    ) -> Self {
        let empty = !end.is_empty() && start >= end;
        Self {
            inner,
            root,
            start: start.to_vec(),
            end: end.to_vec(),
            stack: Vec::new(),
            started: false,
            done: empty || root.is_none(),
        }
    }

    /// Positions the stack on the first entry `>= start`.
    fn seek(&mut self) -> Result<()> {
        let Some(mut at) = self.root else {
            return Ok(());
        };
        loop {
            let node = self.inner.load_node(at)?;
            match &*node {
                Node::Inner(children) => {
                    let idx = child_index(children, &self.start);
                    at = children[idx].node;
                    self.stack.push((node.clone(), idx + 1));
                }
                Node::Leaf(entries) => {
                    let pos = entries.partition_point(|e| e.key < self.start);
                    self.stack.push((node.clone(), pos));
                    return Ok(());
                }
            }
        }
    }

    fn step(&mut self) -> Step {
        let Some((node, idx)) = self.stack.last_mut() else {
            return Step::Done;
        };
        match &**node {
            Node::Leaf(entries) => match entries.get(*idx) {
                Some(e) => {
                    *idx += 1;
                    if !self.end.is_empty() && e.key >= self.end {
                        return Step::Done;
                    }
                    Step::Yield(
                        e.key.clone(),
                        VersionedValue {
                            value: e.value.clone(),
                            version: e.version,
                        },
                    )
                }
                None => Step::Pop,
            },
            Node::Inner(children) => match children.get(*idx) {
                Some(c) => {
                    *idx += 1;
                    Step::Descend(c.node)
                }
                None => Step::Pop,
            },
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, VersionedValue)>> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        loop {
            match self.step() {
                Step::Yield(key, value) => return Ok(Some((key, value))),
                Step::Descend(at) => {
                    let node = self.inner.load_node(at)?;
                    self.stack.push((node, 0));
                }
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Done => return Ok(None),
            }
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<(Vec<u8>, VersionedValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                self.stack.clear();
                None
            }
            Err(e) => {
                self.done = true;
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}
