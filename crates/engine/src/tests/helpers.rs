use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::node::{Node, NodeRef};
use crate::read::{NodeSource, WriterView};
use crate::*;

/// Small nodes so a few hundred keys build a multi-level tree. Time-based
/// renewal and background compaction are off so tests stay deterministic.
pub fn small_opts() -> Options {
    Options::default()
        .with_max_node_size(256)
        .with_max_key_len(32)
        .with_renew_snap_root_after(Duration::ZERO)
        .with_compaction_thld(1_000_000)
        .with_delay_during_compaction(Duration::ZERO)
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

/// A fixed permutation of `0..n`, so inserts don't arrive sorted.
pub fn shuffled(n: usize) -> Vec<usize> {
    let mut v: Vec<usize> = (0..n).collect();
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
    for i in (1..n).rev() {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        v.swap(i, (x % (i as u64 + 1)) as usize);
    }
    v
}

pub fn collect(iter: RangeIter<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    iter.map(|r| r.map(|(k, v)| (k, v.value))).collect()
}

pub fn collect_history(iter: HistoryIter<'_>) -> Result<Vec<(Vec<u8>, u64)>> {
    iter.map(|r| r.map(|v| (v.value, v.version))).collect()
}

pub fn count_segments(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

pub fn writer_root(tree: &Tree) -> Option<NodeRef> {
    tree.inner.writer.lock().root
}

/// Walks the writer's tree and returns `(nodes, depth)`, asserting every
/// node respects the size ceiling and the key order.
pub fn check_tree(tree: &Tree) -> (usize, usize) {
    let inner: &Arc<TreeInner> = &tree.inner;
    let w = inner.writer.lock();
    let view = WriterView {
        inner,
        buffer: &w.buffer,
    };
    let Some(root) = w.root else {
        return (0, 0);
    };

    let max = inner.opts.max_node_size;
    let mut nodes = 0;
    let mut depth = 0;
    let mut level = vec![root];
    while !level.is_empty() {
        depth += 1;
        let mut next = Vec::new();
        for at in level {
            let node = view.node(at).unwrap();
            nodes += 1;
            assert!(node.encoded_len() <= max, "node {} is {} bytes", at, node.encoded_len());
            match &*node {
                Node::Leaf(entries) => {
                    assert!(entries.windows(2).all(|p| p[0].key < p[1].key));
                }
                Node::Inner(children) => {
                    assert!(children.windows(2).all(|p| p[0].min_key < p[1].min_key));
                    next.extend(children.iter().map(|c| c.node));
                }
            }
        }
        level = next;
    }
    (nodes, depth)
}
