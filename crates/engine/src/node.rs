//! Tree nodes and their on-log encoding.
//!
//! ```text
//! node  := [kind: u8][count: u32 LE][entry * count]
//! leaf  := [key_len u32][key][value_len u32][value][version u64]
//!          [has_history u8][history segment u32][history offset u64]
//!          [history_len u64]
//! inner := [key_len u32][min_key][segment u32][offset u64][version u64]
//! ```
//!
//! The history ref is always written (zeroed when absent) so every leaf
//! entry costs exactly `key + value + LEAF_ENTRY_OVERHEAD` bytes.

use std::io::{self, Cursor, Read};

use applog::LogRef;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::{LEAF_ENTRY_OVERHEAD, NODE_HEADER_SIZE};

/// Location of a node in the node log.
pub type NodeRef = LogRef;

const KIND_LEAF: u8 = 1;
const KIND_INNER: u8 = 2;

/// Fixed bytes an inner entry spends besides its key.
pub const INNER_ENTRY_OVERHEAD: usize = 4 + LogRef::ENCODED_LEN + 8;

/// One key of a leaf with its current value and a pointer into the
/// history log for prior values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    /// Newest prior value, if the key was ever overwritten.
    pub history: Option<LogRef>,
    /// Number of prior values reachable through `history`.
    pub history_len: u64,
}

impl LeafEntry {
    pub fn new(key: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        Self {
            key,
            value,
            version,
            history: None,
            history_len: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.len() + LEAF_ENTRY_OVERHEAD
    }
}

/// Pointer from an inner node to a child subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    /// Smallest key in the subtree.
    pub min_key: Vec<u8>,
    pub node: NodeRef,
    /// Highest version in the subtree.
    pub version: u64,
}

impl ChildRef {
    pub fn encoded_len(&self) -> usize {
        self.min_key.len() + INNER_ENTRY_OVERHEAD
    }
}

/// An immutable tree node. Entries and children are sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Vec<LeafEntry>),
    Inner(Vec<ChildRef>),
}

impl Node {
    pub fn min_key(&self) -> &[u8] {
        match self {
            Node::Leaf(entries) => entries.first().map(|e| e.key.as_slice()),
            Node::Inner(children) => children.first().map(|c| c.min_key.as_slice()),
        }
        .unwrap_or_default()
    }

    pub fn max_version(&self) -> u64 {
        match self {
            Node::Leaf(entries) => entries.iter().map(|e| e.version).max(),
            Node::Inner(children) => children.iter().map(|c| c.version).max(),
        }
        .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Inner(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encoded_len(&self) -> usize {
        NODE_HEADER_SIZE
            + match self {
                Node::Leaf(entries) => entries.iter().map(LeafEntry::encoded_len).sum::<usize>(),
                Node::Inner(children) => children.iter().map(ChildRef::encoded_len).sum(),
            }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Node::Leaf(entries) => {
                buf.write_u8(KIND_LEAF)?;
                buf.write_u32::<LittleEndian>(entries.len() as u32)?;
                for e in entries {
                    buf.write_u32::<LittleEndian>(e.key.len() as u32)?;
                    buf.extend_from_slice(&e.key);
                    buf.write_u32::<LittleEndian>(e.value.len() as u32)?;
                    buf.extend_from_slice(&e.value);
                    buf.write_u64::<LittleEndian>(e.version)?;
                    write_opt_ref(&mut buf, e.history)?;
                    buf.write_u64::<LittleEndian>(e.history_len)?;
                }
            }
            Node::Inner(children) => {
                buf.write_u8(KIND_INNER)?;
                buf.write_u32::<LittleEndian>(children.len() as u32)?;
                for c in children {
                    buf.write_u32::<LittleEndian>(c.min_key.len() as u32)?;
                    buf.extend_from_slice(&c.min_key);
                    buf.write_u32::<LittleEndian>(c.node.segment)?;
                    buf.write_u64::<LittleEndian>(c.node.offset)?;
                    buf.write_u64::<LittleEndian>(c.version)?;
                }
            }
        }
        Ok(buf)
    }

    /// Decodes a node, reporting what was wrong on failure.
    pub fn decode(bytes: &[u8]) -> Result<Node, String> {
        let mut rdr = Cursor::new(bytes);
        let kind = rdr.read_u8().map_err(short)?;
        let count = rdr.read_u32::<LittleEndian>().map_err(short)? as usize;
        // every entry needs at least its fixed overhead
        if count.saturating_mul(INNER_ENTRY_OVERHEAD.min(LEAF_ENTRY_OVERHEAD)) > bytes.len() {
            return Err(format!("entry count {} exceeds node size", count));
        }

        let node = match kind {
            KIND_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = read_bytes(&mut rdr)?;
                    let value = read_bytes(&mut rdr)?;
                    let version = rdr.read_u64::<LittleEndian>().map_err(short)?;
                    let history = read_opt_ref(&mut rdr)?;
                    let history_len = rdr.read_u64::<LittleEndian>().map_err(short)?;
                    entries.push(LeafEntry {
                        key,
                        value,
                        version,
                        history,
                        history_len,
                    });
                }
                Node::Leaf(entries)
            }
            KIND_INNER => {
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let min_key = read_bytes(&mut rdr)?;
                    let segment = rdr.read_u32::<LittleEndian>().map_err(short)?;
                    let offset = rdr.read_u64::<LittleEndian>().map_err(short)?;
                    let version = rdr.read_u64::<LittleEndian>().map_err(short)?;
                    children.push(ChildRef {
                        min_key,
                        node: LogRef::new(segment, offset),
                        version,
                    });
                }
                if children.is_empty() {
                    return Err("inner node without children".to_string());
                }
                Node::Inner(children)
            }
            other => return Err(format!("unknown node kind {}", other)),
        };

        if rdr.position() as usize != bytes.len() {
            return Err(format!(
                "{} trailing bytes",
                bytes.len() - rdr.position() as usize
            ));
        }
        Ok(node)
    }
}

/// Index of the child whose subtree may hold `key`: the last child whose
/// `min_key <= key`, or the first child for keys below every separator.
pub fn child_index(children: &[ChildRef], key: &[u8]) -> usize {
    children
        .partition_point(|c| c.min_key.as_slice() <= key)
        .saturating_sub(1)
}

/// Splits `items` into as few chunks as needed for each to stay within
/// `max_payload` bytes, balancing chunk sizes.
///
/// Every single item must already fit in `max_payload`.
pub fn split_to_fit<T, F>(items: Vec<T>, size_of: F, max_payload: usize) -> Vec<Vec<T>>
where
    F: Fn(&T) -> usize,
{
    let total: usize = items.iter().map(&size_of).sum();
    if total <= max_payload || items.len() < 2 {
        return vec![items];
    }

    let chunks = total.div_ceil(max_payload);
    let target = total.div_ceil(chunks);

    let mut out = Vec::with_capacity(chunks + 1);
    let mut cur = Vec::new();
    let mut cur_size = 0;
    for item in items {
        let size = size_of(&item);
        if !cur.is_empty() && (cur_size >= target || cur_size + size > max_payload) {
            out.push(std::mem::take(&mut cur));
            cur_size = 0;
        }
        cur_size += size;
        cur.push(item);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

pub(crate) fn write_opt_ref(buf: &mut Vec<u8>, at: Option<LogRef>) -> io::Result<()> {
    let r = at.unwrap_or(LogRef::new(0, 0));
    buf.write_u8(u8::from(at.is_some()))?;
    buf.write_u32::<LittleEndian>(r.segment)?;
    buf.write_u64::<LittleEndian>(r.offset)
}

pub(crate) fn read_opt_ref(rdr: &mut Cursor<&[u8]>) -> Result<Option<LogRef>, String> {
    let flag = rdr.read_u8().map_err(short)?;
    let segment = rdr.read_u32::<LittleEndian>().map_err(short)?;
    let offset = rdr.read_u64::<LittleEndian>().map_err(short)?;
    match flag {
        0 => Ok(None),
        1 => Ok(Some(LogRef::new(segment, offset))),
        other => Err(format!("invalid ref flag {}", other)),
    }
}

pub(crate) fn read_bytes(rdr: &mut Cursor<&[u8]>) -> Result<Vec<u8>, String> {
    let len = rdr.read_u32::<LittleEndian>().map_err(short)? as usize;
    let remaining = rdr.get_ref().len() - rdr.position() as usize;
    if len > remaining {
        return Err(format!("length {} exceeds remaining {} bytes", len, remaining));
    }
    let mut out = vec![0u8; len];
    rdr.read_exact(&mut out).map_err(short)?;
    Ok(out)
}

fn short(e: io::Error) -> String {
    format!("short read: {}", e)
}
