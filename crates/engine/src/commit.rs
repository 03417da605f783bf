//! Commit records: the only durable pointer to a tree state.
//!
//! ```text
//! [seq u64][has_root u8][root segment u32][root offset u64][ts u64]
//! [entries u64][unix_ms u64][live_nodes u64][stale_nodes u64]
//! [min_segment u32]
//! ```

use std::io::{self, Cursor};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::node::{read_opt_ref, write_opt_ref, NodeRef};

pub const COMMIT_RECORD_LEN: usize = 8 + 1 + 12 + 8 + 8 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Commit {
    /// Strictly increasing per commit.
    pub seq: u64,
    /// `None` for a tree without entries.
    pub root: Option<NodeRef>,
    /// Version of the newest entry reachable from `root`.
    pub ts: u64,
    /// Distinct keys in the tree.
    pub entries: u64,
    pub unix_ms: u64,
    pub live_nodes: u64,
    pub stale_nodes: u64,
    /// Lowest node segment anything reachable from `root` lives in.
    pub min_segment: u32,
}

impl Commit {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(COMMIT_RECORD_LEN);
        buf.write_u64::<LittleEndian>(self.seq)?;
        write_opt_ref(&mut buf, self.root)?;
        buf.write_u64::<LittleEndian>(self.ts)?;
        buf.write_u64::<LittleEndian>(self.entries)?;
        buf.write_u64::<LittleEndian>(self.unix_ms)?;
        buf.write_u64::<LittleEndian>(self.live_nodes)?;
        buf.write_u64::<LittleEndian>(self.stale_nodes)?;
        buf.write_u32::<LittleEndian>(self.min_segment)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != COMMIT_RECORD_LEN {
            return Err(format!(
                "commit record is {} bytes, expected {}",
                bytes.len(),
                COMMIT_RECORD_LEN
            ));
        }
        let mut rdr = Cursor::new(bytes);
        let short = |e: io::Error| format!("short read: {}", e);
        Ok(Self {
            seq: rdr.read_u64::<LittleEndian>().map_err(short)?,
            root: read_opt_ref(&mut rdr)?,
            ts: rdr.read_u64::<LittleEndian>().map_err(short)?,
            entries: rdr.read_u64::<LittleEndian>().map_err(short)?,
            unix_ms: rdr.read_u64::<LittleEndian>().map_err(short)?,
            live_nodes: rdr.read_u64::<LittleEndian>().map_err(short)?,
            stale_nodes: rdr.read_u64::<LittleEndian>().map_err(short)?,
            min_segment: rdr.read_u32::<LittleEndian>().map_err(short)?,
        })
    }
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
