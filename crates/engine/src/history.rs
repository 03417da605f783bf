//! Per-key value history.
//!
//! Overwriting a key appends the value it replaces to the history log as a
//! [`HistoryRecord`] pointing at the record before it. A leaf entry keeps
//! the newest record's location, so a key's history is a singly linked
//! chain read newest-first.

use std::collections::VecDeque;
use std::io::{self, Cursor};

use applog::{AppLog, LogRef};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TreeError};
use crate::node::{read_bytes, read_opt_ref, write_opt_ref};

/// A value together with the version that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// A superseded value in the history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub value: Vec<u8>,
    pub version: u64,
    pub prev: Option<LogRef>,
}

impl HistoryRecord {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.value.len() + 4 + 8 + 1 + LogRef::ENCODED_LEN);
        buf.write_u32::<LittleEndian>(self.value.len() as u32)?;
        buf.extend_from_slice(&self.value);
        buf.write_u64::<LittleEndian>(self.version)?;
        write_opt_ref(&mut buf, self.prev)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        let mut rdr = Cursor::new(bytes);
        let value = read_bytes(&mut rdr)?;
        let version = rdr
            .read_u64::<LittleEndian>()
            .map_err(|e| format!("short read: {}", e))?;
        let prev = read_opt_ref(&mut rdr)?;
        if rdr.position() as usize != bytes.len() {
            return Err("trailing bytes".to_string());
        }
        Ok(Self {
            value,
            version,
            prev,
        })
    }

    pub(crate) fn read(log: &AppLog, at: LogRef) -> Result<Self> {
        let bytes = log.read(at)?;
        Self::decode(&bytes).map_err(|reason| TreeError::CorruptHistory { at, reason })
    }
}

/// Lazy newest-first walk over a key's values, current value included.
///
/// Values the writer has not flushed yet are carried along in memory; the
/// rest of the chain is read from the history log one record per step.
pub struct HistoryIter<'a> {
    log: &'a AppLog,
    pending: VecDeque<VersionedValue>,
    next: Option<LogRef>,
    remaining: u64,
    total: u64,
}

impl<'a> HistoryIter<'a> {
    pub(crate) fn new(
        log: &'a AppLog,
        pending: VecDeque<VersionedValue>,
        next: Option<LogRef>,
        total: u64,
    ) -> Self {
        Self {
            log,
            pending,
            next,
            remaining: total,
            total,
        }
    }

    /// Length of the whole chain, independent of how far iteration went.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<VersionedValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if let Some(v) = self.pending.pop_front() {
            self.remaining -= 1;
            return Some(Ok(v));
        }
        let Some(at) = self.next else {
            self.remaining = 0;
            return None;
        };
        match HistoryRecord::read(self.log, at) {
            Ok(rec) => {
                self.remaining -= 1;
                self.next = rec.prev;
                Some(Ok(VersionedValue {
                    value: rec.value,
                    version: rec.version,
                }))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // a read failure ends the walk early
        (self.pending.len(), Some(self.remaining as usize))
    }
}
