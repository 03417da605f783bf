/// Command parsing and execution for the interactive shell.
///
/// Every command writes its result to the given output; engine errors are
/// printed as `ERR ...` lines and never end the session. Only I/O errors on
/// the output itself are returned.
use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use engine::{RangeIter, Snapshot, Tree};
use tracing::debug;

/// What the REPL does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    tree: Tree,
    /// Snapshots opened with `SNAP`, by id.
    snapshots: BTreeMap<u64, Snapshot>,
}

impl Shell {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            snapshots: BTreeMap::new(),
        }
    }

    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(Flow::Continue);
        };
        debug!(command = cmd, "executing");

        match cmd.to_uppercase().as_str() {
            "SET" => {
                let key = parts.next();
                let value = parts.collect::<Vec<&str>>().join(" ");
                match key {
                    Some(k) if !value.is_empty() => {
                        match self.tree.insert(k.as_bytes(), value.as_bytes()) {
                            Ok(v) => writeln!(out, "OK (version={})", v)?,
                            Err(e) => writeln!(out, "ERR set failed: {}", e)?,
                        }
                    }
                    _ => writeln!(out, "ERR usage: SET key value")?,
                }
            }
            "GET" => match parts.next() {
                Some(k) => match self.tree.get(k.as_bytes()) {
                    Ok(v) => writeln!(out, "{}", String::from_utf8_lossy(&v.value))?,
                    Err(e) if e.is_not_found() => writeln!(out, "(nil)")?,
                    Err(e) => writeln!(out, "ERR read failed: {}", e)?,
                },
                None => writeln!(out, "ERR usage: GET key")?,
            },
            "HISTORY" => match parts.next() {
                Some(k) => self.history(k, out)?,
                None => writeln!(out, "ERR usage: HISTORY key")?,
            },
            "SCAN" => {
                let start = parts.next().unwrap_or("");
                let end = parts.next().unwrap_or("");
                match self.tree.snapshot_must_include(self.tree.version()) {
                    Ok(snap) => print_range(snap.range(start.as_bytes(), end.as_bytes()), out)?,
                    Err(e) => writeln!(out, "ERR scan failed: {}", e)?,
                }
            }
            "SNAP" => match self.tree.snapshot() {
                Ok(snap) => {
                    writeln!(out, "snapshot {} (version={})", snap.id(), snap.version())?;
                    self.snapshots.insert(snap.id(), snap);
                }
                Err(e) => writeln!(out, "ERR snapshot failed: {}", e)?,
            },
            "SNAPGET" => match (parse_id(parts.next()), parts.next()) {
                (Some(id), Some(k)) => match self.snapshots.get(&id) {
                    Some(snap) => match snap.get(k.as_bytes()) {
                        Ok(v) => writeln!(out, "{}", String::from_utf8_lossy(&v.value))?,
                        Err(e) if e.is_not_found() => writeln!(out, "(nil)")?,
                        Err(e) => writeln!(out, "ERR read failed: {}", e)?,
                    },
                    None => writeln!(out, "ERR no snapshot {}", id)?,
                },
                _ => writeln!(out, "ERR usage: SNAPGET id key")?,
            },
            "SNAPSCAN" => match parse_id(parts.next()) {
                Some(id) => {
                    let start = parts.next().unwrap_or("");
                    let end = parts.next().unwrap_or("");
                    match self.snapshots.get(&id) {
                        Some(snap) => {
                            print_range(snap.range(start.as_bytes(), end.as_bytes()), out)?
                        }
                        None => writeln!(out, "ERR no snapshot {}", id)?,
                    }
                }
                None => writeln!(out, "ERR usage: SNAPSCAN id [start] [end]")?,
            },
            "RELEASE" => match parse_id(parts.next()) {
                Some(id) => match self.snapshots.remove(&id) {
                    Some(snap) => {
                        snap.close();
                        writeln!(out, "OK")?;
                    }
                    None => writeln!(out, "ERR no snapshot {}", id)?,
                },
                None => writeln!(out, "ERR usage: RELEASE id")?,
            },
            "FLUSH" => match self.tree.flush() {
                Ok(()) => writeln!(out, "OK (version={})", self.tree.version())?,
                Err(e) => writeln!(out, "ERR flush failed: {}", e)?,
            },
            "SYNC" => match self.tree.sync() {
                Ok(()) => writeln!(out, "OK (version={})", self.tree.version())?,
                Err(e) => writeln!(out, "ERR sync failed: {}", e)?,
            },
            "COMPACT" => match self.tree.compact_force() {
                Ok(r) => writeln!(
                    out,
                    "OK (copied={}, relocated={}, fresh_segment={}, retired={})",
                    r.copied_nodes, r.relocated_nodes, r.fresh_segment, r.retired_segments
                )?,
                Err(e) => writeln!(out, "ERR compact failed: {}", e)?,
            },
            "STATS" => self.stats(out)?,
            "EXIT" | "QUIT" => {
                writeln!(out, "bye")?;
                return Ok(Flow::Exit);
            }
            other => writeln!(out, "unknown command: {}", other)?,
        }
        Ok(Flow::Continue)
    }

    /// Releases every open snapshot, then closes the tree.
    pub fn close(mut self) -> engine::Result<()> {
        self.snapshots.clear();
        self.tree.close()
    }

    fn history<W: Write>(&self, key: &str, out: &mut W) -> Result<()> {
        let iter = match self.tree.history(key.as_bytes()) {
            Ok(iter) => iter,
            Err(e) if e.is_not_found() => {
                writeln!(out, "(nil)")?;
                return Ok(());
            }
            Err(e) => {
                writeln!(out, "ERR history failed: {}", e)?;
                return Ok(());
            }
        };
        let total = iter.len();
        for item in iter {
            match item {
                Ok(v) => writeln!(out, "{} -> {}", v.version, String::from_utf8_lossy(&v.value))?,
                Err(e) => {
                    writeln!(out, "ERR history failed: {}", e)?;
                    return Ok(());
                }
            }
        }
        writeln!(out, "({} versions)", total)?;
        Ok(())
    }

    fn stats<W: Write>(&self, out: &mut W) -> Result<()> {
        let s = self.tree.stats();
        writeln!(out, "version:            {}", s.version)?;
        writeln!(out, "entries:            {}", s.entries)?;
        writeln!(out, "commit_seq:         {}", s.commit_seq)?;
        writeln!(out, "live_nodes:         {}", s.live_nodes)?;
        writeln!(out, "stale_nodes:        {}", s.stale_nodes)?;
        writeln!(out, "snapshot_version:   {}", s.snapshot_version)?;
        writeln!(out, "active_snapshots:   {}", s.active_snapshots)?;
        writeln!(out, "compactions:        {}", s.compactions)?;
        writeln!(
            out,
            "node_segments:      {}..={}",
            s.first_node_segment, s.last_node_segment
        )?;
        writeln!(
            out,
            "flushes/syncs:      {}/{}",
            s.durability.flushes, s.durability.syncs
        )?;
        writeln!(
            out,
            "cache:              {}/{} (hits={}, misses={})",
            s.cache.len, s.cache.capacity, s.cache.hits, s.cache.misses
        )?;
        Ok(())
    }
}

fn parse_id(arg: Option<&str>) -> Option<u64> {
    arg?.parse().ok()
}

fn print_range<W: Write>(range: engine::Result<RangeIter<'_>>, out: &mut W) -> Result<()> {
    let iter = match range {
        Ok(iter) => iter,
        Err(e) => {
            writeln!(out, "ERR scan failed: {}", e)?;
            return Ok(());
        }
    };
    let mut count = 0usize;
    for item in iter {
        match item {
            Ok((k, v)) => {
                writeln!(
                    out,
                    "{} -> {}",
                    String::from_utf8_lossy(&k),
                    String::from_utf8_lossy(&v.value)
                )?;
                count += 1;
            }
            Err(e) => {
                writeln!(out, "ERR scan failed: {}", e)?;
                return Ok(());
            }
        }
    }
    if count == 0 {
        writeln!(out, "(empty)")?;
    } else {
        writeln!(out, "({} entries)", count)?;
    }
    Ok(())
}
