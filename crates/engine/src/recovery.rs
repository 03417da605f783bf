//! Cold-start path: finding the commit a reopened tree continues from.
//!
//! The commit log is replayed front to back, segment by segment. Commits
//! are then tried newest first; the first one whose root node reads and
//! decodes wins. A commit whose root is unreadable (its nodes never reached
//! the disk) is skipped with a warning, never half-used.
use applog::{AppLog, LogError};
use tracing::warn;

use crate::commit::Commit;
use crate::error::Result;
use crate::node::Node;

/// Outcome of the commit replay.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    /// Commit the tree continues from; `None` for a tree without one.
    pub commit: Option<Commit>,
    /// Highest sequence number in the log. New commits must go above it,
    /// even when the newest ones were skipped.
    pub last_seq: u64,
    /// Newer commits passed over because their root was unreadable.
    pub skipped: usize,
}

pub(crate) fn last_usable_commit(nodes: &AppLog, commits: &AppLog) -> Result<Recovered> {
    let mut found: Vec<Commit> = Vec::new();
    for segment in commits.first_segment()..=commits.last_segment() {
        let scanned = commits.scan_segment(segment, |at, body| {
            match Commit::decode(&body) {
                Ok(c) => {
                    // seq only grows; anything else is debris
                    if found.last().map_or(true, |prev| c.seq > prev.seq) {
                        found.push(c);
                    } else {
                        warn!(at = %at, seq = c.seq, "ignoring out-of-order commit");
                    }
                }
                Err(reason) => warn!(at = %at, %reason, "ignoring undecodable commit"),
            }
            Ok(())
        });
        match scanned {
            Ok(()) => {}
            // a torn segment was followed by a fresh one on reopen
            Err(LogError::Corrupt(at)) => {
                warn!(at = %at, "corrupt commit frame, skipping rest of segment")
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut recovered = Recovered {
        last_seq: found.last().map_or(0, |c| c.seq),
        ..Recovered::default()
    };
    while let Some(commit) = found.pop() {
        let Some(root) = commit.root else {
            recovered.commit = Some(commit);
            return Ok(recovered);
        };
        let readable = nodes
            .read(root)
            .map_err(|e| e.to_string())
            .and_then(|bytes| Node::decode(&bytes).map(|_| ()));
        match readable {
            Ok(()) => {
                recovered.commit = Some(commit);
                return Ok(recovered);
            }
            Err(reason) => {
                recovered.skipped += 1;
                warn!(
                    seq = commit.seq,
                    root = %root,
                    %reason,
                    "skipping commit with unreadable root"
                )
            }
        }
    }
    Ok(recovered)
}
