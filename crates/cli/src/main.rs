//! # CLI - LedgerTree Interactive Shell
//!
//! A REPL-style command-line interface for the LedgerTree engine. Reads
//! commands from stdin, executes them against one tree, and prints results
//! to stdout. Works interactively and scripted (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value              Insert or overwrite a key
//! GET key                    Latest value (prints value or "(nil)")
//! HISTORY key                Every value of a key, newest first
//! SCAN [start] [end]         Range scan (inclusive start, exclusive end)
//! SNAP                       Open a snapshot, prints its id
//! SNAPGET id key             Look up a key in a snapshot
//! SNAPSCAN id [start] [end]  Range scan in a snapshot
//! RELEASE id                 Close a snapshot
//! FLUSH                      Hand inserts to the OS and commit them
//! SYNC                       Force inserts to stable storage; snapshots see them
//! COMPACT                    Run a compaction round now
//! STATS                      Print tree counters
//! EXIT / QUIT                Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! ```text
//! LEDGERTREE_DIR     tree directory (default: "data/ledgertree")
//! LEDGERTREE_*       tree options, see config::Options::from_env
//! RUST_LOG           log filter for stderr output (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! LedgerTree started (dir=data/ledgertree, version=0, entries=0, max_node_size=4096)
//! > SET name Alice
//! OK (version=1)
//! > GET name
//! Alice
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::{Context, Result};
use config::Options;
use engine::Tree;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

use shell::{Flow, Shell};

const DEFAULT_DIR: &str = "data/ledgertree";

fn main() -> Result<()> {
    // stdout carries command output only; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let dir = std::env::var("LEDGERTREE_DIR").unwrap_or_else(|_| DEFAULT_DIR.to_string());
    let opts = Options::from_env().context("invalid LEDGERTREE_* variable")?;
    let tree = Tree::open(&dir, opts).with_context(|| format!("failed to open tree at {}", dir))?;

    println!(
        "LedgerTree started (dir={}, version={}, entries={}, max_node_size={})",
        dir,
        tree.version(),
        tree.entry_count(),
        tree.options().max_node_size
    );
    println!("Commands: SET key value | GET key | HISTORY key | SCAN [start] [end]");
    println!("          SNAP | SNAPGET id key | SNAPSCAN id [start] [end] | RELEASE id");
    println!("          FLUSH | SYNC | COMPACT | STATS | EXIT");

    let mut shell = Shell::new(tree);
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write!(out, "> ")?;
    out.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        if shell.execute(&line, &mut out)? == Flow::Exit {
            break;
        }
        write!(out, "> ")?;
        out.flush()?;
    }

    shell.close().context("failed to close tree")?;
    Ok(())
}
