//! Background maintenance: snap root renewal, deferred segment retirement
//! and compaction when due.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::TreeError;
use crate::TreeInner;

/// Upper bound on the maintenance tick, so compaction is checked even
/// when time-based renewal is disabled or slow.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Stop signal that wakes sleepers immediately.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    /// Sleeps up to `timeout`. Returns `true` once shutdown was triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && !timeout.is_zero() {
            self.cv.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

pub(crate) struct Maintenance {
    handle: JoinHandle<()>,
}

impl Maintenance {
    pub fn spawn(inner: Arc<TreeInner>) -> io::Result<Self> {
        let renew = inner.opts.renew_snap_root_after;
        let tick = if renew.is_zero() {
            MAX_TICK
        } else {
            renew.min(MAX_TICK)
        };
        let handle = thread::Builder::new()
            .name("ledgertree-maintenance".to_string())
            .spawn(move || run(&inner, tick))?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("maintenance thread panicked");
        }
    }
}

fn run(inner: &TreeInner, tick: Duration) {
    debug!(tick_ms = tick.as_millis() as u64, "maintenance thread started");
    while !inner.shutdown.wait(tick) {
        if inner.snapshots.renew_if_due() {
            debug!(version = inner.snapshots.current().ts, "snap root renewed");
        }
        if let Err(e) = inner.retire_segments() {
            warn!(error = %e, "failed to retire node segments");
        }
        if !inner.compaction_due() {
            continue;
        }
        match inner.compact(false) {
            Ok(_)
            | Err(TreeError::CompactionInProgress)
            | Err(TreeError::CompactionThresholdNotReached)
            | Err(TreeError::Closed) => {}
            Err(e) => error!(error = %e, "background compaction failed"),
        }
    }
    debug!("maintenance thread stopped");
}
