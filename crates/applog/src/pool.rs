//! Bounded pool of read handles shared by every reader of one log.
//!
//! At most `max` files are open at a time (leased + idle). A lease on a
//! segment reuses an idle handle for that segment when one exists, opens a
//! new one while under the bound, closes an idle handle of another segment to
//! make room, and otherwise blocks until a lease is released.

use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

pub(crate) struct HandlePool {
    max: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<(u32, File)>,
    leased: usize,
    /// Handles for segments below this id are closed instead of kept idle.
    retired_below: u32,
}

/// Point-in-time view of a pool, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub leased: usize,
    pub idle: usize,
}

impl HandlePool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    /// Leases a handle for `segment`, opening it with `open` if needed.
    ///
    /// Blocks while the pool is exhausted. The handle goes back to the pool
    /// when the returned [`Lease`] is dropped, on every exit path.
    pub(crate) fn lease<F>(&self, segment: u32, open: F) -> io::Result<Lease<'_>>
    where
        F: FnOnce(u32) -> io::Result<File>,
    {
        let mut st = self.state.lock();
        loop {
            if let Some(pos) = st.idle.iter().position(|(s, _)| *s == segment) {
                let (_, file) = st.idle.swap_remove(pos);
                st.leased += 1;
                return Ok(Lease::new(self, segment, file));
            }

            if st.leased + st.idle.len() < self.max {
                st.leased += 1;
                drop(st);
                return match open(segment) {
                    Ok(file) => Ok(Lease::new(self, segment, file)),
                    Err(e) => {
                        let mut st = self.state.lock();
                        st.leased -= 1;
                        self.released.notify_one();
                        Err(e)
                    }
                };
            }

            if !st.idle.is_empty() {
                // oldest idle handle goes first
                st.idle.remove(0);
                continue;
            }

            self.released.wait(&mut st);
        }
    }

    fn release(&self, segment: u32, file: File) {
        let mut st = self.state.lock();
        st.leased -= 1;
        if segment >= st.retired_below {
            st.idle.push((segment, file));
        }
        self.released.notify_one();
    }

    /// Closes idle handles of segments below `segment` and stops keeping
    /// such handles in the future.
    pub(crate) fn retire_below(&self, segment: u32) {
        let mut st = self.state.lock();
        st.retired_below = st.retired_below.max(segment);
        let bound = st.retired_below;
        st.idle.retain(|(s, _)| *s >= bound);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            max: self.max,
            leased: st.leased,
            idle: st.idle.len(),
        }
    }
}

/// A leased file handle. Dereferences to [`File`].
pub(crate) struct Lease<'a> {
    pool: &'a HandlePool,
    segment: u32,
    file: Option<File>,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a HandlePool, segment: u32, file: File) -> Self {
        Self {
            pool,
            segment,
            file: Some(file),
        }
    }
}

impl Deref for Lease<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        match &self.file {
            Some(file) => file,
            None => unreachable!("lease used after release"),
        }
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut File {
        match &mut self.file {
            Some(file) => file,
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.release(self.segment, file);
        }
    }
}
