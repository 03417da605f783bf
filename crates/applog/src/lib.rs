//! # AppLog - Multi-Segment Append-Only Log
//!
//! The byte store underneath the LedgerTree node, history and commit logs.
//!
//! A log is a directory of segment files. Records are only ever appended to
//! the active (last) segment; once a segment reaches the configured file size
//! the log rotates to a new one. Segments are never truncated or rewritten in
//! place. Whole segments can be retired once nothing references them.
//!
//! ## Record Framing
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! `record_len` includes the 4-byte CRC but **not** itself. A [`LogRef`]
//! addresses the first byte of a frame.
//!
//! ## Visibility
//!
//! Appends land in an in-process buffer. [`AppLog::flush`] hands them to the
//! OS, after which readers (which go through their own file handles) can
//! see them. [`AppLog::sync`] additionally forces them to stable storage.
//!
//! ## Example
//!
//! ```rust,no_run
//! use applog::{AppLog, LogOptions};
//!
//! let log = AppLog::open("nodes", LogOptions::new("n")).unwrap();
//! let at = log.append(b"hello").unwrap();
//! log.flush().unwrap();
//! assert_eq!(log.read(at).unwrap(), b"hello");
//! ```

mod pool;

use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

use pool::HandlePool;
pub use pool::PoolStats;

/// Bytes of framing in front of every record body.
pub const FRAME_HEADER_BYTES: u64 = 8;

/// Upper bound on a single record body.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Location of a record: segment id plus byte offset of its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogRef {
    pub segment: u32,
    pub offset: u64,
}

impl LogRef {
    /// Encoded size of a `LogRef` inside other records.
    pub const ENCODED_LEN: usize = 4 + 8;

    pub fn new(segment: u32, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl fmt::Display for LogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or carried an impossible length.
    #[error("corrupt record at {0}")]
    Corrupt(LogRef),

    /// The record at this location is not (yet) fully on the file.
    #[error("truncated record at {0}")]
    Truncated(LogRef),

    /// The segment was retired or never existed.
    #[error("segment {0} not found")]
    SegmentNotFound(u32),

    /// The record body exceeds [`MAX_RECORD_SIZE`].
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),

    /// An append was attempted on a log opened read-only.
    #[error("log is read-only")]
    ReadOnly,
}

/// Per-log settings.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// File extension of segment files (`00000000.<ext>`).
    pub ext: &'static str,
    /// Rotation size of a segment, in bytes.
    pub file_size: u64,
    /// Unix permission bits for created files and directories.
    pub file_mode: u32,
    /// Bound on simultaneously open read handles.
    pub max_opened_files: usize,
    /// Capacity of the append buffer.
    pub buffer_size: usize,
    pub read_only: bool,
}

impl LogOptions {
    pub fn new(ext: &'static str) -> Self {
        Self {
            ext,
            file_size: 1 << 26,
            file_mode: 0o755,
            max_opened_files: 1,
            buffer_size: 4096,
            read_only: false,
        }
    }

    #[must_use]
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    #[must_use]
    pub fn with_file_mode(mut self, file_mode: u32) -> Self {
        self.file_mode = file_mode;
        self
    }

    #[must_use]
    pub fn with_max_opened_files(mut self, max: usize) -> Self {
        self.max_opened_files = max;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// The segment currently receiving appends.
struct Active {
    id: u32,
    writer: BufWriter<File>,
    /// Logical end of the segment, buffered bytes included.
    offset: u64,
    /// Reusable frame buffer.
    buf: Vec<u8>,
    /// A write failed part way; the file may hold a torn frame past
    /// `offset`, so nothing more goes into this segment.
    broken: bool,
}

/// Append-only log spread across rotating segment files.
///
/// Appends are serialized internally; reads are concurrent and only contend
/// on the file-handle pool.
pub struct AppLog {
    dir: PathBuf,
    opts: LogOptions,
    active: Mutex<Option<Active>>,
    first_segment: AtomicU32,
    last_segment: AtomicU32,
    pool: HandlePool,
}

impl fmt::Debug for AppLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppLog")
            .field("dir", &self.dir)
            .field("ext", &self.opts.ext)
            .field("first_segment", &self.first_segment())
            .field("last_segment", &self.last_segment())
            .field("pool", &self.pool.stats())
            .finish()
    }
}

impl AppLog {
    /// Opens the log in `dir`, creating the directory and a first segment
    /// when missing (unless read-only).
    ///
    /// If the last segment ends in a torn frame (crash mid-append), new
    /// appends go to a fresh segment so the torn bytes are never followed by
    /// valid records.
    pub fn open<P: AsRef<Path>>(dir: P, opts: LogOptions) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();

        if !opts.read_only {
            create_dir(&dir, opts.file_mode)?;
        } else if !dir.is_dir() {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("log directory {} does not exist", dir.display()),
            )));
        }

        let segments = list_segments(&dir, opts.ext)?;
        let first = segments.first().copied().unwrap_or(0);
        let mut last = segments.last().copied().unwrap_or(0);

        let log = Self {
            dir,
            pool: HandlePool::new(opts.max_opened_files),
            opts,
            active: Mutex::new(None),
            first_segment: AtomicU32::new(first),
            last_segment: AtomicU32::new(last),
        };

        if log.opts.read_only {
            return Ok(log);
        }

        let mut offset = 0;
        if !segments.is_empty() {
            let path = log.segment_path(last);
            let file_len = fs::metadata(&path)?.len();
            let valid_len = log.valid_len(last)?;
            if valid_len == file_len {
                offset = file_len;
            } else {
                warn!(
                    log = %log.dir.display(),
                    segment = last,
                    valid_len,
                    file_len,
                    "torn tail in last segment, starting a new one"
                );
                last += 1;
            }
        }

        let active = log.open_active(last, offset)?;
        *log.active.lock() = Some(active);
        log.last_segment.store(last, Ordering::Release);
        Ok(log)
    }

    /// Appends one record, rotating first if it would overflow the active
    /// segment. Returns where the record starts.
    pub fn append(&self, body: &[u8]) -> Result<LogRef, LogError> {
        if body.len() > MAX_RECORD_SIZE as usize - 4 {
            return Err(LogError::RecordTooLarge(body.len()));
        }

        let mut guard = self.active.lock();
        let active = guard.as_mut().ok_or(LogError::ReadOnly)?;

        let frame_len = FRAME_HEADER_BYTES + body.len() as u64;
        if active.broken {
            let next = self.roll(active)?;
            warn!(log = %self.dir.display(), segment = next, "moved past torn segment");
        } else if active.offset > 0 && active.offset + frame_len > self.opts.file_size {
            let next = self.roll(active)?;
            debug!(log = %self.dir.display(), segment = next, "rotated segment");
        }

        active.buf.clear();
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();
        active
            .buf
            .extend_from_slice(&((body.len() as u32) + 4).to_le_bytes());
        active.buf.extend_from_slice(&crc.to_le_bytes());
        active.buf.extend_from_slice(body);

        let at = LogRef::new(active.id, active.offset);
        if let Err(e) = active.writer.write_all(&active.buf) {
            active.broken = true;
            return Err(e.into());
        }
        active.offset += frame_len;
        Ok(at)
    }

    /// Hands buffered appends to the OS; they become readable.
    pub fn flush(&self) -> Result<(), LogError> {
        if let Some(active) = self.active.lock().as_mut() {
            active.writer.flush()?;
        }
        Ok(())
    }

    /// Flushes and forces the active segment to stable storage.
    ///
    /// Segments left behind by rotation were synced when they were sealed.
    pub fn sync(&self) -> Result<(), LogError> {
        if let Some(active) = self.active.lock().as_mut() {
            active.writer.flush()?;
            active.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Starts a new segment unless the active one is still empty. Returns
    /// the id of the segment that receives the next append.
    pub fn rotate(&self) -> Result<u32, LogError> {
        let mut guard = self.active.lock();
        let active = guard.as_mut().ok_or(LogError::ReadOnly)?;
        if active.offset == 0 && !active.broken {
            return Ok(active.id);
        }
        let next = self.roll(active)?;
        debug!(log = %self.dir.display(), segment = next, "forced rotation");
        Ok(next)
    }

    /// Reads the record body at `at`, validating its CRC.
    pub fn read(&self, at: LogRef) -> Result<Vec<u8>, LogError> {
        if at.segment < self.first_segment() || at.segment > self.last_segment() {
            return Err(LogError::SegmentNotFound(at.segment));
        }

        let mut file = self
            .pool
            .lease(at.segment, |id| File::open(self.segment_path(id)))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LogError::SegmentNotFound(at.segment),
                _ => LogError::Io(e),
            })?;

        file.seek(SeekFrom::Start(at.offset))?;
        let mut header = [0u8; FRAME_HEADER_BYTES as usize];
        read_exact_or(&mut *file, &mut header, at)?;

        let record_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if record_len < 4 || record_len > MAX_RECORD_SIZE {
            return Err(LogError::Corrupt(at));
        }

        let mut body = vec![0u8; (record_len - 4) as usize];
        read_exact_or(&mut *file, &mut body, at)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(LogError::Corrupt(at));
        }
        Ok(body)
    }

    /// Replays every complete record from the first live segment onwards,
    /// in append order.
    ///
    /// A truncated tail ends a segment cleanly; a CRC mismatch is an error.
    /// Only flushed records are visible.
    pub fn scan<F>(&self, mut apply: F) -> Result<(), LogError>
    where
        F: FnMut(LogRef, Vec<u8>) -> Result<(), LogError>,
    {
        for segment in self.first_segment()..=self.last_segment() {
            self.scan_segment(segment, &mut apply)?;
        }
        Ok(())
    }

    /// [`AppLog::scan`] restricted to one segment. A missing segment has no
    /// records.
    pub fn scan_segment<F>(&self, segment: u32, mut apply: F) -> Result<(), LogError>
    where
        F: FnMut(LogRef, Vec<u8>) -> Result<(), LogError>,
    {
        let file = match File::open(self.segment_path(segment)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LogError::Io(e)),
        };
        scan_segment(segment, BufReader::new(file), &mut apply)
    }

    /// Deletes every segment below `segment`. Returns how many were removed.
    ///
    /// The active segment is never removed. When a file cannot be removed
    /// the error is returned and a later call with the same bound tries it
    /// again.
    pub fn retire_before(&self, segment: u32) -> Result<usize, LogError> {
        let bound = segment.min(self.last_segment());
        let first = self.first_segment();
        if bound <= first {
            return Ok(0);
        }

        self.first_segment.store(bound, Ordering::Release);
        self.pool.retire_below(bound);

        let mut removed = 0;
        let mut failed = None;
        for id in first..bound {
            match fs::remove_file(self.segment_path(id)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(log = %self.dir.display(), segment = id, error = %e, "failed to remove segment");
                    failed.get_or_insert((id, e));
                }
            }
        }
        if let Some((id, e)) = failed {
            // nothing references it any more; the next retire starts here
            self.first_segment.store(id, Ordering::Release);
            return Err(LogError::Io(e));
        }
        debug!(log = %self.dir.display(), below = bound, removed, "retired segments");
        Ok(removed)
    }

    #[must_use]
    pub fn first_segment(&self) -> u32 {
        self.first_segment.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_segment(&self) -> u32 {
        self.last_segment.load(Ordering::Acquire)
    }

    /// Logical size of the active segment, buffered bytes included.
    #[must_use]
    pub fn active_offset(&self) -> u64 {
        self.active.lock().as_ref().map(|a| a.offset).unwrap_or(0)
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of segment `id` inside this log.
    #[must_use]
    pub fn segment_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{:08}.{}", id, self.opts.ext))
    }

    fn open_active(&self, id: u32, offset: u64) -> Result<Active, LogError> {
        let mut oo = OpenOptions::new();
        oo.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            oo.mode(self.opts.file_mode);
        }
        let file = oo.open(self.segment_path(id))?;
        Ok(Active {
            id,
            writer: BufWriter::with_capacity(self.opts.buffer_size, file),
            offset,
            buf: Vec::with_capacity(256),
            broken: false,
        })
    }

    /// Seals `active` and replaces it with the next, empty segment.
    fn roll(&self, active: &mut Active) -> Result<u32, LogError> {
        let next = active.id + 1;
        self.seal(active)?;
        *active = self.open_active(next, 0)?;
        self.last_segment.store(next, Ordering::Release);
        Ok(next)
    }

    fn seal(&self, active: &mut Active) -> Result<(), LogError> {
        active.writer.flush()?;
        active.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Length of the longest prefix of `segment` made of complete frames.
    fn valid_len(&self, segment: u32) -> Result<u64, LogError> {
        let file = File::open(self.segment_path(segment))?;
        let mut end = 0;
        let result = scan_segment(segment, BufReader::new(file), &mut |at, body| {
            end = at.offset + FRAME_HEADER_BYTES + body.len() as u64;
            Ok(())
        });
        match result {
            Ok(()) | Err(LogError::Corrupt(_)) => Ok(end),
            Err(e) => Err(e),
        }
    }
}

fn scan_segment<R, F>(segment: u32, mut rdr: R, apply: &mut F) -> Result<(), LogError>
where
    R: Read,
    F: FnMut(LogRef, Vec<u8>) -> Result<(), LogError>,
{
    let mut offset = 0u64;
    loop {
        let at = LogRef::new(segment, offset);

        let record_len = match rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(LogError::Io(e)),
        };
        if record_len < 4 || record_len > MAX_RECORD_SIZE {
            return Err(LogError::Corrupt(at));
        }

        let crc = match rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(LogError::Io(e)),
        };

        let mut body = vec![0u8; (record_len - 4) as usize];
        match rdr.read_exact(&mut body) {
            Ok(()) => {}
            // truncated tail - treat as EOF
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(LogError::Io(e)),
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(LogError::Corrupt(at));
        }

        offset += FRAME_HEADER_BYTES + body.len() as u64;
        apply(at, body)?;
    }
}

fn read_exact_or(file: &mut File, buf: &mut [u8], at: LogRef) -> Result<(), LogError> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => LogError::Truncated(at),
        _ => LogError::Io(e),
    })
}

fn list_segments(dir: &Path, ext: &str) -> Result<Vec<u32>, LogError> {
    let mut ids: Vec<u32> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == ext).unwrap_or(false))
        .filter_map(|p| p.file_stem()?.to_str()?.parse().ok())
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Creates `dir` (and parents) with `mode` on Unix.
pub fn create_dir(dir: &Path, mode: u32) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir)
}
