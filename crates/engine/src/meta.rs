/// # META - Creation-Time Tree Parameters
///
/// Some options shape the bytes on disk and cannot change once a tree
/// exists: the node size ceiling (every node was split against it) and the
/// segment rotation size. They are recorded in a small text file at the
/// tree root:
///
/// ```text
/// # LedgerTree metadata
/// max_node_size=4096
/// file_size=67108864
/// ```
///
/// Lines starting with `#` are comments. Unknown keys are ignored so newer
/// trees stay readable.
///
/// ## Crash Safety
///
/// The file is rewritten atomically: write to `META.tmp`, fsync, rename. If
/// the rename fails the file is overwritten directly and fsynced.
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TreeError};

pub const META_FILENAME: &str = "META";
const META_TMP_FILENAME: &str = "META.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    path: PathBuf,
    pub max_node_size: usize,
    pub file_size: u64,
}

impl Meta {
    /// Loads `dir/META`, or returns `None` when the tree has none yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(META_FILENAME);
        if !path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut max_node_size = None;
        let mut file_size = None;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                TreeError::Meta(format!(
                    "line {}: expected 'key=value', got {:?}",
                    line_num + 1,
                    trimmed
                ))
            })?;
            let bad = |_| {
                TreeError::Meta(format!(
                    "line {}: invalid value for {}: {:?}",
                    line_num + 1,
                    key,
                    value
                ))
            };
            match key.trim() {
                "max_node_size" => max_node_size = Some(value.trim().parse().map_err(bad)?),
                "file_size" => file_size = Some(value.trim().parse().map_err(bad)?),
                _ => {}
            }
        }

        match (max_node_size, file_size) {
            (Some(max_node_size), Some(file_size)) => Ok(Some(Self {
                path,
                max_node_size,
                file_size,
            })),
            _ => Err(TreeError::Meta(
                "missing max_node_size or file_size".to_string(),
            )),
        }
    }

    pub fn new(dir: &Path, max_node_size: usize, file_size: u64) -> Self {
        Self {
            path: dir.join(META_FILENAME),
            max_node_size,
            file_size,
        }
    }

    /// Persists the metadata atomically.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(META_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            self.write_contents(&mut f)?;
        }

        if fs::rename(&tmp_path, &self.path).is_err() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.write_contents(&mut f)?;
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(())
    }

    fn write_contents(&self, f: &mut File) -> Result<()> {
        writeln!(f, "# LedgerTree metadata")?;
        writeln!(f, "max_node_size={}", self.max_node_size)?;
        writeln!(f, "file_size={}", self.file_size)?;
        f.flush()?;
        f.sync_all()?;
        Ok(())
    }
}
