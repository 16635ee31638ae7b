//! Ordered directory scanning
//!
//! Every scan walks the tree from the top in file name order. Nothing is
//! cached between calls, so files dropped in by producers while a consumer is
//! running are seen on the very next call, and an oldest-first naming scheme
//! keeps its priority order even as new files arrive.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{JobError, JobResult};
use crate::lock::LockManager;
use crate::meta::{FileMeta, MetaMap};

/// A file found in a source directory or pending bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Location of the file
    pub path: PathBuf,
    /// The source root or pending bucket the file was found under
    pub scope: PathBuf,
}

impl QueueEntry {
    pub fn new(path: impl Into<PathBuf>, scope: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scope: scope.into(),
        }
    }

    /// Base name of the entry
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path below the scope, e.g. `sub/job.txt`
    pub fn relative_path(&self) -> &Path {
        self.path.strip_prefix(&self.scope).unwrap_or(&self.path)
    }

    /// Decoded file name
    pub fn file_meta(&self) -> JobResult<FileMeta> {
        FileMeta::decode(&self.path)
    }

    /// Metadata carried in the file name
    pub fn meta(&self) -> JobResult<MetaMap> {
        Ok(self.file_meta()?.meta)
    }
}

/// Hidden names (leading dot) are never queue entries
pub fn is_hidden(name: &OsStr) -> bool {
    name.as_encoded_bytes().starts_with(b".")
}

/// Walk `root` depth first, siblings sorted by name, yielding regular files
///
/// Hidden files are skipped and hidden directories are not descended into.
/// Files whose names are not valid UTF-8 cannot carry metadata and are
/// skipped with a warning. A missing root yields nothing, and entries that
/// disappear while the walk is running (taken by another consumer) are
/// skipped.
pub fn ordered_walk(root: &Path, reverse: bool) -> impl Iterator<Item = JobResult<PathBuf>> {
    let root = root.to_path_buf();
    WalkDir::new(&root)
        .min_depth(1)
        .sort_by(move |a, b| {
            let ord = a.file_name().cmp(b.file_name());
            if reverse { ord.reverse() } else { ord }
        })
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.file_name()))
        .filter_map(move |result| match result {
            Ok(entry) if entry.file_type().is_file() => {
                if entry.file_name().to_str().is_none() {
                    warn!(path = ?entry.path(), "Skipping file with a non UTF-8 name");
                    return None;
                }
                Some(Ok(entry.into_path()))
            }
            Ok(_) => None,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => {
                debug!(path = ?e.path(), "ordered_walk: entry vanished, skipping");
                None
            }
            Err(e) => Some(Err(JobError::Walk {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
                source: e,
            })),
        })
}

/// First entry under `root` whose lock this process wins
pub fn scan_root(root: &Path, reverse: bool, locks: &mut LockManager) -> JobResult<Option<QueueEntry>> {
    debug!(?root, reverse, "scan_root: called");
    for candidate in ordered_walk(root, reverse) {
        let path = candidate?;
        if !locks.acquire(root, &path)? {
            continue;
        }
        // Another consumer may have finished with it between walk and lock
        if !path.is_file() {
            debug!(?path, "scan_root: entry gone after locking");
            locks.release()?;
            continue;
        }
        debug!(?path, "scan_root: locked entry");
        return Ok(Some(QueueEntry::new(path, root)));
    }
    Ok(None)
}

/// Scan each root in order and return the first entry that could be locked
pub fn next_unlocked(roots: &[PathBuf], reverse: bool, locks: &mut LockManager) -> JobResult<Option<QueueEntry>> {
    for root in roots {
        if let Some(entry) = scan_root(root, reverse, locks)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
