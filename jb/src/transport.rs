//! Atomic file transport
//!
//! A transport handle is an open file whose `close` does the real work. A
//! handle opened for reading is moved (or copied, for fan-out) into its
//! destination directories when closed. A handle opened for writing is
//! staged in a scratch directory and only published into its destinations
//! on close, so nobody downstream ever sees a half-written file.
//!
//! In both cases the path of the file relative to the scope it was opened in
//! is preserved under every destination: `input/sub/a.txt` closes into
//! `processed/sub/a.txt`.
//!
//! Staged and scratch files carry hidden names unique to the handle
//! (`.a.txt.<pid>.<seq>.part`), so two writers of the same name never share
//! a file.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{JobError, JobResult};

/// Whether a handle reads an existing file or writes a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// What a plain close does with the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Move (or publish) into the destination directories
    #[default]
    Keep,
    /// Remove the file instead of moving it
    Delete,
}

impl FromStr for Disposition {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "k" | "keep" => Ok(Disposition::Keep),
            "d" | "delete" => Ok(Disposition::Delete),
            _ => Err(JobError::InvalidDisposition(s.to_string())),
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Keep => write!(f, "keep"),
            Disposition::Delete => write!(f, "delete"),
        }
    }
}

/// Everything a transport needs to open a handle
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// File to open, absolute or relative to `scope`
    pub path: PathBuf,
    /// Root the file belongs to; sub-paths are taken relative to it
    pub scope: PathBuf,
    /// Directories the file ends up in on close
    pub destinations: Vec<PathBuf>,
    pub mode: Mode,
    pub disposition: Disposition,
}

/// Optional capability: redirect where a handle goes on close
pub trait Retarget {
    /// Replace the file name and/or the destination directory used by the
    /// next close. A directory replaces all configured destinations.
    fn set_rename_target(&mut self, name: Option<&str>, directory: Option<&Path>);

    /// Make the next close fail with [`JobError::TargetExists`] instead of
    /// replacing a file already at the target
    fn set_exclusive(&mut self, exclusive: bool);
}

/// An open file managed by a [`Transport`]
pub trait TransportHandle: Read + Write {
    /// Where the file currently lives
    fn path(&self) -> &Path;

    /// The retarget capability, if this handle supports it
    fn retarget(&mut self) -> Option<&mut dyn Retarget> {
        None
    }

    /// Close the handle, moving it to its destinations, or discarding it
    /// when `delete` is set
    fn close(self, delete: bool) -> JobResult<()>
    where
        Self: Sized;
}

/// Opens transport handles
pub trait Transport {
    type Handle: TransportHandle;

    fn open(&self, request: OpenRequest) -> JobResult<Self::Handle>;
}

/// The file system transport
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicFileTransport;

impl Transport for MagicFileTransport {
    type Handle = MagicFile;

    fn open(&self, request: OpenRequest) -> JobResult<MagicFile> {
        MagicFile::open(request)
    }
}

/// A file that moves itself into place when closed
#[derive(Debug)]
pub struct MagicFile {
    mode: Mode,
    disposition: Disposition,
    /// Path relative to the scope, reproduced under each destination
    relative: PathBuf,
    /// Where the bytes live while the handle is open
    location: PathBuf,
    destinations: Vec<PathBuf>,
    rename_name: Option<String>,
    rename_dir: Option<PathBuf>,
    exclusive: bool,
    file: Option<File>,
}

impl MagicFile {
    /// Open a file for reading in place, or create a staged file for writing
    pub fn open(request: OpenRequest) -> JobResult<Self> {
        let OpenRequest {
            path,
            scope,
            destinations,
            mode,
            disposition,
        } = request;
        let named = scope.join(&path);
        let relative = match named.strip_prefix(&scope) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => named.file_name().map(PathBuf::from).unwrap_or_default(),
        };

        let (location, file) = match mode {
            Mode::Read => {
                let file = File::open(&named).map_err(|e| JobError::io(&named, e))?;
                (named, file)
            }
            Mode::Write => {
                let staged = part_path(&named);
                ensure_parent(&staged)?;
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&staged)
                    .map_err(|e| JobError::io(&staged, e))?;
                (staged, file)
            }
        };
        debug!(?location, ?relative, ?mode, %disposition, "MagicFile::open: called");

        Ok(Self {
            mode,
            disposition,
            relative,
            location,
            destinations,
            rename_name: None,
            rename_dir: None,
            exclusive: false,
            file: Some(file),
        })
    }

    /// Final paths this handle would be moved to by a plain close
    pub fn targets(&self) -> Vec<PathBuf> {
        let sub = match &self.rename_name {
            Some(name) => self.relative.with_file_name(name),
            None => self.relative.clone(),
        };
        match &self.rename_dir {
            Some(dir) => vec![dir.join(&sub)],
            None => self.destinations.iter().map(|d| d.join(&sub)).collect(),
        }
    }

    fn is_retargeted(&self) -> bool {
        self.rename_name.is_some() || self.rename_dir.is_some()
    }
}

impl Read for MagicFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (self.mode, self.file.as_mut()) {
            (Mode::Read, Some(file)) => file.read(buf),
            _ => Err(io::Error::other("file is not open for reading")),
        }
    }
}

impl Write for MagicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match (self.mode, self.file.as_mut()) {
            (Mode::Write, Some(file)) => file.write(buf),
            _ => Err(io::Error::other("file is not open for writing")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match (self.mode, self.file.as_mut()) {
            (Mode::Write, Some(file)) => file.flush(),
            _ => Ok(()),
        }
    }
}

impl Retarget for MagicFile {
    fn set_rename_target(&mut self, name: Option<&str>, directory: Option<&Path>) {
        debug!(?name, ?directory, location = ?self.location, "MagicFile::set_rename_target: called");
        if let Some(name) = name {
            self.rename_name = Some(name.to_string());
        }
        if let Some(directory) = directory {
            self.rename_dir = Some(directory.to_path_buf());
        }
    }

    fn set_exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }
}

impl TransportHandle for MagicFile {
    fn path(&self) -> &Path {
        &self.location
    }

    fn retarget(&mut self) -> Option<&mut dyn Retarget> {
        Some(self)
    }

    fn close(mut self, delete: bool) -> JobResult<()> {
        debug!(location = ?self.location, delete, "MagicFile::close: called");
        if let Some(file) = self.file.take()
            && self.mode == Mode::Write
        {
            file.sync_all().map_err(|e| JobError::io(&self.location, e))?;
        }

        if delete || (self.disposition == Disposition::Delete && !self.is_retargeted()) {
            fs::remove_file(&self.location).map_err(|e| JobError::io(&self.location, e))?;
            info!("Removed {}", self.location.display());
            return Ok(());
        }

        let targets = self.targets();
        if targets.is_empty() {
            return Err(JobError::NoDestination(self.location.clone()));
        }
        publish(&self.location, &targets, self.exclusive)?;
        info!("Moved {} to {:?}", self.location.display(), targets);
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> JobResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| JobError::io(parent, e))?;
    }
    Ok(())
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden scratch name next to `target`, invisible to directory scans and
/// unique to the caller
pub(crate) fn part_path(target: &Path) -> PathBuf {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(".{}.{}.part", std::process::id(), seq));
    target.with_file_name(name)
}

/// Put the finished scratch file `part` at `target`
///
/// With `exclusive`, an existing `target` is left alone and the scratch file
/// discarded.
pub(crate) fn place(part: &Path, target: &Path, exclusive: bool) -> JobResult<()> {
    if !exclusive {
        return fs::rename(part, target).map_err(|e| JobError::io(target, e));
    }
    let linked = fs::hard_link(part, target);
    fs::remove_file(part).map_err(|e| JobError::io(part, e))?;
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(JobError::TargetExists(target.to_path_buf())),
        Err(e) => Err(JobError::io(target, e)),
    }
}

/// Copy into every target but the last, then move into the last
fn publish(source: &Path, targets: &[PathBuf], exclusive: bool) -> JobResult<()> {
    let Some((last, rest)) = targets.split_last() else {
        return Ok(());
    };
    for target in rest {
        copy_into(source, target, exclusive)?;
    }
    move_into(source, last, exclusive)
}

fn copy_into(source: &Path, target: &Path, exclusive: bool) -> JobResult<()> {
    ensure_parent(target)?;
    let part = part_path(target);
    fs::copy(source, &part).map_err(|e| JobError::io(&part, e))?;
    place(&part, target, exclusive)
}

fn move_into(source: &Path, target: &Path, exclusive: bool) -> JobResult<()> {
    ensure_parent(target)?;
    let moved = if exclusive {
        // A hard link fails atomically when the target exists
        fs::hard_link(source, target).and_then(|()| fs::remove_file(source))
    } else {
        fs::rename(source, target)
    };
    match moved {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(JobError::io(source, e)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(JobError::TargetExists(target.to_path_buf())),
        Err(e) => {
            debug!(?source, ?target, "move_into: move failed ({}), copying instead", e);
            copy_into(source, target, exclusive)?;
            fs::remove_file(source).map_err(|e| JobError::io(source, e))
        }
    }
}
