//! Job environment: the consumer-side controller
//!
//! A [`JobEnvironment`] gives a batch job its next piece of work and puts the
//! work away again when the job is done with it:
//!
//! - input comes from the source directories first, then from due buckets of
//!   the pending queue;
//! - each input is locked for as long as it is open;
//! - closing the input moves it to the processed directories (`commit`), the
//!   error directory (`fail`), or back into the pending queue with its repeat
//!   count bumped (`requeue`);
//! - a single output file can be open alongside, staged until committed and
//!   then fanned out to every output directory.
//!
//! Opening a new input (or output) while one is open closes the old one with
//! its default disposition first. There is no rollback opportunity for it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::config::JobPaths;
use crate::error::{JobError, JobResult};
use crate::lock::{AppLock, LockManager};
use crate::meta::{MetaMap, MetaValue, REPEAT_KEY};
use crate::pending::PendingQueue;
use crate::scanner::{self, QueueEntry};
use crate::transport::{Disposition, MagicFileTransport, Mode, OpenRequest, Transport, TransportHandle};

struct OpenSource<H> {
    entry: QueueEntry,
    handle: H,
}

/// Per-process queue controller
///
/// Each instance owns its own lock, input and output state; nothing is
/// shared between instances except the file system.
pub struct JobEnvironment<T: Transport = MagicFileTransport> {
    application: String,
    paths: JobPaths,
    transport: T,
    locks: LockManager,
    pending: Option<PendingQueue>,
    app_lock: AppLock,
    source: Option<OpenSource<T::Handle>>,
    output: Option<T::Handle>,
}

impl JobEnvironment<MagicFileTransport> {
    /// Environment using the file system transport
    pub fn new(application: impl Into<String>, paths: JobPaths) -> Self {
        Self::with_transport(application, paths, MagicFileTransport)
    }
}

impl<T: Transport> JobEnvironment<T> {
    pub fn with_transport(application: impl Into<String>, paths: JobPaths, transport: T) -> Self {
        let application = application.into();
        debug!(%application, ?paths, "JobEnvironment::with_transport: called");
        let locks = LockManager::new(paths.lock_dir.clone(), paths.force_unlock);
        let pending = paths.pending.clone().map(PendingQueue::new);
        let app_lock = AppLock::new(paths.lock_dir.as_ref().unwrap_or(&paths.root), &application);
        Self {
            application,
            paths,
            transport,
            locks,
            pending,
            app_lock,
            source: None,
            output: None,
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn pending(&self) -> Option<&PendingQueue> {
        self.pending.as_ref()
    }

    // ---------------------------------------------------------------------
    // Input

    /// Open the next available input
    ///
    /// Any input that is still open is closed normally first. The search
    /// restarts from the top of the source directories on every call, then
    /// falls through to the pending queue. Returns `None` when there is
    /// nothing (unlocked) left to do.
    pub fn acquire_next(&mut self, disposition: Disposition, reverse: bool) -> JobResult<Option<&mut T::Handle>> {
        debug!(%disposition, reverse, "JobEnvironment::acquire_next: called");
        if self.source.is_some() {
            debug!("JobEnvironment::acquire_next: closing previous input (no rollback)");
            self.close_source()?;
        }

        let mut entry = scanner::next_unlocked(&self.paths.sources, reverse, &mut self.locks)?;
        if entry.is_none()
            && let Some(pending) = &self.pending
        {
            entry = pending.due_entry(&mut self.locks)?;
        }
        let Some(entry) = entry else {
            debug!("JobEnvironment::acquire_next: nothing to do");
            return Ok(None);
        };

        let request = OpenRequest {
            path: entry.path.clone(),
            scope: entry.scope.clone(),
            destinations: self.paths.processed.clone(),
            mode: Mode::Read,
            disposition,
        };
        let handle = match self.transport.open(request) {
            Ok(handle) => handle,
            Err(e) => {
                self.locks.release()?;
                return Err(e);
            }
        };
        info!("Opened input {}", entry.path.display());
        let open = self.source.insert(OpenSource { entry, handle });
        Ok(Some(&mut open.handle))
    }

    /// "Pull until exhausted" over [`acquire_next`](Self::acquire_next)
    pub fn input_set(&mut self, disposition: Disposition, reverse: bool) -> InputSet<'_, T> {
        InputSet {
            env: self,
            disposition,
            reverse,
            exhausted: false,
        }
    }

    /// The open input entry
    pub fn current_entry(&self) -> Option<&QueueEntry> {
        self.source.as_ref().map(|s| &s.entry)
    }

    /// Base name of the open input
    pub fn current_name(&self) -> Option<String> {
        self.current_entry().map(QueueEntry::name)
    }

    /// The open input handle
    pub fn source_mut(&mut self) -> Option<&mut T::Handle> {
        self.source.as_mut().map(|s| &mut s.handle)
    }

    /// Close the input normally: move it to the processed directories
    pub fn commit(&mut self) -> JobResult<()> {
        debug!("JobEnvironment::commit: called");
        self.close_source()
    }

    /// Close the input after an error: move it to the error directory
    ///
    /// Without an error directory, or with a transport that cannot retarget,
    /// the input goes to its default destination instead. Both cases are
    /// logged.
    pub fn fail(&mut self) -> JobResult<()> {
        debug!("JobEnvironment::fail: called");
        let Some(open) = self.source.as_mut() else {
            return Ok(());
        };
        match (open.handle.retarget(), self.paths.error.as_deref()) {
            (Some(target), Some(error_dir)) => {
                target.set_rename_target(None, Some(error_dir));
            }
            (Some(_), None) => {
                warn!(
                    "No error directory configured, {} goes to processed",
                    open.entry.path.display()
                );
            }
            (None, _) => {
                warn!(
                    "Transport cannot retarget, {} goes to its default destination",
                    open.entry.path.display()
                );
            }
        }
        self.close_source()
    }

    /// Close the input and put it back on the pending queue after `delay`
    ///
    /// The file name gains (or increments) a `repeat` count. Without a
    /// pending directory this is a plain commit. If the file name carries
    /// metadata that cannot be decoded, or the bucket already holds a file of
    /// the new name, the input is left open and the error returned, so the
    /// caller can still `fail` it. An existing pending file is never replaced.
    pub fn requeue(&mut self, delay: Duration) -> JobResult<()> {
        debug!(?delay, "JobEnvironment::requeue: called");
        let Some(open) = self.source.as_mut() else {
            return Ok(());
        };
        match (&self.pending, open.handle.retarget()) {
            (Some(pending), Some(target)) => {
                let file_meta = open.entry.file_meta()?;
                let repeat = file_meta
                    .repeat()?
                    .checked_add(1)
                    .ok_or_else(|| JobError::malformed(file_meta.file_name(), "repeat count overflows"))?;
                let renamed = file_meta.encode(&MetaMap::from([(REPEAT_KEY.to_string(), MetaValue::Int(repeat))]))?;
                let new_name = renamed.file_name();
                let bucket = pending.bucket_for(delay)?;
                let destination = bucket.join(open.entry.relative_path()).with_file_name(&new_name);
                if destination.exists() {
                    return Err(JobError::TargetExists(destination));
                }
                info!(
                    repeat,
                    "Requeueing {} as {} in {}",
                    open.entry.path.display(),
                    new_name,
                    bucket.display()
                );
                target.set_rename_target(Some(new_name.as_str()), Some(bucket.as_path()));
                target.set_exclusive(true);
            }
            (None, _) => {
                warn!(
                    "No pending directory configured, {} is committed instead",
                    open.entry.path.display()
                );
            }
            (Some(_), None) => {
                warn!(
                    "Transport cannot retarget, {} is committed instead",
                    open.entry.path.display()
                );
            }
        }
        self.close_source()
    }

    /// Close the open input (if any) and release its lock
    fn close_source(&mut self) -> JobResult<()> {
        let Some(OpenSource { entry, handle }) = self.source.take() else {
            return Ok(());
        };
        debug!(path = ?entry.path, "JobEnvironment::close_source: called");
        let closed = handle.close(false);
        let released = self.locks.release();
        closed.and(released)
    }

    /// Producer side: drop a message into the pending queue
    pub fn post_pending(&self, when: Option<NaiveDateTime>, file_name: &str, content: &[u8]) -> JobResult<PathBuf> {
        let pending = self.pending.as_ref().ok_or(JobError::NoPendingRoot)?;
        pending.post(when, file_name, content)
    }

    // ---------------------------------------------------------------------
    // Output

    /// Open `relative_name` for output
    ///
    /// The file is written under the temporary directory and appears in
    /// every output directory (at the same relative path) on commit. An
    /// output that is still open is committed first.
    pub fn open_output(&mut self, relative_name: impl AsRef<Path>, disposition: Disposition) -> JobResult<&mut T::Handle> {
        let relative_name = relative_name.as_ref();
        debug!(?relative_name, %disposition, "JobEnvironment::open_output: called");
        self.close_output(false)?;
        let request = OpenRequest {
            path: relative_name.to_path_buf(),
            scope: self.paths.temporary.clone(),
            destinations: self.paths.outputs.clone(),
            mode: Mode::Write,
            disposition,
        };
        let handle = self.transport.open(request)?;
        Ok(self.output.insert(handle))
    }

    /// Publish the open output
    pub fn commit_output(&mut self) -> JobResult<()> {
        debug!("JobEnvironment::commit_output: called");
        self.close_output(false)
    }

    /// Discard the open output
    ///
    /// Output is always staged, so this leaves any file already sitting at
    /// the destination untouched.
    pub fn rollback_output(&mut self) -> JobResult<()> {
        debug!("JobEnvironment::rollback_output: called");
        self.close_output(true)
    }

    /// Change the name and/or directory the open output is published to
    pub fn set_output_rename(&mut self, name: Option<&str>, directory: Option<&Path>) -> JobResult<()> {
        let Some(handle) = self.output.as_mut() else {
            return Ok(());
        };
        let path = handle.path().to_path_buf();
        let target = handle.retarget().ok_or(JobError::RetargetUnsupported(path))?;
        target.set_rename_target(name, directory);
        Ok(())
    }

    fn close_output(&mut self, delete: bool) -> JobResult<()> {
        match self.output.take() {
            Some(handle) => handle.close(delete),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Application lock

    /// Try to become the only running instance of this application
    pub fn try_acquire_app_lock(&mut self, force: bool) -> JobResult<bool> {
        self.app_lock.try_acquire(force)
    }

    pub fn release_app_lock(&mut self) -> JobResult<()> {
        self.app_lock.release()
    }
}

/// Repeatedly pulls the next input until none is left
///
/// Not an [`Iterator`]: each step hands back the environment itself so the
/// caller can read the input and then `commit`, `fail` or `requeue` it. Every
/// step rescans from the top, which is what lets new arrivals be picked up
/// promptly. Once a step finds nothing the set stays exhausted; a fresh
/// `input_set` starts over.
///
/// ```ignore
/// let mut inputs = env.input_set(Disposition::Keep, false);
/// while let Some(env) = inputs.next_input()? {
///     let mut text = String::new();
///     env.source_mut().unwrap().read_to_string(&mut text)?;
///     env.commit()?;
/// }
/// ```
pub struct InputSet<'a, T: Transport> {
    env: &'a mut JobEnvironment<T>,
    disposition: Disposition,
    reverse: bool,
    exhausted: bool,
}

impl<T: Transport> InputSet<'_, T> {
    pub fn next_input(&mut self) -> JobResult<Option<&mut JobEnvironment<T>>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.env.acquire_next(self.disposition, self.reverse)?.is_none() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(&mut *self.env))
    }
}
