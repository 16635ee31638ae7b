//! Pending queue: delayed delivery keyed by wall-clock time
//!
//! ```text
//! pending/
//! ├── 202610151200/        # due once 12:00 has passed
//! │   └── job{repeat: 1}.txt
//! └── 202610151300/
//!     └── report.csv
//! ```
//!
//! Bucket names are local time at minute resolution, so everything scheduled
//! within the same minute shares one bucket. Buckets are never removed here;
//! sweeping out empty ones is left to housekeeping.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};
use tracing::{debug, info};

use crate::error::{JobError, JobResult};
use crate::lock::LockManager;
use crate::scanner::{self, QueueEntry};
use crate::transport;

/// `strftime` format of bucket directory names
pub const BUCKET_FORMAT: &str = "%Y%m%d%H%M";

/// Current local time, the clock bucket names are written in
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Bucket directory name for a point in time
pub fn bucket_name(time: NaiveDateTime) -> String {
    time.format(BUCKET_FORMAT).to_string()
}

/// Decode a bucket directory name; `None` for anything else
pub fn parse_bucket_name(name: &str) -> Option<NaiveDateTime> {
    if name.len() != 12 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(name, BUCKET_FORMAT).ok()
}

/// One bucket as seen by [`PendingQueue::buckets`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub path: PathBuf,
    pub time: NaiveDateTime,
    pub due: bool,
    /// Number of visible entries in the bucket
    pub entries: usize,
}

/// The pending directory and its time buckets
#[derive(Debug, Clone)]
pub struct PendingQueue {
    root: PathBuf,
}

impl PendingQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!(?root, "PendingQueue::new: called");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bucket for `now + delay`, created if it does not exist yet
    pub fn bucket_for(&self, delay: Duration) -> JobResult<PathBuf> {
        let delta = TimeDelta::from_std(delay).map_err(|e| JobError::InvalidDelay(e.to_string()))?;
        let when = now()
            .checked_add_signed(delta)
            .ok_or_else(|| JobError::InvalidDelay(format!("{:?} is out of range", delay)))?;
        self.bucket_at(when)
    }

    /// Bucket for the minute containing `when`, created if needed
    pub fn bucket_at(&self, when: NaiveDateTime) -> JobResult<PathBuf> {
        let path = self.root.join(bucket_name(when));
        debug!(?path, "PendingQueue::bucket_at: called");
        fs::create_dir_all(&path).map_err(|e| JobError::io(&path, e))?;
        Ok(path)
    }

    /// Bucket directories with their decoded times, oldest first
    fn list_buckets(&self) -> JobResult<Vec<(NaiveDateTime, PathBuf)>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(&self.root, e)),
        };

        let mut buckets = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| JobError::io(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match parse_bucket_name(&name) {
                Some(time) if entry.path().is_dir() => buckets.push((time, entry.path())),
                _ => debug!(%name, "PendingQueue::list_buckets: not a bucket, ignoring"),
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    /// First entry in a due bucket whose lock this process wins
    pub fn due_entry(&self, locks: &mut LockManager) -> JobResult<Option<QueueEntry>> {
        self.due_entry_at(now(), locks)
    }

    /// Same as [`due_entry`](Self::due_entry) against one clock sample
    ///
    /// A bucket is due when its time is strictly before `now`.
    pub fn due_entry_at(&self, now: NaiveDateTime, locks: &mut LockManager) -> JobResult<Option<QueueEntry>> {
        debug!(root = ?self.root, %now, "PendingQueue::due_entry_at: called");
        for (time, bucket) in self.list_buckets()? {
            if time >= now {
                break;
            }
            if let Some(entry) = scanner::scan_root(&bucket, false, locks)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every bucket with its due state, oldest first
    pub fn buckets(&self) -> JobResult<Vec<BucketInfo>> {
        let now = now();
        self.list_buckets()?
            .into_iter()
            .map(|(time, path)| {
                let entries = scanner::ordered_walk(&path, false).collect::<JobResult<Vec<_>>>()?.len();
                Ok(BucketInfo {
                    path,
                    time,
                    due: time < now,
                    entries,
                })
            })
            .collect()
    }

    /// Drop a new message into the bucket for `when` (or now)
    ///
    /// The content is written under a hidden name and linked into place, so
    /// a consumer never picks up a partial file. A message already posted
    /// under the same name to the same bucket is never replaced.
    pub fn post(&self, when: Option<NaiveDateTime>, file_name: &str, content: &[u8]) -> JobResult<PathBuf> {
        let bucket = self.bucket_at(when.unwrap_or_else(now))?;
        let target = bucket.join(file_name);
        let part = transport::part_path(&target);
        debug!(?target, "PendingQueue::post: called");

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .map_err(|e| JobError::io(&part, e))?;
        file.write_all(content).map_err(|e| JobError::io(&part, e))?;
        file.sync_all().map_err(|e| JobError::io(&part, e))?;
        drop(file);
        transport::place(&part, &target, true)?;

        info!("Posted {} to pending queue", target.display());
        Ok(target)
    }
}
