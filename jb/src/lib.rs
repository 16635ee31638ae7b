//! JobBoard - file-based job queue and message board
//!
//! Independent batch jobs hand work to each other through plain directories.
//! Producers drop files into a source directory (or post them into the pending
//! queue for later); consumers pull the next file, lock it, process it and
//! move it on.
//!
//! # Architecture
//!
//! ```text
//! <environment-path>/
//! ├── input/                    # source directories, scanned in name order
//! │   ├── .LCK.job{repeat: 1}.txt
//! │   └── job{repeat: 1}.txt    # metadata rides in the file name
//! ├── pending/
//! │   └── 202610151200/         # due once that minute has passed
//! ├── processed/                # committed inputs (one or many)
//! ├── error/                    # failed inputs
//! ├── temp/                     # outputs while being written
//! └── output/                   # published outputs (one or many)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use jobboard::{Disposition, JobEnvironment, JobPaths};
//!
//! let mut env = JobEnvironment::new("loader", JobPaths::under("/srv/jobs/loader"));
//! let mut inputs = env.input_set(Disposition::Keep, false);
//! while let Some(env) = inputs.next_input()? {
//!     let mut text = String::new();
//!     env.source_mut().unwrap().read_to_string(&mut text)?;
//!     if text.is_empty() {
//!         env.requeue(std::time::Duration::from_secs(600))?;
//!     } else {
//!         env.commit()?;
//!     }
//! }
//! ```

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod harness;
pub mod lock;
pub mod meta;
pub mod pending;
pub mod scanner;
pub mod transport;

pub use config::{Config, JobPaths};
pub use environment::{InputSet, JobEnvironment};
pub use error::{JobError, JobResult};
pub use harness::{HarnessOptions, JobHarness, Outcome, RunSummary};
pub use lock::{AppLock, LockManager};
pub use meta::{FileMeta, MetaMap, MetaValue};
pub use pending::PendingQueue;
pub use scanner::QueueEntry;
pub use transport::{Disposition, MagicFile, MagicFileTransport, Retarget, Transport, TransportHandle};
