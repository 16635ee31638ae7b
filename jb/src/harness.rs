//! Job harness: drive a processor over every available input
//!
//! The processor reads the open input (and optionally writes the open output)
//! and answers with an [`Outcome`]; the harness maps that onto the closing
//! operations of the [`JobEnvironment`].

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::environment::JobEnvironment;
use crate::error::{JobError, JobResult};
use crate::transport::{Disposition, MagicFileTransport, Transport};

/// Delay used when a processor asks for a retry without naming one
pub const DEFAULT_DELAY: Duration = Duration::from_secs(3600);

/// What a processor wants done with the input it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Done: input to processed, output published
    Commit,
    /// Failed: input to the error directory, output discarded
    Rollback,
    /// Try again later: input back on the pending queue, output discarded
    Delay(Option<Duration>),
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub disposition: Disposition,
    pub reverse: bool,
    /// Stop after the first input
    pub once_only: bool,
    pub default_delay: Duration,
    /// Refuse to run while another instance of the application holds its lock
    pub single_instance: bool,
    /// Take the application lock even if another instance holds it
    pub force_app_lock: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            disposition: Disposition::Keep,
            reverse: false,
            once_only: false,
            default_delay: DEFAULT_DELAY,
            single_instance: false,
            force_app_lock: false,
        }
    }
}

/// Counts from one [`JobHarness::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub committed: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Set when a processor error stopped the run early
    pub aborted: Option<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} committed, {} failed, {} delayed",
            self.processed, self.committed, self.failed, self.delayed
        )?;
        if let Some(reason) = &self.aborted {
            write!(f, " (aborted: {})", reason)?;
        }
        Ok(())
    }
}

pub struct JobHarness<T: Transport = MagicFileTransport> {
    env: JobEnvironment<T>,
    options: HarnessOptions,
}

impl<T: Transport> JobHarness<T> {
    pub fn new(env: JobEnvironment<T>, options: HarnessOptions) -> Self {
        debug!(application = env.application(), ?options, "JobHarness::new: called");
        Self { env, options }
    }

    pub fn env(&self) -> &JobEnvironment<T> {
        &self.env
    }

    /// Run `processor` over the input set until it is exhausted
    ///
    /// A processor error fails the entry it was working on and stops the
    /// run; the summary records why. Errors from the environment itself are
    /// returned.
    pub fn run<P, E>(&mut self, mut processor: P) -> JobResult<RunSummary>
    where
        P: FnMut(&mut JobEnvironment<T>) -> Result<Outcome, E>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let application = self.env.application().to_string();
        info!(%application, "Job started");

        if self.options.single_instance {
            if !self.env.try_acquire_app_lock(self.options.force_app_lock)? {
                warn!(%application, "Another instance is running");
                return Err(JobError::AlreadyRunning(application));
            }
        }

        let result = self.process_all(&mut processor);

        if self.options.single_instance {
            self.env.release_app_lock()?;
        }

        let summary = result?;
        info!(
            %application,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished: {}",
            summary
        );
        Ok(summary)
    }

    fn process_all<P, E>(&mut self, processor: &mut P) -> JobResult<RunSummary>
    where
        P: FnMut(&mut JobEnvironment<T>) -> Result<Outcome, E>,
        E: fmt::Display,
    {
        let HarnessOptions {
            disposition,
            reverse,
            once_only,
            default_delay,
            ..
        } = self.options.clone();
        let mut summary = RunSummary::default();

        let mut inputs = self.env.input_set(disposition, reverse);
        while let Some(env) = inputs.next_input()? {
            let name = env.current_name().unwrap_or_default();
            let file_started = Instant::now();
            summary.processed += 1;
            debug!(%name, "JobHarness::process_all: processing");

            match processor(&mut *env) {
                Ok(Outcome::Commit) => {
                    env.commit_output()?;
                    env.commit()?;
                    summary.committed += 1;
                }
                Ok(Outcome::Rollback) => {
                    env.rollback_output()?;
                    env.fail()?;
                    summary.failed += 1;
                }
                Ok(Outcome::Delay(delay)) => {
                    env.rollback_output()?;
                    match env.requeue(delay.unwrap_or(default_delay)) {
                        Ok(()) => summary.delayed += 1,
                        Err(e) => {
                            warn!(%name, "Could not requeue, failing instead: {}", e);
                            env.fail()?;
                            summary.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(%name, "Processing failed: {}", e);
                    env.rollback_output()?;
                    env.fail()?;
                    summary.failed += 1;
                    summary.aborted = Some(format!("{}: {}", name, e));
                    break;
                }
            }

            info!(
                elapsed_ms = file_started.elapsed().as_millis() as u64,
                "Finished {}", name
            );
            if once_only {
                debug!("JobHarness::process_all: once only, stopping");
                break;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobPaths;
    use std::fs;
    use std::io::{Read, Write};
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(temp: &TempDir, inputs: &[&str]) -> JobHarness {
        let paths = JobPaths::under(temp.path());
        paths.create_dirs().unwrap();
        for name in inputs {
            fs::write(temp.path().join("input").join(name), name).unwrap();
        }
        JobHarness::new(JobEnvironment::new("test", paths), HarnessOptions::default())
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_commit_all() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["a.txt", "b.txt"]);

        let mut seen = Vec::new();
        let summary = harness
            .run(|env| {
                let mut content = String::new();
                env.source_mut().unwrap().read_to_string(&mut content)?;
                seen.push(content);
                Ok::<_, std::io::Error>(Outcome::Commit)
            })
            .unwrap();

        assert_eq!(seen, vec!["a.txt", "b.txt"]);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.committed, 2);
        assert!(summary.aborted.is_none());
        assert_eq!(files(&temp.path().join("processed")), vec!["a.txt", "b.txt"]);
        assert!(files(&temp.path().join("input")).is_empty());
    }

    #[test]
    fn test_rollback_goes_to_error() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["bad.txt"]);

        let summary = harness.run(|_| Ok::<_, String>(Outcome::Rollback)).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(files(&temp.path().join("error")), vec!["bad.txt"]);
    }

    #[test]
    fn test_delay_requeues_with_repeat() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["job.txt"]);

        let summary = harness
            .run(|_| Ok::<_, String>(Outcome::Delay(Some(Duration::from_secs(3600)))))
            .unwrap();
        assert_eq!(summary.delayed, 1);
        assert_eq!(summary.processed, 1);

        let buckets = harness.env().pending().unwrap().buckets().unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(!buckets[0].due);
        assert_eq!(files(&buckets[0].path), vec!["job{repeat: 1}.txt"]);
    }

    #[test]
    fn test_processor_error_stops_run() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["a.txt", "b.txt"]);

        let summary = harness.run(|_| Err::<Outcome, _>("boom")).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.aborted.as_deref(), Some("a.txt: boom"));
        assert_eq!(files(&temp.path().join("error")), vec!["a.txt"]);
        assert_eq!(files(&temp.path().join("input")), vec!["b.txt"]);
    }

    #[test]
    fn test_output_follows_outcome() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["a.txt", "b.txt"]);

        harness
            .run(|env| {
                let name = env.current_name().unwrap();
                let out = env.open_output(format!("{}.out", name), Disposition::Keep)?;
                out.write_all(b"result")?;
                if name == "a.txt" {
                    Ok::<_, eyre::Report>(Outcome::Commit)
                } else {
                    Ok(Outcome::Rollback)
                }
            })
            .unwrap();

        assert_eq!(files(&temp.path().join("output")), vec!["a.txt.out"]);
        assert!(files(&temp.path().join("temp")).is_empty());
    }

    #[test]
    fn test_once_only() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["a.txt", "b.txt"]);
        harness.options.once_only = true;

        let summary = harness.run(|_| Ok::<_, String>(Outcome::Commit)).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(files(&temp.path().join("input")), vec!["b.txt"]);
    }

    #[test]
    fn test_single_instance() {
        let temp = TempDir::new().unwrap();
        let mut harness = setup(&temp, &["a.txt"]);
        harness.options.single_instance = true;

        let mut other = JobEnvironment::new("test", JobPaths::under(temp.path()));
        assert!(other.try_acquire_app_lock(false).unwrap());

        let result = harness.run(|_| Ok::<_, String>(Outcome::Commit));
        assert!(matches!(result, Err(JobError::AlreadyRunning(app)) if app == "test"));
        assert_eq!(files(&temp.path().join("input")), vec!["a.txt"]);

        other.release_app_lock().unwrap();
        let summary = harness.run(|_| Ok::<_, String>(Outcome::Commit)).unwrap();
        assert_eq!(summary.committed, 1);
        assert!(!temp.path().join(".LCK.test").exists());
    }

    #[test]
    fn test_entry_unlock_leaves_app_lock_alone() {
        let temp = TempDir::new().unwrap();
        let mut paths = JobPaths::under(temp.path());
        paths.force_unlock = true;
        paths.create_dirs().unwrap();
        fs::write(temp.path().join("input/a.txt"), "a").unwrap();
        let options = HarnessOptions {
            single_instance: true,
            ..Default::default()
        };
        let mut harness = JobHarness::new(JobEnvironment::new("test", paths), options);

        let mut other = JobEnvironment::new("test", JobPaths::under(temp.path()));
        assert!(other.try_acquire_app_lock(false).unwrap());

        let result = harness.run(|_| Ok::<_, String>(Outcome::Commit));
        assert!(matches!(result, Err(JobError::AlreadyRunning(_))));
        assert_eq!(files(&temp.path().join("input")), vec!["a.txt"]);

        harness.options.force_app_lock = true;
        let summary = harness.run(|_| Ok::<_, String>(Outcome::Commit)).unwrap();
        assert_eq!(summary.committed, 1);
    }

    #[test]
    fn test_delay_onto_taken_name_fails_input() {
        let temp = TempDir::new().unwrap();
        let mut paths = JobPaths::under(temp.path());
        paths.sources = vec![temp.path().join("in1"), temp.path().join("in2")];
        paths.create_dirs().unwrap();
        for (dir, content) in [("in1", "first"), ("in2", "second")] {
            fs::create_dir_all(temp.path().join(dir)).unwrap();
            fs::write(temp.path().join(dir).join("job.txt"), content).unwrap();
        }
        let mut harness = JobHarness::new(JobEnvironment::new("test", paths), HarnessOptions::default());

        let summary = harness
            .run(|_| Ok::<_, String>(Outcome::Delay(Some(Duration::from_secs(3600)))))
            .unwrap();
        assert_eq!(summary.processed, 2);

        // Both may land in the pending queue if the bucket minute rolled over
        let mut kept = Vec::new();
        for bucket in harness.env().pending().unwrap().buckets().unwrap() {
            for name in files(&bucket.path) {
                kept.push(fs::read_to_string(bucket.path.join(name)).unwrap());
            }
        }
        for name in files(&temp.path().join("error")) {
            kept.push(fs::read_to_string(temp.path().join("error").join(name)).unwrap());
        }
        kept.sort();
        assert_eq!(kept, vec!["first", "second"]);
        assert_eq!(summary.delayed + summary.failed, 2);
    }
}
