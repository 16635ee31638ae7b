//! CLI argument parsing for jobboard

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;

use crate::error::JobError;
use crate::pending::parse_bucket_name;
use crate::transport::Disposition;

/// Exit code a `run` command uses to ask for a retry later (EX_TEMPFAIL)
pub const EXIT_RETRY: i32 = 75;

#[derive(Parser, Debug)]
#[command(name = "jb")]
#[command(author, version, about = "File-based job queue and message board", long_about = None)]
pub struct Cli {
    /// Path to the general config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Application name; selects the application config and lock
    #[arg(short, long, global = true, default_value = "jobboard")]
    pub app: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed every available input to a command
    ///
    /// The input is on stdin, its path in JB_INPUT and its name in
    /// JB_INPUT_NAME. Exit 0 commits, exit 75 requeues, anything else fails
    /// the input.
    Run {
        /// Take inputs in reverse name order
        #[arg(short, long)]
        reverse: bool,

        /// Stop after one input
        #[arg(long)]
        once_only: bool,

        /// Remove existing lock files instead of respecting them
        #[arg(long)]
        unlock: bool,

        /// Refuse to start while another instance of this application runs
        #[arg(long)]
        single_instance: bool,

        /// With --single-instance, take over the application lock of a crashed instance
        #[arg(long, requires = "single_instance")]
        force_app_lock: bool,

        /// What a commit does with the input (keep, delete)
        #[arg(short, long, default_value = "keep", value_parser = parse_disposition)]
        disposition: Disposition,

        /// Requeue delay in seconds
        #[arg(long, value_name = "SECS", value_parser = parse_delay)]
        delay: Option<Duration>,

        /// Capture the command's stdout into this output file
        #[arg(short, long, value_name = "NAME")]
        output: Option<PathBuf>,

        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Post a message into the pending queue
    Post {
        /// File name of the message
        #[arg(required = true)]
        name: String,

        /// Deliver after this many seconds
        #[arg(long, value_name = "SECS", value_parser = parse_delay, conflicts_with = "at")]
        delay: Option<Duration>,

        /// Deliver after this minute (YYYYMMDDHHMM, local time)
        #[arg(long, value_name = "YYYYMMDDHHMM", value_parser = parse_at)]
        at: Option<NaiveDateTime>,

        /// Message content
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,

        /// Read the message content from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show queued inputs and pending buckets
    Status,
}

fn parse_delay(s: &str) -> Result<Duration, JobError> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| JobError::InvalidDelay(s.to_string()))
}

fn parse_at(s: &str) -> Result<NaiveDateTime, JobError> {
    parse_bucket_name(s).ok_or_else(|| JobError::InvalidBucketTime(s.to_string()))
}

fn parse_disposition(s: &str) -> Result<Disposition, JobError> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "jb", "--app", "loader", "run", "--once-only", "-d", "delete", "--delay", "60", "--", "sh", "-c", "cat",
        ])
        .unwrap();
        assert_eq!(cli.app, "loader");
        match cli.command {
            Command::Run {
                once_only,
                disposition,
                delay,
                command,
                ..
            } => {
                assert!(once_only);
                assert_eq!(disposition, Disposition::Delete);
                assert_eq!(delay, Some(Duration::from_secs(60)));
                assert_eq!(command, vec!["sh", "-c", "cat"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_post() {
        let cli = Cli::try_parse_from(["jb", "post", "msg.txt", "--at", "202610151200", "--content", "hi"]).unwrap();
        match cli.command {
            Command::Post { name, at, content, .. } => {
                assert_eq!(name, "msg.txt");
                assert_eq!(at, parse_bucket_name("202610151200"));
                assert_eq!(content.as_deref(), Some("hi"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Cli::try_parse_from(["jb", "post", "m", "--at", "tomorrow"]).is_err());
        assert!(Cli::try_parse_from(["jb", "post", "m", "--delay", "-5"]).is_err());
        assert!(Cli::try_parse_from(["jb", "post", "m", "--delay", "5", "--at", "202610151200"]).is_err());
        assert!(Cli::try_parse_from(["jb", "run", "-d", "archive", "--", "true"]).is_err());
        assert!(Cli::try_parse_from(["jb", "run"]).is_err());
    }
}
