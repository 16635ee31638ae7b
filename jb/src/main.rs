use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command as Process, Stdio};
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use jobboard::cli::{Cli, Command, EXIT_RETRY};
use jobboard::config::{Config, JobPaths};
use jobboard::harness::{HarnessOptions, JobHarness, Outcome};
use jobboard::pending;
use jobboard::scanner;
use jobboard::transport::Disposition;
use jobboard::JobEnvironment;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

    debug!(?level, "setup_logging: initialized");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref(), &cli.app).context("Failed to load configuration")?;
    info!(app = %cli.app, "jobboard starting");

    match cli.command {
        Command::Run {
            reverse,
            once_only,
            unlock,
            single_instance,
            force_app_lock,
            disposition,
            delay,
            output,
            command,
        } => {
            let mut paths = config.resolve(&cli.app)?;
            paths.force_unlock |= unlock;
            paths.create_dirs()?;

            let mut options = HarnessOptions {
                disposition,
                reverse,
                once_only,
                single_instance,
                force_app_lock,
                ..Default::default()
            };
            if let Some(delay) = delay {
                options.default_delay = delay;
            }

            let mut harness = JobHarness::new(JobEnvironment::new(&cli.app, paths), options);
            let summary = harness.run(|env| run_command(env, &command, output.as_ref(), delay))?;

            println!("{} {}", "✓".green(), summary);
            if let Some(reason) = summary.aborted {
                return Err(eyre!("Run aborted: {}", reason));
            }
        }
        Command::Post {
            name,
            delay,
            at,
            content,
            file,
        } => {
            let paths = config.resolve(&cli.app)?;
            let when = match (at, delay) {
                (Some(at), _) => Some(at),
                (None, Some(delay)) => Some(delay_from_now(delay)?),
                (None, None) => None,
            };
            let bytes = match (content, file) {
                (Some(content), _) => content.into_bytes(),
                (None, Some(file)) => fs::read(&file).context(format!("Failed to read {}", file.display()))?,
                (None, None) => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf).context("Failed to read stdin")?;
                    buf
                }
            };

            let env = JobEnvironment::new(&cli.app, paths);
            let posted = env.post_pending(when, &name, &bytes)?;
            println!("{} Posted {}", "✓".green(), posted.display().to_string().cyan());
        }
        Command::Status => {
            let paths = config.resolve(&cli.app)?;
            show_status(&cli.app, &paths)?;
        }
    }

    Ok(())
}

fn delay_from_now(delay: Duration) -> Result<NaiveDateTime> {
    let delta = TimeDelta::from_std(delay).context("Delay out of range")?;
    pending::now()
        .checked_add_signed(delta)
        .ok_or_else(|| eyre!("Delay out of range: {:?}", delay))
}

/// Feed the open input to `command` and map its exit status onto an outcome
fn run_command(
    env: &mut JobEnvironment,
    command: &[String],
    output: Option<&PathBuf>,
    delay: Option<Duration>,
) -> Result<Outcome> {
    let entry = env.current_entry().cloned().ok_or_else(|| eyre!("No input open"))?;
    let mut input = Vec::new();
    if let Some(source) = env.source_mut() {
        source.read_to_end(&mut input).context("Failed to read input")?;
    }

    let (program, args) = command.split_first().ok_or_else(|| eyre!("No command given"))?;
    debug!(%program, ?args, path = ?entry.path, "run_command: spawning");
    let mut child = Process::new(program)
        .args(args)
        .env("JB_INPUT", &entry.path)
        .env("JB_INPUT_NAME", entry.name())
        .stdin(Stdio::piped())
        .stdout(if output.is_some() { Stdio::piped() } else { Stdio::inherit() })
        .spawn()
        .context(format!("Failed to start {}", program))?;

    // Stdin is fed from a thread while stdout is drained here
    let mut stdin = child.stdin.take().ok_or_else(|| eyre!("Child stdin unavailable"))?;
    let writer = std::thread::spawn(move || stdin.write_all(&input));

    let result = child.wait_with_output().context(format!("Failed to wait for {}", program))?;
    if let Ok(Err(e)) = writer.join()
        && e.kind() != io::ErrorKind::BrokenPipe
    {
        return Err(eyre::Report::new(e).wrap_err("Failed to write input to command"));
    }

    let outcome = match result.status.code() {
        Some(0) => Outcome::Commit,
        Some(EXIT_RETRY) => Outcome::Delay(delay),
        code => {
            warn!(?code, "{} failed on {}", program, entry.name());
            Outcome::Rollback
        }
    };

    if let Some(name) = output
        && outcome == Outcome::Commit
    {
        let out = env.open_output(name, Disposition::Keep)?;
        out.write_all(&result.stdout).context("Failed to write output")?;
    }
    Ok(outcome)
}

fn show_status(app: &str, paths: &JobPaths) -> Result<()> {
    println!("Application: {}", app.cyan());
    println!("Root: {}", paths.root.display());

    println!("{}", "Sources:".bold());
    for root in &paths.sources {
        let count = scanner::ordered_walk(root, false).collect::<Result<Vec<_>, _>>()?.len();
        println!("  {} {}", root.display(), format!("({} queued)", count).dimmed());
    }

    match paths.pending.as_ref() {
        None => println!("{} disabled", "Pending:".bold()),
        Some(root) => {
            println!("{} {}", "Pending:".bold(), root.display());
            let queue = pending::PendingQueue::new(root);
            let buckets = queue.buckets()?;
            if buckets.is_empty() {
                println!("  No pending buckets");
            }
            for bucket in buckets {
                let state = if bucket.due { "due".green() } else { "waiting".yellow() };
                println!(
                    "  {} {} {}",
                    pending::bucket_name(bucket.time),
                    state,
                    format!("({} entries)", bucket.entries).dimmed()
                );
            }
        }
    }
    Ok(())
}
