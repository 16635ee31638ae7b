//! Job environment configuration
//!
//! Settings come from up to two YAML files:
//!
//! - the general file (`job_environment.yml` in the working directory, or
//!   `~/.config/jobboard/job_environment.yml`, or an explicit `--config`);
//! - the application file `<app-param-path>/<application>.yml`, whose values
//!   win over the general file.
//!
//! ```yaml
//! environment-path: /srv/jobs/loader
//! source-path: [urgent, input]
//! processed-path: [processed, archive]
//! error-path: error
//! pending-path: pending      # null disables the pending queue
//! lock-file-location: locks
//! ```
//!
//! Relative paths are taken relative to `environment-path`, which itself
//! defaults to a directory named after the application.

use eyre::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{JobError, JobResult};

/// Default general configuration file name
pub const GENERAL_FILE: &str = "job_environment.yml";

/// Default directory holding per-application files
pub const DEFAULT_APP_PARAM_PATH: &str = "job_environment.d";

/// A setting that accepts either a single value or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// Distinguish "not set" (`None`) from an explicit `null` (`Some(None)`)
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// One layer of settings as read from a file; unset keys are `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Directory containing per-application files (general file only)
    pub app_param_path: Option<PathBuf>,

    /// Base for all relative paths below
    pub environment_path: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: Option<String>,

    /// Directories searched for input
    pub source_path: Option<OneOrMany<PathBuf>>,

    /// Root of the pending queue; `null` disables it
    #[serde(deserialize_with = "nullable")]
    pub pending_path: Option<Option<PathBuf>>,

    /// Where inputs go when committed
    pub processed_path: Option<OneOrMany<PathBuf>>,

    /// Where inputs go when failed; `null` sends them to processed
    #[serde(deserialize_with = "nullable")]
    pub error_path: Option<Option<PathBuf>>,

    /// Where outputs are published
    pub output_path: Option<OneOrMany<PathBuf>>,

    /// Staging directory for outputs
    pub temporary_path: Option<PathBuf>,

    /// Directory for lock files instead of next to each input
    pub lock_file_location: Option<PathBuf>,

    /// Remove stale lock files instead of respecting them
    pub lock_file_ignore: Option<bool>,
}

impl Config {
    /// Load the general file and the application file on top of it
    pub fn load(config_path: Option<&PathBuf>, application: &str) -> Result<Self> {
        let general = match config_path {
            Some(path) => {
                Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?
            }
            None => Self::load_default()?,
        };

        let app_file = general
            .app_param_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_APP_PARAM_PATH))
            .join(format!("{}.yml", application));
        if !app_file.exists() {
            tracing::info!("No application config at {}, using general settings", app_file.display());
            return Ok(general);
        }
        let app = Self::load_from_file(&app_file)
            .context(format!("Failed to load application config from {}", app_file.display()))?;
        Ok(general.merge(app))
    }

    /// Only the log level, read before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let config = match config_path {
            Some(path) => Self::load_from_file(path).ok()?,
            None => Self::load_default().ok()?,
        };
        config.log_level
    }

    fn load_default() -> Result<Self> {
        let default_paths = [
            Some(PathBuf::from(GENERAL_FILE)),
            dirs::config_dir().map(|p| p.join("jobboard").join(GENERAL_FILE)),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Settings from `over` win; anything it leaves unset falls through
    pub fn merge(self, over: Config) -> Config {
        Config {
            app_param_path: over.app_param_path.or(self.app_param_path),
            environment_path: over.environment_path.or(self.environment_path),
            log_level: over.log_level.or(self.log_level),
            source_path: over.source_path.or(self.source_path),
            pending_path: over.pending_path.or(self.pending_path),
            processed_path: over.processed_path.or(self.processed_path),
            error_path: over.error_path.or(self.error_path),
            output_path: over.output_path.or(self.output_path),
            temporary_path: over.temporary_path.or(self.temporary_path),
            lock_file_location: over.lock_file_location.or(self.lock_file_location),
            lock_file_ignore: over.lock_file_ignore.or(self.lock_file_ignore),
        }
    }

    /// Apply defaults and turn everything into absolute paths
    pub fn resolve(&self, application: &str) -> Result<JobPaths> {
        let root = self
            .environment_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(application));
        let root = std::path::absolute(&root).context(format!("Failed to resolve {}", root.display()))?;

        let many = |value: &Option<OneOrMany<PathBuf>>, default: &str| -> Vec<PathBuf> {
            value
                .clone()
                .unwrap_or_else(|| OneOrMany::One(PathBuf::from(default)))
                .into_vec()
                .iter()
                .map(|p| root.join(p))
                .collect()
        };
        let optional = |value: &Option<Option<PathBuf>>, default: &str| -> Option<PathBuf> {
            match value {
                None => Some(root.join(default)),
                Some(None) => None,
                Some(Some(p)) => Some(root.join(p)),
            }
        };

        let paths = JobPaths {
            sources: many(&self.source_path, "input"),
            pending: optional(&self.pending_path, "pending"),
            processed: many(&self.processed_path, "processed"),
            error: optional(&self.error_path, "error"),
            outputs: many(&self.output_path, "output"),
            temporary: root.join(self.temporary_path.as_deref().unwrap_or(Path::new("temp"))),
            lock_dir: self.lock_file_location.as_ref().map(|p| root.join(p)),
            force_unlock: self.lock_file_ignore.unwrap_or(false),
            root,
        };

        if paths.processed.is_empty() {
            return Err(eyre::eyre!("processed-path must name at least one directory"));
        }
        Ok(paths)
    }
}

/// The resolved set of directories a job environment works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Environment root; home of the application lock when there is no lock
    /// directory
    pub root: PathBuf,
    pub sources: Vec<PathBuf>,
    pub pending: Option<PathBuf>,
    pub processed: Vec<PathBuf>,
    pub error: Option<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub temporary: PathBuf,
    pub lock_dir: Option<PathBuf>,
    pub force_unlock: bool,
}

impl JobPaths {
    /// The default layout under `root`
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sources: vec![root.join("input")],
            pending: Some(root.join("pending")),
            processed: vec![root.join("processed")],
            error: Some(root.join("error")),
            outputs: vec![root.join("output")],
            temporary: root.join("temp"),
            lock_dir: None,
            force_unlock: false,
            root,
        }
    }

    /// Create every configured directory that does not exist yet
    pub fn create_dirs(&self) -> JobResult<()> {
        let dirs = self
            .sources
            .iter()
            .chain(&self.processed)
            .chain(&self.outputs)
            .chain(self.pending.iter())
            .chain(self.error.iter())
            .chain(self.lock_dir.iter())
            .chain(std::iter::once(&self.temporary));
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|e| JobError::io(dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_one_or_many() {
        let config: Config = serde_yaml::from_str(
            r#"
source-path: input
processed-path: [processed, archive]
"#,
        )
        .unwrap();
        assert_eq!(config.source_path, Some(OneOrMany::One(PathBuf::from("input"))));
        assert_eq!(
            config.processed_path.unwrap().into_vec(),
            vec![PathBuf::from("processed"), PathBuf::from("archive")]
        );
    }

    #[test]
    fn test_null_disables_pending_and_error() {
        let config: Config = serde_yaml::from_str("pending-path: null\nerror-path: ~\n").unwrap();
        assert_eq!(config.pending_path, Some(None));
        assert_eq!(config.error_path, Some(None));

        let paths = config.resolve("app").unwrap();
        assert!(paths.pending.is_none());
        assert!(paths.error.is_none());
    }

    #[test]
    fn test_resolve_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            environment_path: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let paths = config.resolve("loader").unwrap();
        assert_eq!(paths, JobPaths::under(temp.path()));
    }

    #[test]
    fn test_resolve_joins_relative_and_keeps_absolute() {
        let temp = TempDir::new().unwrap();
        let elsewhere = temp.path().join("shared/out");
        let config = Config {
            environment_path: Some(temp.path().join("env")),
            source_path: Some(OneOrMany::Many(vec![PathBuf::from("urgent"), PathBuf::from("input")])),
            output_path: Some(OneOrMany::One(elsewhere.clone())),
            lock_file_location: Some(PathBuf::from("locks")),
            lock_file_ignore: Some(true),
            ..Default::default()
        };
        let paths = config.resolve("loader").unwrap();
        assert_eq!(
            paths.sources,
            vec![temp.path().join("env/urgent"), temp.path().join("env/input")]
        );
        assert_eq!(paths.outputs, vec![elsewhere]);
        assert_eq!(paths.lock_dir, Some(temp.path().join("env/locks")));
        assert!(paths.force_unlock);
    }

    #[test]
    fn test_empty_processed_is_rejected() {
        let config = Config {
            processed_path: Some(OneOrMany::Many(vec![])),
            ..Default::default()
        };
        assert!(config.resolve("app").is_err());
    }

    #[test]
    fn test_merge_prefers_application_layer() {
        let general = Config {
            environment_path: Some(PathBuf::from("/srv/general")),
            error_path: Some(Some(PathBuf::from("error"))),
            log_level: Some("DEBUG".to_string()),
            ..Default::default()
        };
        let app = Config {
            environment_path: Some(PathBuf::from("/srv/app")),
            error_path: Some(None),
            ..Default::default()
        };
        let merged = general.merge(app);
        assert_eq!(merged.environment_path, Some(PathBuf::from("/srv/app")));
        assert_eq!(merged.error_path, Some(None));
        assert_eq!(merged.log_level, Some("DEBUG".to_string()));
    }

    #[test]
    fn test_load_general_and_application_files() {
        let temp = TempDir::new().unwrap();
        let app_dir = temp.path().join("apps");
        fs::create_dir_all(&app_dir).unwrap();

        let general_file = temp.path().join("general.yml");
        fs::write(
            &general_file,
            format!(
                "app-param-path: {}\nenvironment-path: {}\nlog-level: WARN\n",
                app_dir.display(),
                temp.path().join("env").display()
            ),
        )
        .unwrap();
        fs::write(app_dir.join("loader.yml"), "source-path: [a, b]\n").unwrap();

        let config = Config::load(Some(&general_file), "loader").unwrap();
        let paths = config.resolve("loader").unwrap();
        assert_eq!(paths.sources, vec![temp.path().join("env/a"), temp.path().join("env/b")]);
        assert_eq!(Config::load_log_level(Some(&general_file)), Some("WARN".to_string()));

        // No application file: general settings only
        let config = Config::load(Some(&general_file), "other").unwrap();
        assert_eq!(config.source_path, None);
    }

    #[test]
    fn test_create_dirs() {
        let temp = TempDir::new().unwrap();
        let paths = JobPaths::under(temp.path());
        paths.create_dirs().unwrap();
        assert!(temp.path().join("input").is_dir());
        assert!(temp.path().join("pending").is_dir());
        assert!(temp.path().join("temp").is_dir());
    }
}
