//! fedlab.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FedlabConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub paths: PathsConfig,
    pub worker: WorkerConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared with the worker processes.
    pub path: PathBuf,
}

/// Filesystem roots owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Checkpoint store root; each experiment gets `exp_<id>/` below it.
    pub checkpoints: PathBuf,
    /// Root that uploaded artifact references are relative to.
    pub uploads: PathBuf,
}

/// How to locate and launch the external worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter or executable. Resolved inside `venv/bin` when `venv` is set.
    pub program: String,
    /// Entry script passed as the first argument, if any.
    pub script: Option<PathBuf>,
    /// Isolated runtime environment (e.g. a Python virtualenv).
    pub venv: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    /// Redirect worker stdout/stderr into `worker.log` in the checkpoint dir.
    pub capture_output: bool,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Interval between store reads for each subscription (e.g. "2s", "500ms").
    pub poll_interval: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/fedlab.sqlite"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints: PathBuf::from("checkpoints-data"),
            uploads: PathBuf::from("uploads"),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            script: Some(PathBuf::from("runner/flower_runner.py")),
            venv: None,
            working_dir: None,
            capture_output: true,
            env: BTreeMap::new(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: "2s".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> ConfigResult<Duration> {
        match parse_duration(&self.poll_interval) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => Err(ConfigError::Invalid(format!(
                "feed.poll_interval must be a positive duration, got {:?}",
                self.poll_interval
            ))),
        }
    }
}

impl FedlabConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FedlabConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the daemon could not run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.program is empty".to_string()));
        }
        if self.paths.checkpoints.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.checkpoints is empty".to_string()));
        }
        if self.paths.uploads.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.uploads is empty".to_string()));
        }
        self.feed.poll_interval()?;
        Ok(())
    }

    /// Scaffold a config rooted at `data_dir`.
    pub fn scaffold(data_dir: &Path) -> Self {
        FedlabConfig {
            store: StoreConfig {
                path: data_dir.join("fedlab.sqlite"),
            },
            paths: PathsConfig {
                checkpoints: data_dir.join("checkpoints-data"),
                uploads: data_dir.join("uploads"),
            },
            worker: WorkerConfig {
                venv: Some(PathBuf::from("runner/venv")),
                ..WorkerConfig::default()
            },
            ..FedlabConfig::default()
        }
    }
}

/// Parse "500ms", "2s" or "1m" into a `Duration`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        None
    }
}
