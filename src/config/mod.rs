#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context as _;
use directories::{BaseDirs, ProjectDirs};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::SegtaskError;
use crate::queue::redis::DEFAULT_QUEUE_NAME;
use crate::task::blob::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub root: String,
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "~/.local/share/segtask/tasks".to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub url: String,
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            url: "redis://127.0.0.1:6379".to_owned(),
            name: DEFAULT_QUEUE_NAME.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub parallel: usize,
    pub poll_interval: String,
    /// Program invoked as `<command> <image> <output>`.
    pub command: String,
    pub timeout: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            parallel: 1,
            poll_interval: "1s".to_owned(),
            command: String::new(),
            timeout: "10m".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), SegtaskError> {
        if self.storage.root.trim().is_empty() {
            return Err(SegtaskError::Config(
                "storage.root must not be empty".to_owned(),
            ));
        }
        if self.storage.chunk_size == 0 {
            return Err(SegtaskError::Config(
                "storage.chunk_size must be >= 1".to_owned(),
            ));
        }
        if self.queue.name.trim().is_empty() {
            return Err(SegtaskError::Config(
                "queue.name must not be empty".to_owned(),
            ));
        }
        if self.queue.backend == QueueBackend::Redis && self.queue.url.trim().is_empty() {
            return Err(SegtaskError::Config(
                "queue.url must be set for the redis backend".to_owned(),
            ));
        }
        if self.worker.parallel == 0 {
            return Err(SegtaskError::Config(
                "worker.parallel must be >= 1".to_owned(),
            ));
        }
        for (key, value) in [
            ("worker.poll_interval", &self.worker.poll_interval),
            ("worker.timeout", &self.worker.timeout),
        ] {
            parse_duration(value)
                .map_err(|e| SegtaskError::Config(format!("{key}: {e}")))?;
        }
        if self.log.level.parse::<tracing::Level>().is_err() {
            return Err(SegtaskError::Config(format!(
                "log.level must be one of trace|debug|info|warn|error, got '{}'",
                self.log.level
            )));
        }
        Ok(())
    }

    pub fn storage_root(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.storage.root)
    }
}

/// `$XDG_CONFIG_HOME/segtask/config.toml` on Linux, the platform config
/// directory elsewhere.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "segtask")
        .context("failed to determine platform config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("static regex")
});

/// Expands a leading `~/` and any `$VAR` or `${VAR}`. Unset variables are kept
/// verbatim.
#[must_use]
pub fn expand_user(input: &str) -> String {
    let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    let input = match (input.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => input.to_owned(),
    };
    ENV_VAR
        .replace_all(&input, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| caps[0].to_owned())
        })
        .into_owned()
}

/// [`expand_user`], then resolved against the working directory.
pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(expand_user(input));
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()
        .context("failed to get current directory")?
        .join(path))
}

/// Loads the config at `path` (or the default location), falling back to
/// defaults when the file does not exist.
pub fn load(path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };
    let cfg = load_from_file(&path)?;
    cfg.validate()?;
    Ok((cfg, path))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok(cfg)
}

pub fn to_toml(cfg: &Config) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(cfg)?)
}

/// Looks up a dotted key such as `queue.url`. Strings print bare, everything
/// else as JSON.
#[must_use]
pub fn get_value_string(cfg: &Config, key: &str) -> Option<String> {
    let mut value = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.') {
        value = value.get_mut(seg)?.take();
    }
    match value {
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Parses `<digits><unit>` durations such as `200ms`, `30s`, `10m`, `1h` or
/// `2d`. A bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    const UNITS: [(&str, u64); 5] = [
        ("ms", 1),
        ("s", 1_000),
        ("m", 60_000),
        ("h", 3_600_000),
        ("d", 86_400_000),
    ];

    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("invalid duration '{s}'");
    }
    let count: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration '{s}'"))?;
    let unit = if unit.is_empty() { "s" } else { unit };
    let Some(&(_, millis)) = UNITS.iter().find(|(name, _)| *name == unit) else {
        anyhow::bail!("unsupported duration unit in '{s}' (use ms|s|m|h|d)");
    };
    count
        .checked_mul(millis)
        .map(Duration::from_millis)
        .with_context(|| format!("duration '{s}' is too large"))
}
