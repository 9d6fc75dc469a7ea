//! Configuration management for the backup runner.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! for the remote endpoint and secrets. Validation runs before any mutation
//! so a broken config never leaves a half-made generation behind.

use crate::retention::RetentionPolicy;
use crate::snapshot::CollisionPolicy;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory tree to snapshot
    pub path: PathBuf,

    /// Entry names containing any of these substrings are skipped
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding one subdirectory per generation
    pub backup_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    Ftp(FtpConfig),
    Directory(DirectoryConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ftp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// Prefer BACKUP_REMOTE_PASSWORD over storing this in the file
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Remote backup root, absolute
    pub root: String,

    /// Per-operation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Mounted filesystem that plays the remote (NAS share, USB disk)
    pub mount: PathBuf,

    /// Remote backup root inside the mount
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Generations older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Total upload attempts on transient network errors
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// First backoff delay, doubled after each failed attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub on_collision: CollisionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Concurrent local generation deletions
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub format: LogFormat,

    /// Log file, appended to when output = "file"
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default values
fn default_ftp_port() -> u16 {
    21
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_parallel() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("backup.log")
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: default_retention_days() }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self { max_parallel: default_max_parallel() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            file: default_log_file(),
        }
    }
}

impl RemoteConfig {
    /// Remote backup root, shared by every transport kind
    pub fn root(&self) -> &str {
        match self {
            RemoteConfig::Ftp(ftp) => &ftp.root,
            RemoteConfig::Directory(dir) => &dir.root,
        }
    }
}

impl FtpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl UploadConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `retry` (1-based): the base backoff
    /// doubled per earlier retry, never above the cap
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff().saturating_mul(factor).min(self.max_backoff())
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Environment wins over the file for the endpoint and its secret.
    /// A `.env` next to the process is honored as well.
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }

        if let RemoteConfig::Ftp(ftp) = &mut self.remote {
            if let Ok(host) = std::env::var("BACKUP_REMOTE_HOST") {
                ftp.host = host;
            }
            if let Ok(username) = std::env::var("BACKUP_REMOTE_USERNAME") {
                ftp.username = username;
            }
            if let Ok(password) = std::env::var("BACKUP_REMOTE_PASSWORD") {
                ftp.password = password;
            }
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.retention.days)
    }

    /// Check every option the run depends on. Nothing is created or touched.
    pub fn validate(&self) -> Result<()> {
        let source = &self.source.path;
        if !source.is_dir() {
            return Err(BackupError::Config(format!(
                "source path {} is not a readable directory",
                source.display()
            )));
        }

        let backup_root = &self.local.backup_root;
        if backup_root.as_os_str().is_empty() {
            return Err(BackupError::Config("local.backup_root is empty".into()));
        }
        if backup_root.exists() {
            if !backup_root.is_dir() {
                return Err(BackupError::Config(format!(
                    "backup root {} exists and is not a directory",
                    backup_root.display()
                )));
            }
        } else {
            let parent_ok = backup_root
                .parent()
                .map(|p| p.as_os_str().is_empty() || p.is_dir())
                .unwrap_or(false);
            if !parent_ok {
                return Err(BackupError::Config(format!(
                    "neither backup root {} nor its parent exists",
                    backup_root.display()
                )));
            }
        }

        // Nesting either way would make a snapshot copy itself
        let source_abs = absolute(source);
        let root_abs = absolute(backup_root);
        if root_abs.starts_with(&source_abs) || source_abs.starts_with(&root_abs) {
            return Err(BackupError::Config(format!(
                "backup root {} and source {} must not contain each other",
                backup_root.display(),
                source.display()
            )));
        }

        validate_remote_root(self.remote.root())?;

        match &self.remote {
            RemoteConfig::Ftp(ftp) => {
                for (name, value) in [
                    ("remote.host", &ftp.host),
                    ("remote.username", &ftp.username),
                    ("remote.password", &ftp.password),
                ] {
                    if value.trim().is_empty() {
                        return Err(BackupError::Config(format!("{} is required", name)));
                    }
                }
                if ftp.timeout_secs == 0 {
                    return Err(BackupError::Config("remote.timeout_secs must be at least 1".into()));
                }
            }
            RemoteConfig::Directory(dir) => {
                if !dir.mount.is_dir() {
                    return Err(BackupError::Config(format!(
                        "remote mount {} is not a directory",
                        dir.mount.display()
                    )));
                }
            }
        }

        if self.retention.days == 0 {
            return Err(BackupError::Config("retention.days must be at least 1".into()));
        }
        if self.upload.attempts == 0 {
            return Err(BackupError::Config("upload.attempts must be at least 1".into()));
        }
        if self.prune.max_parallel == 0 {
            return Err(BackupError::Config("prune.max_parallel must be at least 1".into()));
        }

        Ok(())
    }
}

fn validate_remote_root(root: &str) -> Result<()> {
    if !root.starts_with('/') {
        return Err(BackupError::Config(format!("remote.root {:?} must be absolute", root)));
    }
    if root.trim_matches('/').is_empty() {
        return Err(BackupError::Config("remote.root must not be the server root".into()));
    }
    if root.contains('\\') || root.split('/').any(|seg| seg == "..") {
        return Err(BackupError::Config(format!("remote.root {:?} is not a clean path", root)));
    }
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Not created yet: resolve the parent and re-attach the last segment
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            absolute(parent).join(name)
        }
        _ => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}
