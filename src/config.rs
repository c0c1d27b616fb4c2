//! Configuration for sbomer.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SBOMER_HOME, SBOMER_RUNNER_URL, SBOMER_WEBHOOK_URL)
//! 2. Config file (.sbomer/config.yaml)
//! 3. Defaults (~/.sbomer)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sbomer/config.yaml
//! - Paths in config file are relative to the .sbomer/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{ControllerSettings, OrchestratorSettings, RetryPolicy};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the .sbomer/ directory)
    pub home: Option<String>,
}

/// Which job runner executes pipeline phases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// In-process fake; jobs never progress on their own
    #[default]
    Memory,
    /// Local commands, one per phase
    Process,
    /// Remote job API
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerConfig {
    pub kind: Option<RunnerKind>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub init_command: Vec<String>,
    #[serde(default)]
    pub generate_command: Vec<String>,
    pub request_timeout_seconds: Option<u64>,
    pub visibility_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub redelivery_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControllerConfig {
    pub workers: Option<usize>,
    pub resync_interval_seconds: Option<u64>,
}

/// Resolved job runner settings
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSettings {
    pub kind: RunnerKind,
    pub base_url: Option<String>,
    pub init_command: Vec<String>,
    pub generate_command: Vec<String>,
    pub request_timeout_seconds: u64,
    pub visibility_grace_seconds: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            kind: RunnerKind::Memory,
            base_url: None,
            init_command: Vec::new(),
            generate_command: Vec::new(),
            request_timeout_seconds: 30,
            visibility_grace_seconds: 60,
        }
    }
}

impl RunnerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            call_timeout: self.request_timeout(),
            visibility_grace: Duration::from_secs(self.visibility_grace_seconds),
        }
    }
}

/// Resolved notification settings
#[derive(Debug, Clone, Serialize)]
pub struct NotificationSettings {
    pub webhook_url: Option<String>,
    pub retry: RetryPolicy,
    pub redelivery_interval_seconds: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retry: RetryPolicy::default(),
            redelivery_interval_seconds: 30,
        }
    }
}

impl NotificationSettings {
    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_secs(self.redelivery_interval_seconds)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to the sbomer home (state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub runner: RunnerSettings,
    pub notification: NotificationSettings,
    pub workers: usize,
    pub resync_interval_seconds: u64,
}

impl ResolvedConfig {
    /// Request store root ($SBOMER_HOME/store)
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }

    pub fn controller(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_seconds),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sbomer").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge defaults, an optional config file and environment overrides
fn resolve(
    config_file: Option<PathBuf>,
    file: ConfigFile,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let home = if let Some(env_home) = env("SBOMER_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
        let sbomer_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(sbomer_dir, home_path)
    } else {
        default_home
    };

    let runner_file = file.runner.unwrap_or_default();
    let defaults = RunnerSettings::default();
    let mut runner = RunnerSettings {
        kind: runner_file.kind.unwrap_or(defaults.kind),
        base_url: runner_file.base_url,
        init_command: runner_file.init_command,
        generate_command: runner_file.generate_command,
        request_timeout_seconds: runner_file
            .request_timeout_seconds
            .unwrap_or(defaults.request_timeout_seconds),
        visibility_grace_seconds: runner_file
            .visibility_grace_seconds
            .unwrap_or(defaults.visibility_grace_seconds),
    };
    if let Some(url) = env("SBOMER_RUNNER_URL") {
        runner.kind = RunnerKind::Http;
        runner.base_url = Some(url);
    }

    let notification_file = file.notification.unwrap_or_default();
    let retry_defaults = RetryPolicy::default();
    let notification = NotificationSettings {
        webhook_url: env("SBOMER_WEBHOOK_URL").or(notification_file.webhook_url),
        retry: RetryPolicy {
            max_attempts: notification_file
                .max_attempts
                .unwrap_or(retry_defaults.max_attempts),
            initial_delay_ms: notification_file
                .initial_delay_ms
                .unwrap_or(retry_defaults.initial_delay_ms),
            max_delay_ms: notification_file
                .max_delay_ms
                .unwrap_or(retry_defaults.max_delay_ms),
            backoff_multiplier: notification_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        },
        redelivery_interval_seconds: notification_file.redelivery_interval_seconds.unwrap_or(30),
    };

    let controller = file.controller.unwrap_or_default();

    ResolvedConfig {
        home,
        config_file,
        runner,
        notification,
        workers: controller.workers.unwrap_or(4),
        resync_interval_seconds: controller.resync_interval_seconds.unwrap_or(15),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sbomer");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(config_file, file, default_home, |key| {
        std::env::var(key).ok()
    }))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the sbomer home directory
pub fn sbomer_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the request store directory ($SBOMER_HOME/store)
pub fn store_dir() -> Result<PathBuf> {
    Ok(config()?.store_dir())
}
