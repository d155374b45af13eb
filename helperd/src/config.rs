//! helperd configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/helperd/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct HelperdConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

#[derive(Debug, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Directory holding the installed helper binaries
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,
    /// Privileged shell prefix; the command line is appended as one argument
    #[serde(default = "default_elevate")]
    pub elevate: Vec<String>,
    /// Kill-by-name command; the tool identifier is appended
    #[serde(default = "default_kill_command")]
    pub kill_command: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tools_dir: default_tools_dir(),
            elevate: default_elevate(),
            kill_command: default_kill_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub format: EventFormat,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            format: EventFormat::default(),
        }
    }
}

/// How the daemon renders log events on stdout
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    #[serde(default)]
    pub exit_when_idle: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            marker_file: default_marker_file(),
            exit_when_idle: false,
        }
    }
}

fn default_log_level() -> String { "info".into() }
fn default_tools_dir() -> PathBuf { PathBuf::from("/data/local/helperd/bin") }
fn default_elevate() -> Vec<String> { vec!["su".into(), "-c".into()] }
fn default_kill_command() -> String { "pkill -9".into() }
fn default_drain_timeout() -> u64 { 500 }
fn default_channel_capacity() -> usize { 1024 }
fn default_marker_file() -> PathBuf { PathBuf::from("/run/helperd/active") }

/// Config path from `HELPERD_CONFIG`, or /etc/helperd/config.toml
pub fn config_path() -> PathBuf {
    std::env::var_os("HELPERD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Parse the config at `path`. `None` means the file does not exist.
pub fn load_config_from(path: &Path) -> Result<Option<HelperdConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: HelperdConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    Ok(Some(config))
}
