//! YAML configuration with defaults for every key.
//!
//! The supervisor loads this once at startup and passes it down by
//! reference; there is no process-wide config singleton. Every section
//! carries `#[serde(default)]` so a partial config file (or none of a
//! section at all) falls back to the documented defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::BridgeError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub admin_wxid: String,
    pub claude: ClaudeConfig,
    pub docker: DockerConfig,
    pub permissions: PermissionsConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClaudeConfig {
    pub cli_path: String,
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    pub container_prefix: String,
    pub data_dir: String,
    pub limits: DockerLimits,
    pub network: DockerNetwork,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DockerLimits {
    pub memory: String,
    pub admin_memory: String,
    pub cpus: f64,
    pub admin_cpus: f64,
    pub pids: u32,
    pub tmp_size: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DockerNetwork {
    pub admin: String,
    pub trusted: String,
    pub normal: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PermissionsConfig {
    pub default_level: String,
    pub notify_unauthorized: bool,
    pub unauthorized_message: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub expire_minutes: u64,
    /// Recognized for config compatibility; the pipeline does not read it.
    pub max_history: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_per_minute: u32,
    pub max_per_day: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
    pub log_message_content: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".into(),
            timeout: 120,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "claude-sandbox:latest".into(),
            container_prefix: "claude-friend-".into(),
            data_dir: "~/claude-bridge-data".into(),
            limits: DockerLimits::default(),
            network: DockerNetwork::default(),
        }
    }
}

impl Default for DockerLimits {
    fn default() -> Self {
        Self {
            memory: "512m".into(),
            admin_memory: "2g".into(),
            cpus: 1.0,
            admin_cpus: 2.0,
            pids: 100,
            tmp_size: "100m".into(),
        }
    }
}

impl Default for DockerNetwork {
    fn default() -> Self {
        Self {
            admin: "bridge".into(),
            trusted: "claude-limited".into(),
            normal: "none".into(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            default_level: "normal".into(),
            notify_unauthorized: true,
            unauthorized_message: "Sorry, you are not authorized to use this service yet.".into(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_minutes: 60,
            max_history: 50,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 10,
            max_per_day: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
            log_message_content: true,
        }
    }
}

impl Config {
    /// Load and parse the YAML config at `path`.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        if !path.exists() {
            return Err(BridgeError::ConfigMissing {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::ConfigInvalid(format!("cannot read {:?}: {}", path, e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| BridgeError::ConfigInvalid(format!("cannot parse {:?}: {}", path, e)))
    }
}

impl DockerConfig {
    /// `data_dir` with a leading `~` expanded to the process owner's home.
    pub fn expanded_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
        PathBuf::from(&self.data_dir)
    }
}

/// Parse a memory string like `512m`, `2G`, `1024k` or a plain byte count
/// into bytes. The suffix is case-insensitive. Empty strings and negative
/// values are configuration errors.
pub fn parse_memory(s: &str) -> Result<i64, BridgeError> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err(BridgeError::ConfigInvalid(
            "empty memory limit".to_string(),
        ));
    }

    let (digits, multiplier) = if let Some(rest) = s.strip_suffix('g') {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 1024 * 1024)
    } else if let Some(rest) = s.strip_suffix('k') {
        (rest, 1024)
    } else {
        (s.as_str(), 1)
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| BridgeError::ConfigInvalid(format!("bad memory limit \"{}\"", s)))?;
    if value < 0 {
        return Err(BridgeError::ConfigInvalid(format!(
            "negative memory limit \"{}\"",
            s
        )));
    }
    Ok(value * multiplier)
}

/// Convert a CPU count to Docker nano-CPUs.
pub fn cpus_to_nanocpus(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0).round() as i64
}
