//! Runtime configuration for the daemon.
//!
//! Loaded once at startup from `~/.devpulse/config.toml` (or the path in
//! `DEVPULSE_CONFIG`). Every field has a default, so a missing file or a
//! partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "DEVPULSE_CONFIG";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".devpulse/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObserverConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub host_log: HostLogConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Overrides where the event database lives.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorsConfig {
    /// Directories to watch. Empty means "discover from shell history".
    #[serde(default)]
    pub watch_roots: Vec<PathBuf>,
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
    #[serde(default = "default_process_sample_interval_secs")]
    pub process_sample_interval_secs: u64,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            watch_roots: Vec::new(),
            file_extensions: default_file_extensions(),
            process_sample_interval_secs: default_process_sample_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_level")]
    pub min_level: String,
}

impl Default for HostLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_level: default_min_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_aggregation_interval_secs")]
    pub aggregation_interval_secs: u64,
    #[serde(default = "default_anomaly_check_interval_secs")]
    pub anomaly_check_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aggregation_interval_secs: default_aggregation_interval_secs(),
            anomaly_check_interval_secs: default_anomaly_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// External analyzer program. Unset means the built-in heuristic analyzer.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_analysis_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ObserverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collectors.process_sample_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "collectors.process_sample_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scheduler.aggregation_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.aggregation_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scheduler.anomaly_check_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.anomaly_check_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if crate::events::LogLevel::from_str(&self.host_log.min_level).is_none() {
            return Err(ConfigError::Invalid {
                field: "host_log.min_level",
                reason: format!("unknown level {:?}", self.host_log.min_level),
            });
        }
        Ok(())
    }

    /// Extensions normalized to a leading dot and lowercase.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.collectors
            .file_extensions
            .iter()
            .map(|ext| ext.trim().to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect()
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<ObserverConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(ObserverConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    parse_config(&content, &config_path)
}

fn parse_config(content: &str, path: &Path) -> Result<ObserverConfig, ConfigError> {
    let config = toml::from_str::<ObserverConfig>(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_file_extensions() -> Vec<String> {
    [
        ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".c", ".cpp", ".h", ".hpp", ".go", ".rs",
        ".rb", ".php", ".md", ".rst", ".txt", ".toml", ".yaml", ".yml", ".json", ".xml",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_process_sample_interval_secs() -> u64 {
    60
}

fn default_min_level() -> String {
    "WARNING".to_string()
}

fn default_aggregation_interval_secs() -> u64 {
    600
}

fn default_anomaly_check_interval_secs() -> u64 {
    60
}

fn default_analysis_timeout_secs() -> u64 {
    120
}
