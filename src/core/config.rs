//! Engine configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::{EngineError, RetryPolicy};

/// Tunables shared by every downloader built from one factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size (multi-thread) or fetch parallelism (HLS)
    pub concurrency: usize,
    /// Segments smaller than this are not split further
    pub min_segment_size: u64,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks
    pub read_timeout_secs: u64,
    pub progress_interval_ms: u64,
    /// How long pause() waits for workers before abandoning them
    pub pause_timeout_ms: u64,
    /// Number of samples in the speed window
    pub speed_window: usize,
    /// EMA weight of the newest speed sample
    pub speed_smoothing: f64,
    /// Bytes per second across all workers of a downloader
    pub bandwidth_limit: Option<u64>,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            min_segment_size: 256 * 1024,
            max_redirects: 5,
            retry: RetryPolicy::default(),
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            progress_interval_ms: 500,
            pause_timeout_ms: 3000,
            speed_window: 10,
            speed_smoothing: 0.3,
            bandwidth_limit: None,
            user_agent: crate::utils::network::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No configuration at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from a JSON file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: EngineConfig =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        tracing::info!("Loaded configuration from: {:?}", path);
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "streamdownloader", "engine")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |message: &str| {
            Err(EngineError::Config {
                message: message.to_string(),
            })
        };

        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if self.concurrency > 64 {
            return invalid("concurrency should not exceed 64");
        }
        if self.min_segment_size == 0 {
            return invalid("min_segment_size must be greater than 0");
        }
        if self.retry.max_retries > 20 {
            return invalid("retry.max_retries should not exceed 20");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be between 0 and 1");
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return invalid("timeouts must be greater than 0");
        }
        if self.progress_interval_ms == 0 {
            return invalid("progress_interval_ms must be greater than 0");
        }
        if self.speed_window == 0 {
            return invalid("speed_window must be greater than 0");
        }
        if !(self.speed_smoothing > 0.0 && self.speed_smoothing <= 1.0) {
            return invalid("speed_smoothing must be in (0, 1]");
        }
        if self.bandwidth_limit == Some(0) {
            return invalid("bandwidth_limit must be greater than 0 when set");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }
}
