use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use dirs;
use crate::errors::{AppError, Result};

const ENV_PREFIX: &str = "TERMTUNES";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Maximum number of jobs waiting in the download queue.
    pub queue_capacity: usize,
    /// Number of worker tasks pulling from the queue.
    pub worker_count: usize,
    /// Upper bound on simultaneously running downloads; may be below `worker_count`.
    pub max_concurrent_downloads: usize,
    /// Retries after the first attempt for transient failures.
    pub max_download_retries: u32,
    pub retry_delay_ms: u64,
    /// Per-attempt timeout.
    pub download_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub cache_quota_mb: u64,
    pub cleanup_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub volume_step: f32,
    pub seek_step_ms: u64,
    pub load_timeout_secs: u64,
    /// Tracks after the current one that get prefetch jobs.
    pub prefetch_count: usize,
    pub sample_rate: u32,
    pub buffer_frames: usize,
    pub initial_volume: f32,
    pub skip_on_failure: bool,
    pub repeat: bool,
    pub proxy: Option<String>,
    pub ytdlp_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            worker_count: 10,
            max_concurrent_downloads: 10,
            max_download_retries: 3,
            retry_delay_ms: 2000,
            download_timeout_secs: 120,
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("./cache"))
                .join("termtunes"),
            cache_quota_mb: 1024,
            cleanup_interval_secs: 24 * 60 * 60,
            tick_interval_ms: 50,
            volume_step: 0.05,
            seek_step_ms: 5000,
            load_timeout_secs: 30,
            prefetch_count: 2,
            sample_rate: 44100,
            buffer_frames: 4096,
            initial_volume: 1.0,
            skip_on_failure: true,
            repeat: false,
            proxy: None,
            ytdlp_path: "yt-dlp".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the JSON config file if present, then `TERMTUNES_*` environment variables.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join("termtunes").join("config.json"))
    }

    pub fn validate(mut self) -> Result<Self> {
        let positive = [
            ("queue_capacity", self.queue_capacity as u64),
            ("worker_count", self.worker_count as u64),
            ("max_concurrent_downloads", self.max_concurrent_downloads as u64),
            ("download_timeout_secs", self.download_timeout_secs),
            ("cache_quota_mb", self.cache_quota_mb),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("tick_interval_ms", self.tick_interval_ms),
            ("load_timeout_secs", self.load_timeout_secs),
            ("sample_rate", self.sample_rate as u64),
            ("buffer_frames", self.buffer_frames as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::InvalidInput(format!("{} must be greater than zero", name)));
            }
        }
        if !(self.volume_step > 0.0 && self.volume_step <= 1.0) {
            return Err(AppError::InvalidInput(format!("volume_step must be in (0, 1], got {}", self.volume_step)));
        }
        self.initial_volume = self.initial_volume.clamp(0.0, 1.0);
        Ok(self)
    }

    pub fn cache_quota_bytes(&self) -> u64 {
        self.cache_quota_mb * 1024 * 1024
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.max_download_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.buffer_frames, 4096);
        assert!((config.volume_step - 0.05).abs() < f32::EPSILON);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(86400));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.prefetch_count, 2);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "worker_count": 4, "cache_quota_mb": 64 }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.cache_quota_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.seek_step_ms = 10_000;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.seek_step_ms, 10_000);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_clamps_volume() {
        let mut config = AppConfig::default();
        config.initial_volume = 3.0;
        assert_eq!(config.validate().unwrap().initial_volume, 1.0);
    }
}
