use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::utils::logo::LogoTrust;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub http: HttpConfig,
    pub validation: ValidationConfig,
    pub playback: PlaybackConfig,
    pub normalizer: NormalizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
    pub cache_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String, // used when a stream carries no override
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeBackend {
    Http,
    Ffprobe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub grouped: bool,
    pub probe_all_candidates: bool,
    pub backend: ProbeBackend,
    pub ffprobe_command: String,
    pub sniff_bytes: usize,
    pub progress_log_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub load_timeout_ms: u64,
    pub advance_delay_ms: u64,
    pub timeout_advance_delay_ms: u64,
    pub max_in_place_recoveries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub trusted_logo_hosts: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "https://raw.githubusercontent.com/iptv-org/iptv/master/streams/cn.m3u".to_string(),
            cache_ttl_secs: 3600,
            fetch_timeout_secs: 30,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout_ms: 12_000,
            grouped: true,
            probe_all_candidates: false,
            backend: ProbeBackend::Http,
            ffprobe_command: "ffprobe".to_string(),
            sniff_bytes: 64 * 1024,
            progress_log_interval: 25,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 15_000,
            advance_delay_ms: 2_000,
            timeout_advance_delay_ms: 1_000,
            max_in_place_recoveries: 1,
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            trusted_logo_hosts: LogoTrust::default_hosts(),
        }
    }
}

impl Config {
    pub fn load() -> AppResult<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.validation.concurrency == 0 {
            return Err(AppError::configuration(
                "validation.concurrency must be at least 1",
            ));
        }
        if self.validation.timeout_ms == 0 {
            return Err(AppError::configuration(
                "validation.timeout_ms must be greater than 0",
            ));
        }
        if self.playback.load_timeout_ms == 0 {
            return Err(AppError::configuration(
                "playback.load_timeout_ms must be greater than 0",
            ));
        }
        if self.source.url.trim().is_empty() {
            return Err(AppError::configuration("source.url must not be empty"));
        }
        Ok(())
    }

    pub fn logo_trust(&self) -> LogoTrust {
        LogoTrust::new(self.normalizer.trusted_logo_hosts.iter().cloned())
    }
}

impl SourceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PlaybackConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }

    pub fn timeout_advance_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_advance_delay_ms)
    }
}
