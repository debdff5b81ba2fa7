//! Playlist ingestion: fetch, parse, normalize and index
//!
//! The only hard failure in this layer is an unreachable playlist origin.
//! Malformed playlist text degrades to fewer entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{AppError, AppResult, SourceError, SourceResult};
use crate::models::{Channel, Stream};
use crate::utils::url::UrlUtils;

pub mod cache;
pub mod channel_index;
pub mod m3u_parser;
pub mod normalizer;

pub use cache::PlaylistCache;
pub use channel_index::ChannelIndex;
pub use m3u_parser::{M3uParser, ParseStats};
pub use normalizer::{EntryNormalizer, Normalized};

/// Where playlist text comes from
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Human readable origin, used in logs
    fn describe(&self) -> String;

    async fn fetch(&self) -> SourceResult<String>;
}

/// Fetches a playlist over HTTP(S)
pub struct HttpPlaylistSource {
    client: Client,
    url: String,
}

impl HttpPlaylistSource {
    pub fn new(url: impl Into<String>, user_agent: &str, timeout: Duration) -> SourceResult<Self> {
        let url = url.into();
        if !UrlUtils::is_valid(&url) {
            return Err(SourceError::invalid_config("source.url", format!("not a valid URL: {url}")));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SourceError::invalid_config("http", e.to_string()))?;

        Ok(Self { client, url })
    }

    pub fn from_config(config: &Config) -> SourceResult<Self> {
        Self::new(
            config.source.url.clone(),
            &config.http.user_agent,
            config.source.fetch_timeout(),
        )
    }
}

#[async_trait]
impl PlaylistSource for HttpPlaylistSource {
    fn describe(&self) -> String {
        UrlUtils::obfuscate_credentials(&self.url)
    }

    async fn fetch(&self) -> SourceResult<String> {
        let display_url = self.describe();
        debug!("Fetching playlist from {}", display_url);

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::timeout(display_url.clone())
            } else {
                SourceError::unreachable(display_url.clone(), e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::timeout(display_url.clone())
            } else {
                SourceError::unreachable(display_url.clone(), e.to_string())
            }
        })?;

        debug!("Fetched {} bytes from {}", body.len(), display_url);
        Ok(body)
    }
}

/// Playlist text that is already in memory
pub struct StaticPlaylistSource {
    content: String,
}

impl StaticPlaylistSource {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait]
impl PlaylistSource for StaticPlaylistSource {
    fn describe(&self) -> String {
        "in-memory playlist".to_string()
    }

    async fn fetch(&self) -> SourceResult<String> {
        Ok(self.content.clone())
    }
}

pub const CHANNELS_FILE: &str = "channels.json";
pub const STREAMS_FILE: &str = "streams.json";

/// Everything derived from one playlist download
#[derive(Debug, Clone)]
pub struct IngestedPlaylist {
    pub channels: Vec<Channel>,
    pub streams: Vec<Stream>,
    pub index: ChannelIndex,
    pub stats: ParseStats,
    pub fetched_at: DateTime<Utc>,
}

impl IngestedPlaylist {
    /// Channels with their candidates, optionally restricted by category
    /// and country (country codes compare case-insensitively)
    pub fn filter_channels<'a>(
        &'a self,
        category: Option<&'a str>,
        country: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a Channel, &'a [Stream])> + 'a {
        self.index.iter().filter(move |(channel, _)| {
            let category_ok = category.map_or(true, |c| channel.categories.contains(c));
            let country_ok = country.map_or(true, |wanted| {
                channel
                    .country
                    .as_deref()
                    .map_or(false, |c| c.eq_ignore_ascii_case(wanted.trim()))
            });
            category_ok && country_ok
        })
    }

    /// Resolve a channel by display name along with its ordered candidates
    pub fn playback_candidates(&self, name: &str) -> AppResult<(&Channel, Vec<Stream>)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("channel name must not be empty"));
        }
        let channel = self
            .index
            .find_by_name(name)
            .ok_or_else(|| AppError::validation(format!("no channel named '{}'", name)))?;
        Ok((channel, self.index.candidates(&channel.id).to_vec()))
    }

    /// Write `channels.json` and `streams.json` into `dir`, creating it if needed
    pub async fn write_json(&self, dir: &Path) -> AppResult<(PathBuf, PathBuf)> {
        tokio::fs::create_dir_all(dir).await?;

        let channels_path = dir.join(CHANNELS_FILE);
        let streams_path = dir.join(STREAMS_FILE);
        tokio::fs::write(&channels_path, serde_json::to_string_pretty(&self.channels)?).await?;
        tokio::fs::write(&streams_path, serde_json::to_string_pretty(&self.streams)?).await?;

        info!(
            "Exported {} channels and {} streams to {}",
            self.channels.len(),
            self.streams.len(),
            dir.display()
        );
        Ok((channels_path, streams_path))
    }
}

pub struct IngestionPipeline {
    source: Arc<dyn PlaylistSource>,
    parser: M3uParser,
    normalizer: EntryNormalizer,
}

impl IngestionPipeline {
    pub fn new(source: Arc<dyn PlaylistSource>, normalizer: EntryNormalizer) -> Self {
        Self {
            source,
            parser: M3uParser::new(),
            normalizer,
        }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        let source = HttpPlaylistSource::from_config(config)?;
        Ok(Self::new(
            Arc::new(source),
            EntryNormalizer::new(config.logo_trust()),
        ))
    }

    /// Parse, normalize and index playlist text
    pub fn ingest_text(&self, content: &str) -> IngestedPlaylist {
        let (entries, stats) = self.parser.parse_with_stats(content);
        if stats.dropped_records > 0 || stats.orphan_lines > 0 {
            warn!(
                "Playlist had {} metadata records without URL and {} stray lines",
                stats.dropped_records, stats.orphan_lines
            );
        }

        let Normalized { channels, streams } = self.normalizer.normalize(&entries);
        let index = ChannelIndex::build(&channels, &streams);

        IngestedPlaylist {
            channels,
            streams,
            index,
            stats,
            fetched_at: Utc::now(),
        }
    }

    /// [`Self::ingest_text`] with the default logo trust list
    pub fn ingest_text_with_defaults(content: &str) -> IngestedPlaylist {
        Self::new(
            Arc::new(StaticPlaylistSource::new(String::new())),
            EntryNormalizer::default(),
        )
        .ingest_text(content)
    }

    /// Fetch and ingest, bypassing any cache
    pub async fn ingest(&self) -> AppResult<IngestedPlaylist> {
        let content = self.source.fetch().await?;
        let ingested = self.ingest_text(&content);
        info!(
            "Ingested {} streams into {} channels from {}",
            ingested.streams.len(),
            ingested.channels.len(),
            self.source.describe()
        );
        Ok(ingested)
    }

    /// Serve from the cache when fresh, otherwise fetch and repopulate it
    pub async fn load(&self, cache: &mut PlaylistCache) -> AppResult<Arc<IngestedPlaylist>> {
        if let Some(cached) = cache.get() {
            debug!(
                "Using cached playlist with {} channels",
                cached.index.channel_count()
            );
            return Ok(cached);
        }

        let ingested = self.ingest().await?;
        let fetched_at = ingested.fetched_at;
        Ok(cache.store_at(ingested, fetched_at))
    }

    /// Drop the cached copy and fetch again
    pub async fn refresh(&self, cache: &mut PlaylistCache) -> AppResult<Arc<IngestedPlaylist>> {
        cache.invalidate();
        self.load(cache).await
    }
}
