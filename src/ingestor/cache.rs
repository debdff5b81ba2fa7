//! Explicit playlist cache
//!
//! The caller owns the cache and hands it to the ingestion pipeline. Nothing
//! is kept in process-wide state; dropping or invalidating the cache is the
//! only way data goes away.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::IngestedPlaylist;

#[derive(Debug, Clone)]
pub struct CachedPlaylist {
    pub data: Arc<IngestedPlaylist>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlaylistCache {
    ttl: Duration,
    entry: Option<CachedPlaylist>,
}

impl PlaylistCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Cached data if it is still within the TTL
    pub fn get(&self) -> Option<Arc<IngestedPlaylist>> {
        self.get_at(Utc::now())
    }

    pub fn get_at(&self, now: DateTime<Utc>) -> Option<Arc<IngestedPlaylist>> {
        self.entry
            .as_ref()
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.data.clone())
    }

    /// Replace the cached data, returning a shared handle to it
    pub fn store(&mut self, data: IngestedPlaylist) -> Arc<IngestedPlaylist> {
        self.store_at(data, Utc::now())
    }

    pub fn store_at(&mut self, data: IngestedPlaylist, fetched_at: DateTime<Utc>) -> Arc<IngestedPlaylist> {
        let data = Arc::new(data);
        self.entry = Some(CachedPlaylist {
            data: data.clone(),
            fetched_at,
        });
        data
    }

    pub fn invalidate(&mut self) {
        if self.entry.take().is_some() {
            debug!("Playlist cache invalidated");
        }
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.entry.as_ref().map(|entry| entry.fetched_at)
    }

    fn is_fresh(&self, entry: &CachedPlaylist, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now.signed_duration_since(entry.fetched_at) < ttl,
            Err(_) => true, // ttl beyond chrono range never expires
        }
    }
}
