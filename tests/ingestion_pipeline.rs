use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use m3u_validator::errors::{AppError, SourceError, SourceResult};
use m3u_validator::ingestor::m3u_parser::parse;
use m3u_validator::ingestor::normalizer::normalize;
use m3u_validator::ingestor::{
    EntryNormalizer, IngestionPipeline, PlaylistCache, PlaylistSource, StaticPlaylistSource,
    CHANNELS_FILE, STREAMS_FILE,
};
use m3u_validator::models::{Channel, Stream};

const PLAYLIST: &str = concat!(
    "#EXTM3U x-tvg-url=\"http://epg.example.com/guide.xml\"\n",
    "#EXTINF:-1 tvg-id=\"cctv1\" tvg-name=\"CCTV1\" tvg-logo=\"http://cdn.example.com/cctv1.png\" group-title=\"央视;News\",CCTV-1 综合\n",
    "#EXTVLCOPT:http-user-agent=Mozilla/5.0 (IPTV)\n",
    "http://live.example.com/cctv1/index.m3u8\n",
    "#EXTINF:-1 tvg-logo=\"https://raw.githubusercontent.com/logos/cctv1.png\" http-referrer=\"http://portal.example.com/\",CCTV-1 综合\n",
    "http://backup.example.com/cctv1.ts\n",
    "#EXTINF:-1 group-title=\"Movies\",CHC 4K\n",
    "\n",
    "http://live.example.com/chc/index.m3u8\n",
    "#EXTINF:-1,Orphaned record\n",
    "#EXTINF:-1,Kids\n",
    "http://live.example.com/kids.flv\n",
);

/// Counts fetches so cache hits can be observed
struct CountingSource {
    inner: StaticPlaylistSource,
    fetches: AtomicUsize,
}

#[async_trait]
impl PlaylistSource for CountingSource {
    fn describe(&self) -> String {
        "counting".to_string()
    }

    async fn fetch(&self) -> SourceResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch().await
    }
}

struct DownSource;

#[async_trait]
impl PlaylistSource for DownSource {
    fn describe(&self) -> String {
        "http://origin.example.com/list.m3u".to_string()
    }

    async fn fetch(&self) -> SourceResult<String> {
        Err(SourceError::unreachable(self.describe(), "connection refused"))
    }
}

#[tokio::test]
async fn test_pipeline_produces_channels_streams_and_index() {
    let pipeline = IngestionPipeline::new(
        Arc::new(StaticPlaylistSource::new(PLAYLIST)),
        EntryNormalizer::default(),
    );
    let playlist = assert_ok!(pipeline.ingest().await);

    let names: Vec<&str> = playlist.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["CCTV-1 综合", "CHC 4K", "Kids"]);
    assert_eq!(playlist.streams.len(), 4);
    assert_eq!(playlist.stats.dropped_records, 1);

    let cctv = &playlist.channels[0];
    assert_eq!(
        cctv.categories,
        BTreeSet::from(["央视".to_string(), "News".to_string()])
    );
    assert_eq!(cctv.tvg_id.as_deref(), Some("cctv1"));
    // trusted host replaces an untrusted logo
    assert_eq!(cctv.logo_url, "https://raw.githubusercontent.com/logos/cctv1.png");
    assert!(playlist.channels[1].is_4k());

    let candidates = playlist.index.candidates(&cctv.id);
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].user_agent.as_deref(), Some("Mozilla/5.0 (IPTV)"));
    assert_eq!(candidates[0].http_referrer, None);
    assert_eq!(candidates[1].url, "http://backup.example.com/cctv1.ts");
    assert_eq!(
        candidates[1].http_referrer.as_deref(),
        Some("http://portal.example.com/")
    );
}

#[test]
fn test_parse_is_a_pure_function_of_input() {
    assert_eq!(parse(PLAYLIST), parse(PLAYLIST));
    assert_eq!(normalize(&parse(PLAYLIST)), normalize(&parse(PLAYLIST)));
}

#[test]
fn test_merge_scenario_from_two_entries() {
    let text = "#EXTM3U\n#EXTINF:-1 tvg-name=\"A\",Channel A\nhttp://x/a.m3u8\n#EXTINF:-1 group-title=\"News\",Channel A\nhttp://x/b.m3u8\n";
    let playlist = IngestionPipeline::ingest_text_with_defaults(text);

    assert_eq!(playlist.channels.len(), 1);
    let channel = &playlist.channels[0];
    assert_eq!(channel.name, "Channel A");
    assert_eq!(channel.categories, BTreeSet::from(["News".to_string()]));

    let urls: Vec<&str> = playlist
        .index
        .candidates(&channel.id)
        .iter()
        .map(|s| s.url.as_str())
        .collect();
    assert_eq!(urls, vec!["http://x/a.m3u8", "http://x/b.m3u8"]);
    assert!(playlist.streams.iter().all(|s| s.channel_id == channel.id));
}

#[tokio::test]
async fn test_cache_serves_until_invalidated() {
    let source = Arc::new(CountingSource {
        inner: StaticPlaylistSource::new(PLAYLIST),
        fetches: AtomicUsize::new(0),
    });
    let pipeline = IngestionPipeline::new(source.clone(), EntryNormalizer::default());
    let mut cache = PlaylistCache::new(Duration::from_secs(3600));

    let first = assert_ok!(pipeline.load(&mut cache).await);
    let second = assert_ok!(pipeline.load(&mut cache).await);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    let refreshed = assert_ok!(pipeline.refresh(&mut cache).await);
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_origin_is_a_hard_error() {
    let pipeline = IngestionPipeline::new(Arc::new(DownSource), EntryNormalizer::default());
    let mut cache = PlaylistCache::new(Duration::from_secs(3600));

    let err = assert_err!(pipeline.load(&mut cache).await);
    assert!(matches!(
        err,
        AppError::Source(SourceError::Unreachable { .. })
    ));
    assert!(cache.get().is_none());
}

#[test]
fn test_garbage_input_degrades_to_empty() {
    let playlist = IngestionPipeline::ingest_text_with_defaults("<html>not a playlist</html>\n\n");
    assert!(playlist.channels.is_empty());
    assert!(playlist.index.is_empty());
    assert_eq!(playlist.stats.orphan_lines, 1);
}

const COUNTRY_PLAYLIST: &str = concat!(
    "#EXTM3U\n",
    "#EXTINF:-1 tvg-country=\"CN\" group-title=\"News\",CCTV-13\n",
    "http://x/cctv13.m3u8\n",
    "#EXTINF:-1 tvg-country=\"HK\" group-title=\"News\",TVB News\n",
    "http://x/tvb.m3u8\n",
    "#EXTINF:-1 tvg-country=\"CN\" group-title=\"Movies\",CCTV-6\n",
    "http://x/cctv6.m3u8\n",
    "#EXTINF:-1 group-title=\"News\",No Country\n",
    "http://x/none.m3u8\n",
);

#[test]
fn test_filter_channels_by_country_and_category() {
    let playlist = IngestionPipeline::ingest_text_with_defaults(COUNTRY_PLAYLIST);

    let names = |category: Option<&str>, country: Option<&str>| -> Vec<String> {
        playlist
            .filter_channels(category, country)
            .map(|(c, _)| c.name.clone())
            .collect()
    };

    assert_eq!(names(None, Some("cn")), vec!["CCTV-13", "CCTV-6"]);
    assert_eq!(names(Some("News"), Some("CN")), vec!["CCTV-13"]);
    assert_eq!(names(Some("News"), None), vec!["CCTV-13", "TVB News", "No Country"]);
    assert!(names(None, Some("US")).is_empty());
    assert_eq!(names(None, None).len(), 4);
}

#[test]
fn test_playback_candidates_rejects_blank_and_unknown_names() {
    let playlist = IngestionPipeline::ingest_text_with_defaults(COUNTRY_PLAYLIST);

    let (channel, candidates) = assert_ok!(playlist.playback_candidates("  CCTV-6 "));
    assert_eq!(channel.name, "CCTV-6");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].url, "http://x/cctv6.m3u8");

    let blank = assert_err!(playlist.playback_candidates("   "));
    assert!(matches!(blank, AppError::Validation { .. }));
    let unknown = assert_err!(playlist.playback_candidates("CCTV-99"));
    assert!(matches!(unknown, AppError::Validation { .. }));
}

#[tokio::test]
async fn test_export_writes_channels_and_streams_json() {
    let playlist = IngestionPipeline::ingest_text_with_defaults(PLAYLIST);
    let dir = std::env::temp_dir().join(format!("m3u-validator-export-{}", std::process::id()));

    let (channels_path, streams_path) = assert_ok!(playlist.write_json(&dir).await);
    assert_eq!(channels_path, dir.join(CHANNELS_FILE));
    assert_eq!(streams_path, dir.join(STREAMS_FILE));

    let channels: Vec<Channel> =
        serde_json::from_str(&tokio::fs::read_to_string(&channels_path).await.unwrap()).unwrap();
    let streams: Vec<Stream> =
        serde_json::from_str(&tokio::fs::read_to_string(&streams_path).await.unwrap()).unwrap();
    assert_eq!(channels, playlist.channels);
    assert_eq!(streams, playlist.streams);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}
